use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use crate::store::StorePaths;

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "exposure";
pub const APP_NAME: &str = "exposure";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn session_path(data_dir: &Path) -> PathBuf {
    data_dir.join("session.json")
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

pub fn store_paths(data_dir: &Path) -> StorePaths {
    StorePaths::in_dir(data_dir)
}
