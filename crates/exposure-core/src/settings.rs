use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_SERVICE_UUID: &str = "43DB3082-A889-4510-902A-E99E5EDB9504";
pub const DEFAULT_REGION_ID: &str = "ExposureZone";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BeaconSettings {
    pub service_uuid: String,
    #[serde(default = "default_region_id")]
    pub region_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Minimum gap between two store writes of ranged discoveries.
    pub flush_interval_secs: u64,
    /// Period of the infected-identifier refresh.
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiSettings {
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExposureSettings {
    pub beacon: BeaconSettings,
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub api: ApiSettings,
}

fn default_region_id() -> String {
    DEFAULT_REGION_ID.to_string()
}

impl Default for ExposureSettings {
    fn default() -> Self {
        Self {
            beacon: BeaconSettings {
                service_uuid: DEFAULT_SERVICE_UUID.into(),
                region_id: default_region_id(),
            },
            scheduler: SchedulerSettings {
                flush_interval_secs: 5,
                refresh_interval_secs: 60,
            },
            api: ApiSettings::default(),
        }
    }
}

impl ExposureSettings {
    /// Reads settings from `path`, or the defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read settings {}", path.display()))?;
        let settings: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse settings {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if uuid::Uuid::parse_str(&self.beacon.service_uuid).is_err() {
            bail!("beacon.service_uuid is not a UUID: {}", self.beacon.service_uuid);
        }
        if self.beacon.region_id.trim().is_empty() {
            bail!("beacon.region_id must not be empty");
        }
        if self.scheduler.flush_interval_secs == 0 {
            bail!("scheduler.flush_interval_secs must be at least 1");
        }
        if self.scheduler.refresh_interval_secs == 0 {
            bail!("scheduler.refresh_interval_secs must be at least 1");
        }
        if let Some(url) = &self.api.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("api.base_url must be an http(s) URL");
            }
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.flush_interval_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.refresh_interval_secs)
    }
}
