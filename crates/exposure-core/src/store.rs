//! Encrypted, retention-bounded event store.
//!
//! One file holds every discovery and the cached infected-identifier set:
//!
//! ```text
//! [ 0.. 8]  magic "EXPOSTR1"
//! [ 8..12]  format version, little endian
//! [12..36]  XChaCha20 nonce, fresh on every write
//! [36..64]  zero
//! [64..  ]  XChaCha20-Poly1305 ciphertext of the JSON payload
//! ```
//!
//! Every mutation builds the next payload, writes it to a temp file beside
//! the store and renames it over the old one; memory is only updated once the
//! rename succeeds. Readers share the `RwLock`, writers hold it exclusively.
//!
//! A process holds an exclusive advisory lock on `events.store.lock` for
//! as long as its `EventStore` lives; a second open fails with
//! [`StoreError::Locked`] instead of writing over a stale copy.
//!
//! Installs that predate encryption keep a plaintext JSON file (plus lock and
//! management sidecars). It is copied into the encrypted file once and then
//! removed.

use crate::api::SecretKeyProvider;
use crate::crypto::{StoreCipher, NONCE_LEN};
use crate::error::StoreError;
use crate::model::DiscoveryEvent;
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

pub const STORE_MAGIC: &[u8; 8] = b"EXPOSTR1";
pub const STORE_FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 64;
pub const RETENTION_DAYS: i64 = 14;

const ENCRYPTED_FILE_NAME: &str = "events.store";
const LEGACY_FILE_NAME: &str = "default.store";
const LOCK_SUFFIX: &str = ".lock";
const LEGACY_SIDECARS: [&str; 3] = ["lock", "note", "management"];

#[derive(Debug, Clone)]
pub struct StorePaths {
    pub encrypted: PathBuf,
    pub legacy: PathBuf,
}

impl StorePaths {
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            encrypted: dir.as_ref().join(ENCRYPTED_FILE_NAME),
            legacy: dir.as_ref().join(LEGACY_FILE_NAME),
        }
    }

    /// Advisory lock file beside the encrypted store.
    pub fn lock_file(&self) -> PathBuf {
        let mut name = self.encrypted.as_os_str().to_os_string();
        name.push(LOCK_SUFFIX);
        PathBuf::from(name)
    }

    /// The legacy data file followed by its sidecars.
    pub fn legacy_artifacts(&self) -> Vec<PathBuf> {
        let mut artifacts = vec![self.legacy.clone()];
        if let Some(name) = self.legacy.file_name() {
            for ext in LEGACY_SIDECARS {
                let mut sidecar = name.to_os_string();
                sidecar.push(".");
                sidecar.push(ext);
                artifacts.push(self.legacy.with_file_name(sidecar));
            }
        }
        artifacts
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StorePayload {
    #[serde(default)]
    discoveries: Vec<DiscoveryEvent>,
    #[serde(default)]
    infected: BTreeSet<String>,
    /// Every peer ever stored; survives retention cleanup.
    #[serde(default)]
    met_peers: BTreeSet<String>,
}

impl StorePayload {
    fn normalize(&mut self) {
        let seen: Vec<String> = self
            .discoveries
            .iter()
            .map(|d| d.peer_id.clone())
            .collect();
        self.met_peers.extend(seen);
    }
}

#[derive(Debug, Clone)]
struct StoreHeader {
    version: u32,
    nonce: [u8; NONCE_LEN],
}

impl StoreHeader {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[..8].copy_from_slice(STORE_MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..12 + NONCE_LEN].copy_from_slice(&self.nonce);
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self, StoreError> {
        if buf.len() < HEADER_SIZE {
            return Err(StoreError::Corrupt("file shorter than header".into()));
        }
        if &buf[..8] != STORE_MAGIC {
            return Err(StoreError::Corrupt("invalid magic".into()));
        }
        let version = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if version != STORE_FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion(version));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&buf[12..12 + NONCE_LEN]);
        Ok(Self { version, nonce })
    }
}

pub struct EventStore {
    paths: StorePaths,
    cipher: StoreCipher,
    state: RwLock<StorePayload>,
    // released when the store is dropped
    _lock: File,
}

impl fmt::Debug for EventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStore")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl EventStore {
    /// Opens the store, asking `keys` for the key exactly once.
    ///
    /// An existing encrypted file that cannot be decrypted is returned as
    /// [`StoreError::Corrupt`]; callers must treat that as fatal.
    pub fn open(paths: StorePaths, keys: &dyn SecretKeyProvider) -> Result<Self, StoreError> {
        let blob = keys
            .get_or_create_key()
            .map_err(|e| StoreError::KeyUnavailable(e.to_string()))?;
        Self::open_with_key(paths, &blob)
    }

    pub fn open_with_key(paths: StorePaths, key_blob: &[u8]) -> Result<Self, StoreError> {
        let cipher = StoreCipher::from_blob(key_blob).map_err(|e| StoreError::Crypto(e.to_string()))?;
        if let Some(parent) = paths.encrypted.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock = acquire_lock(&paths.lock_file())?;
        let mut store = Self {
            paths,
            cipher,
            state: RwLock::new(StorePayload::default()),
            _lock: lock,
        };
        store.migrate_legacy_if_needed();

        let payload = if store.paths.encrypted.exists() {
            store.read_encrypted()?
        } else {
            let fresh = StorePayload::default();
            store.persist(&fresh)?;
            fresh
        };
        info!(
            path = %store.paths.encrypted.display(),
            discoveries = payload.discoveries.len(),
            infected = payload.infected.len(),
            "event store opened"
        );
        *store.state.get_mut() = payload;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.paths.encrypted
    }

    /// Appends all events in one transaction. Empty input is a no-op.
    pub fn store(&self, events: &[DiscoveryEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        if events.iter().any(|e| e.peer_id.trim().is_empty()) {
            return Err(StoreError::EmptyPeerId);
        }
        self.write(|payload| {
            for event in events {
                payload.met_peers.insert(event.peer_id.clone());
                payload.discoveries.push(event.clone());
            }
        })?;
        debug!(count = events.len(), "stored discoveries");
        Ok(())
    }

    /// Replaces the infected-identifier set with `ids`.
    pub fn store_infected(&self, ids: &[String]) -> Result<(), StoreError> {
        let replacement: BTreeSet<String> = ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        let count = replacement.len();
        self.write(move |payload| payload.infected = replacement)?;
        debug!(count, "replaced infected identifiers");
        Ok(())
    }

    pub fn clear_infected(&self) -> Result<(), StoreError> {
        self.write(|payload| payload.infected.clear())
    }

    pub fn cleanup_expired_discoveries(&self) -> Result<usize, StoreError> {
        self.cleanup_expired_discoveries_at(Utc::now())
    }

    /// Drops discoveries observed before `now` minus the retention window.
    pub fn cleanup_expired_discoveries_at(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = now - Duration::days(RETENTION_DAYS);
        let expired = self
            .state
            .read()
            .discoveries
            .iter()
            .filter(|d| d.observed_at < cutoff)
            .count();
        if expired == 0 {
            return Ok(0);
        }
        let removed = self.write(|payload| {
            let before = payload.discoveries.len();
            payload.discoveries.retain(|d| d.observed_at >= cutoff);
            before - payload.discoveries.len()
        })?;
        debug!(removed, "removed expired discoveries");
        Ok(removed)
    }

    /// Distinct peers ever stored, independent of retention.
    pub fn distinct_peers_count(&self) -> usize {
        self.state.read().met_peers.len()
    }

    /// Distinct retained peers whose id is in the infected set.
    pub fn infected_peers_met_count(&self) -> usize {
        let state = self.state.read();
        state
            .discoveries
            .iter()
            .map(|d| d.peer_id.as_str())
            .filter(|id| state.infected.contains(*id))
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn discovery_count(&self) -> usize {
        self.state.read().discoveries.len()
    }

    pub fn infected_count(&self) -> usize {
        self.state.read().infected.len()
    }

    /// Most recent discoveries first.
    pub fn recent_discoveries(&self, limit: usize) -> Vec<DiscoveryEvent> {
        let mut discoveries = self.state.read().discoveries.clone();
        discoveries.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
        discoveries.truncate(limit);
        discoveries
    }

    pub fn wipe_all(&self) -> Result<(), StoreError> {
        self.write(|payload| *payload = StorePayload::default())?;
        info!("event store wiped");
        Ok(())
    }

    fn write<T>(&self, mutate: impl FnOnce(&mut StorePayload) -> T) -> Result<T, StoreError> {
        let mut guard = self.state.write();
        let mut next = guard.clone();
        let out = mutate(&mut next);
        self.persist(&next)?;
        *guard = next;
        Ok(out)
    }

    fn persist(&self, payload: &StorePayload) -> Result<(), StoreError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
        let (nonce, ciphertext) = self
            .cipher
            .seal(&plaintext)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;
        let header = StoreHeader {
            version: STORE_FORMAT_VERSION,
            nonce,
        };

        let dir = match self.paths.encrypted.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&header.to_bytes())?;
        tmp.write_all(&ciphertext)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.paths.encrypted)
            .map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    fn read_encrypted(&self) -> Result<StorePayload, StoreError> {
        let bytes = fs::read(&self.paths.encrypted)?;
        let header = StoreHeader::from_bytes(&bytes)?;
        let plaintext = self
            .cipher
            .open(&header.nonce, &bytes[HEADER_SIZE..])
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut payload: StorePayload = serde_json::from_slice(&plaintext)
            .map_err(|e| StoreError::Corrupt(format!("parse payload: {e}")))?;
        payload.normalize();
        Ok(payload)
    }

    fn migrate_legacy_if_needed(&self) {
        if !self.paths.legacy.exists() || self.paths.encrypted.exists() {
            return;
        }
        info!(
            legacy = %self.paths.legacy.display(),
            "unencrypted store found, converting to encrypted"
        );
        match self.copy_legacy_to_encrypted() {
            Ok(count) => {
                info!(discoveries = count, "legacy store converted");
                self.remove_legacy_artifacts();
            }
            Err(err) => {
                error!(
                    error = %err,
                    "cannot convert unencrypted store, continuing with a new empty one"
                );
            }
        }
    }

    fn copy_legacy_to_encrypted(&self) -> Result<usize, StoreError> {
        let bytes = fs::read(&self.paths.legacy)?;
        let mut payload: StorePayload = serde_json::from_slice(&bytes)?;
        payload.normalize();
        self.persist(&payload)?;
        Ok(payload.discoveries.len())
    }

    fn remove_legacy_artifacts(&self) {
        for artifact in self.paths.legacy_artifacts() {
            if !artifact.exists() {
                continue;
            }
            if let Err(err) = fs::remove_file(&artifact) {
                warn!(path = %artifact.display(), error = %err, "could not remove legacy store file");
            }
        }
    }
}

fn acquire_lock(path: &Path) -> Result<File, StoreError> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
            warn!(path = %path.display(), "event store is locked by another handle");
            Err(StoreError::Locked(path.to_path_buf()))
        }
        Err(err) => Err(err.into()),
    }
}
