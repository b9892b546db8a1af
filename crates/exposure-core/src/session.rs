//! Small plaintext session file: the last dashboard snapshot, the last risk
//! level the user was told about, and the device registration.
//!
//! Snapshot changes are published on a `watch` channel so presentation and
//! the risk notifier always see the newest value.
//!
//! The CLI may write the file while a service holds it open, so every
//! mutation starts from what is on disk, not from the in-memory copy.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::watch;
use tracing::warn;

use crate::error::SessionError;
use crate::model::peer_id;
use crate::risk::{DashboardSnapshot, RiskLevel};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub major: u16,
    pub minor: u16,
    pub device_id: String,
    pub registered_at: DateTime<Utc>,
}

impl Registration {
    /// The identifier this device broadcasts and authorizes with.
    pub fn peer_id(&self) -> String {
        peer_id(self.major, self.minor)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    #[serde(default)]
    pub dashboard: DashboardSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_notified_risk_level: Option<RiskLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<Registration>,
}

#[derive(Debug)]
pub struct SessionState {
    path: PathBuf,
    data: RwLock<SessionData>,
    dashboard_tx: watch::Sender<DashboardSnapshot>,
}

impl SessionState {
    /// Loads the session; an unreadable file starts a fresh session.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match read_file(&path) {
            Ok(data) => data.unwrap_or_default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "session file unreadable, starting fresh");
                SessionData::default()
            }
        };
        let (dashboard_tx, _) = watch::channel(data.dashboard);
        Self {
            path,
            data: RwLock::new(data),
            dashboard_tx,
        }
    }

    pub fn dashboard(&self) -> DashboardSnapshot {
        self.data.read().dashboard
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardSnapshot> {
        self.dashboard_tx.subscribe()
    }

    /// Persists and publishes `snapshot`, replacing the previous one.
    pub fn update_dashboard(&self, snapshot: DashboardSnapshot) -> Result<(), SessionError> {
        self.update_dashboard_with(|_| snapshot).map(|_| ())
    }

    /// Derives the next snapshot from the one currently on disk, then
    /// persists and publishes it.
    pub fn update_dashboard_with(
        &self,
        next: impl FnOnce(&DashboardSnapshot) -> DashboardSnapshot,
    ) -> Result<DashboardSnapshot, SessionError> {
        self.mutate(|data| {
            data.dashboard = next(&data.dashboard);
            data.dashboard
        })
    }

    /// Last level the user was notified about; `Low` when never notified.
    pub fn last_notified_risk_level(&self) -> RiskLevel {
        self.data.read().last_notified_risk_level.unwrap_or_default()
    }

    pub fn set_last_notified_risk_level(&self, level: RiskLevel) -> Result<(), SessionError> {
        self.mutate(|data| data.last_notified_risk_level = Some(level))
    }

    pub fn registration(&self) -> Option<Registration> {
        self.data.read().registration.clone()
    }

    pub fn set_registration(&self, registration: Registration) -> Result<(), SessionError> {
        self.mutate(|data| data.registration = Some(registration))
    }

    /// Forgets everything, including the registration.
    pub fn clear(&self) -> Result<(), SessionError> {
        {
            let mut data = self.data.write();
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            *data = SessionData::default();
        }
        self.dashboard_tx.send_replace(DashboardSnapshot::default());
        Ok(())
    }

    fn mutate<T>(&self, apply: impl FnOnce(&mut SessionData) -> T) -> Result<T, SessionError> {
        let mut data = self.data.write();
        let mut next = match read_file(&self.path) {
            Ok(on_disk) => on_disk.unwrap_or_default(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "session file unreadable, keeping in-memory copy");
                data.clone()
            }
        };
        let out = apply(&mut next);
        self.save(&next)?;
        let dashboard = next.dashboard;
        *data = next;
        drop(data);
        self.dashboard_tx.send_if_modified(|current| {
            let changed = *current != dashboard;
            *current = dashboard;
            changed
        });
        Ok(out)
    }

    fn save(&self, data: &SessionData) -> Result<(), SessionError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(data)?)?;
        tmp.persist(&self.path).map_err(|e| SessionError::Io(e.error))?;
        Ok(())
    }
}

/// `None` when the file does not exist yet.
fn read_file(path: &Path) -> Result<Option<SessionData>, SessionError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::{aggregate, SelfReport};
    use tempfile::tempdir;

    #[test]
    fn fresh_session_defaults() {
        let dir = tempdir().unwrap();
        let session = SessionState::load(dir.path().join("session.json"));
        assert_eq!(session.dashboard(), DashboardSnapshot::default());
        assert_eq!(session.last_notified_risk_level(), RiskLevel::Low);
        assert!(session.registration().is_none());
    }

    #[test]
    fn dashboard_persists_and_publishes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let session = SessionState::load(&path);
        let mut rx = session.subscribe();

        let snapshot = aggregate(4, 2, SelfReport::default());
        session.update_dashboard(snapshot).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), snapshot);

        let reloaded = SessionState::load(&path);
        assert_eq!(reloaded.dashboard(), snapshot);
    }

    #[test]
    fn registration_and_notified_level_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let session = SessionState::load(&path);
        session
            .set_registration(Registration {
                major: 12,
                minor: 34,
                device_id: "device-1".into(),
                registered_at: Utc::now(),
            })
            .unwrap();
        session.set_last_notified_risk_level(RiskLevel::High).unwrap();

        let reloaded = SessionState::load(&path);
        assert_eq!(reloaded.registration().unwrap().peer_id(), "12:34");
        assert_eq!(reloaded.last_notified_risk_level(), RiskLevel::High);
    }

    #[test]
    fn self_report_from_another_handle_survives_recompute() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let running = SessionState::load(&path);
        let reporter = SessionState::load(&path);
        let infected = SelfReport {
            infected: true,
            recovered: false,
        };
        reporter.update_dashboard(aggregate(3, 0, infected)).unwrap();

        let mut rx = running.subscribe();
        let snapshot = running
            .update_dashboard_with(|current| aggregate(4, 1, current.self_report()))
            .unwrap();
        assert!(snapshot.self_reported_infected);
        assert_eq!(snapshot.risk_level(), RiskLevel::Infected);
        assert!(rx.has_changed().unwrap());
        assert!(SessionState::load(&path).dashboard().self_reported_infected);
    }

    #[test]
    fn setters_keep_fields_written_elsewhere() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let running = SessionState::load(&path);
        let other = SessionState::load(&path);
        other
            .update_dashboard(aggregate(9, 9, SelfReport::default()))
            .unwrap();

        running.set_last_notified_risk_level(RiskLevel::High).unwrap();
        let reloaded = SessionState::load(&path);
        assert_eq!(reloaded.dashboard().met_count, 9);
        assert_eq!(reloaded.last_notified_risk_level(), RiskLevel::High);
        assert_eq!(running.dashboard().met_count, 9);
    }

    #[test]
    fn garbage_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, b"{{{").unwrap();
        let session = SessionState::load(&path);
        assert_eq!(session.dashboard(), DashboardSnapshot::default());
    }

    #[test]
    fn clear_removes_file_and_resets_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let session = SessionState::load(&path);
        session
            .update_dashboard(aggregate(1, 1, SelfReport::default()))
            .unwrap();
        let rx = session.subscribe();
        session.clear().unwrap();
        assert!(!path.exists());
        assert_eq!(*rx.borrow(), DashboardSnapshot::default());
        assert_eq!(session.dashboard(), DashboardSnapshot::default());
    }
}
