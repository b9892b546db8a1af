use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use exposure_core::api::{ApiError, SelfReportSubmitter};
use exposure_core::model::{peer_id, DiscoveryEvent, Proximity};
use exposure_core::risk::{DashboardSnapshot, RiskLevel};
use exposure_core::session::SessionState;
use exposure_core::store::{EventStore, StorePaths};
use exposure_service::reporting::{report_infected, report_recovered, ReportError};
use parking_lot::Mutex;
use tempfile::tempdir;

enum Reply {
    Nothing,
    Snapshot(DashboardSnapshot),
    Unregistered,
}

struct ScriptedSubmitter {
    reply: Reply,
    seen: Mutex<Vec<(&'static str, DateTime<Utc>)>>,
}

impl ScriptedSubmitter {
    fn new(reply: Reply) -> Self {
        Self {
            reply,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn answer(&self) -> Result<Option<DashboardSnapshot>, ApiError> {
        match &self.reply {
            Reply::Nothing => Ok(None),
            Reply::Snapshot(snapshot) => Ok(Some(*snapshot)),
            Reply::Unregistered => Err(ApiError::NoAuthData),
        }
    }
}

#[async_trait]
impl SelfReportSubmitter for ScriptedSubmitter {
    async fn report_infected(
        &self,
        tested_at: DateTime<Utc>,
    ) -> Result<Option<DashboardSnapshot>, ApiError> {
        self.seen.lock().push(("infected", tested_at));
        self.answer()
    }

    async fn report_recovered(
        &self,
        tested_at: DateTime<Utc>,
    ) -> Result<Option<DashboardSnapshot>, ApiError> {
        self.seen.lock().push(("recovered", tested_at));
        self.answer()
    }
}

fn met(store: &EventStore, peers: u16) {
    let events: Vec<DiscoveryEvent> = (0..peers)
        .map(|minor| {
            DiscoveryEvent::new(peer_id(8, minor), "svc", -50, Proximity::Immediate, Utc::now())
        })
        .collect();
    store.store(&events).unwrap();
}

#[tokio::test]
async fn local_infected_flag_when_server_returns_nothing() {
    let dir = tempdir().unwrap();
    let store = EventStore::open_with_key(StorePaths::in_dir(dir.path()), &[1u8; 64]).unwrap();
    let session = SessionState::load(dir.path().join("session.json"));
    met(&store, 4);
    let submitter = ScriptedSubmitter::new(Reply::Nothing);
    let tested_at = Utc::now();

    let snapshot = report_infected(&submitter, &store, &session, tested_at)
        .await
        .unwrap();
    assert!(snapshot.self_reported_infected);
    assert_eq!(snapshot.met_count, 4);
    assert_eq!(snapshot.risk_level(), RiskLevel::Infected);
    assert_eq!(session.dashboard(), snapshot);
    assert_eq!(*submitter.seen.lock(), vec![("infected", tested_at)]);

    let snapshot = report_recovered(&submitter, &store, &session, Utc::now())
        .await
        .unwrap();
    assert!(snapshot.self_reported_infected);
    assert!(snapshot.self_reported_recovered);
    assert_eq!(snapshot.risk_level(), RiskLevel::Recovered);
    assert_eq!(snapshot.meter_position(), 0.01);
}

#[tokio::test]
async fn server_snapshot_supersedes_local_one() {
    let dir = tempdir().unwrap();
    let store = EventStore::open_with_key(StorePaths::in_dir(dir.path()), &[1u8; 64]).unwrap();
    let session = SessionState::load(dir.path().join("session.json"));
    met(&store, 2);
    let server = DashboardSnapshot {
        risk_score: 40,
        met_count: 0,
        infected_met_count: 40,
        self_reported_infected: false,
        self_reported_recovered: false,
    };
    let submitter = ScriptedSubmitter::new(Reply::Snapshot(server));

    let snapshot = report_infected(&submitter, &store, &session, Utc::now())
        .await
        .unwrap();
    assert_eq!(snapshot.risk_score, 40);
    assert_eq!(snapshot.met_count, 2);
    assert_eq!(snapshot.risk_level(), RiskLevel::Medium);
    assert_eq!(session.dashboard(), snapshot);
}

#[tokio::test]
async fn expired_infected_contact_no_longer_counts() {
    let dir = tempdir().unwrap();
    let store = EventStore::open_with_key(StorePaths::in_dir(dir.path()), &[1u8; 64]).unwrap();
    let session = SessionState::load(dir.path().join("session.json"));
    let now = Utc::now();
    store
        .store(&[
            DiscoveryEvent::new(peer_id(8, 0), "svc", -50, Proximity::Near, now - Duration::days(15)),
            DiscoveryEvent::new(peer_id(8, 1), "svc", -50, Proximity::Near, now),
        ])
        .unwrap();
    store.store_infected(&[peer_id(8, 0)]).unwrap();
    assert_eq!(store.infected_peers_met_count(), 1);

    let submitter = ScriptedSubmitter::new(Reply::Nothing);
    let snapshot = report_infected(&submitter, &store, &session, now)
        .await
        .unwrap();
    assert_eq!(snapshot.infected_met_count, 0);
    assert_eq!(snapshot.met_count, 2);
    assert_eq!(store.discovery_count(), 1);
}

#[tokio::test]
async fn recovery_keeps_infection_reported_by_another_handle() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.json");
    let store = EventStore::open_with_key(StorePaths::in_dir(dir.path()), &[1u8; 64]).unwrap();
    let stale = SessionState::load(&path);
    let other = SessionState::load(&path);
    let submitter = ScriptedSubmitter::new(Reply::Nothing);

    report_infected(&submitter, &store, &other, Utc::now())
        .await
        .unwrap();
    let snapshot = report_recovered(&submitter, &store, &stale, Utc::now())
        .await
        .unwrap();
    assert!(snapshot.self_reported_infected);
    assert_eq!(snapshot.risk_level(), RiskLevel::Recovered);
}

#[tokio::test]
async fn api_failure_leaves_session_untouched() {
    let dir = tempdir().unwrap();
    let store = EventStore::open_with_key(StorePaths::in_dir(dir.path()), &[1u8; 64]).unwrap();
    let session = SessionState::load(dir.path().join("session.json"));
    let submitter = ScriptedSubmitter::new(Reply::Unregistered);

    let err = report_infected(&submitter, &store, &session, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, ReportError::Api(ApiError::NoAuthData)));
    assert_eq!(session.dashboard(), DashboardSnapshot::default());
}
