use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use exposure_core::api::{ApiError, InfectedIdsFetcher};
use exposure_core::error::StoreError;
use exposure_core::model::{peer_id, DiscoveryEvent, Proximity};
use exposure_core::risk::{aggregate, DashboardSnapshot, RiskLevel, SelfReport};
use exposure_core::session::SessionState;
use exposure_core::store::{EventStore, StorePaths};
use exposure_service::scheduler::{
    refresh_once, DiscoveryFlushLoop, DiscoverySink, InfectedRefreshLoop, RefreshOutcome,
};
use parking_lot::Mutex;
use tempfile::{tempdir, TempDir};
use tokio::sync::{broadcast, Notify};
use tokio::time::sleep;

const SERVICE: &str = "43DB3082-A889-4510-902A-E99E5EDB9504";

fn event(major: u16, minor: u16) -> DiscoveryEvent {
    DiscoveryEvent::new(peer_id(major, minor), SERVICE, -60, Proximity::Near, Utc::now())
}

#[derive(Default)]
struct RecordingSink {
    batches: Mutex<Vec<Vec<DiscoveryEvent>>>,
}

impl RecordingSink {
    fn peer_ids(&self) -> Vec<Vec<String>> {
        self.batches
            .lock()
            .iter()
            .map(|b| b.iter().map(|e| e.peer_id.clone()).collect())
            .collect()
    }
}

impl DiscoverySink for RecordingSink {
    fn store_batch(&self, events: &[DiscoveryEvent]) -> Result<(), StoreError> {
        self.batches.lock().push(events.to_vec());
        Ok(())
    }
}

/// Blocks its thread until released, like a slow disk.
struct StalledSink {
    release: Mutex<mpsc::Receiver<()>>,
    released: AtomicBool,
}

impl DiscoverySink for StalledSink {
    fn store_batch(&self, _events: &[DiscoveryEvent]) -> Result<(), StoreError> {
        let released = self
            .release
            .lock()
            .recv_timeout(Duration::from_secs(2))
            .is_ok();
        self.released.store(released, Ordering::SeqCst);
        Ok(())
    }
}

struct Fixture {
    dir: TempDir,
    store: Arc<EventStore>,
    session: Arc<SessionState>,
}

fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let store = EventStore::open_with_key(StorePaths::in_dir(dir.path()), &[3u8; 64]).unwrap();
    let session = SessionState::load(dir.path().join("session.json"));
    Fixture {
        dir,
        store: Arc::new(store),
        session: Arc::new(session),
    }
}

#[derive(Default)]
struct StaticFetcher {
    ids: Vec<String>,
    fail: bool,
    calls: AtomicUsize,
}

impl StaticFetcher {
    fn returning(ids: &[&str]) -> Self {
        Self {
            ids: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InfectedIdsFetcher for StaticFetcher {
    async fn fetch(&self) -> Result<Vec<String>, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ApiError::Transport("connection refused".into()));
        }
        Ok(self.ids.clone())
    }
}

struct GatedFetcher {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl InfectedIdsFetcher for GatedFetcher {
    async fn fetch(&self) -> Result<Vec<String>, ApiError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(vec!["1:1".to_string()])
    }
}

#[tokio::test(start_paused = true)]
async fn ten_batches_in_one_second_flush_once_with_latest() {
    let (feed, _) = broadcast::channel(64);
    let sink = Arc::new(RecordingSink::default());
    let mut flush = DiscoveryFlushLoop::new(feed.clone(), sink.clone(), Duration::from_secs(5));
    flush.start();

    for minor in 0..10 {
        feed.send(vec![event(1, minor)]).unwrap();
        sleep(Duration::from_millis(100)).await;
    }
    sleep(Duration::from_secs(5)).await;
    assert_eq!(sink.peer_ids(), vec![vec!["1:9".to_string()]]);

    sleep(Duration::from_secs(20)).await;
    flush.stop().await;
    assert_eq!(sink.batches.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn batches_in_separate_windows_are_all_flushed() {
    let (feed, _) = broadcast::channel(64);
    let sink = Arc::new(RecordingSink::default());
    let mut flush = DiscoveryFlushLoop::new(feed.clone(), sink.clone(), Duration::from_secs(5));
    flush.start();

    feed.send(vec![event(1, 1), event(1, 2)]).unwrap();
    sleep(Duration::from_secs(6)).await;
    feed.send(vec![event(2, 1)]).unwrap();
    sleep(Duration::from_secs(6)).await;

    assert_eq!(
        sink.peer_ids(),
        vec![
            vec!["1:1".to_string(), "1:2".to_string()],
            vec!["2:1".to_string()]
        ]
    );
    flush.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_flushes_pending_batch() {
    let (feed, _) = broadcast::channel(64);
    let sink = Arc::new(RecordingSink::default());
    let mut flush = DiscoveryFlushLoop::new(feed.clone(), sink.clone(), Duration::from_secs(5));
    flush.start();

    feed.send(vec![event(4, 4)]).unwrap();
    feed.send(vec![event(4, 5)]).unwrap();
    flush.stop().await;

    assert_eq!(sink.peer_ids(), vec![vec!["4:5".to_string()]]);
    assert!(!flush.is_running());
    flush.stop().await;
}

#[tokio::test(start_paused = true)]
async fn start_is_idempotent() {
    let (feed, _) = broadcast::channel(64);
    let sink = Arc::new(RecordingSink::default());
    let mut flush = DiscoveryFlushLoop::new(feed.clone(), sink.clone(), Duration::from_secs(5));
    flush.start();
    flush.start();
    assert_eq!(feed.receiver_count(), 1);

    feed.send(vec![event(9, 9)]).unwrap();
    sleep(Duration::from_secs(6)).await;
    assert_eq!(sink.batches.lock().len(), 1);
    flush.stop().await;
}

#[tokio::test]
async fn slow_write_does_not_stall_the_runtime() {
    let (release_tx, release_rx) = mpsc::channel();
    let sink = Arc::new(StalledSink {
        release: Mutex::new(release_rx),
        released: AtomicBool::new(false),
    });
    let (feed, _) = broadcast::channel(64);
    let mut flush = DiscoveryFlushLoop::new(feed.clone(), sink.clone(), Duration::from_millis(10));
    flush.start();

    feed.send(vec![event(6, 1)]).unwrap();
    // only reachable while the write sits on another thread
    sleep(Duration::from_millis(50)).await;
    release_tx.send(()).unwrap();
    flush.stop().await;
    assert!(sink.released.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn flushed_batches_reach_the_store() {
    let fx = fixture();
    let (feed, _) = broadcast::channel(64);
    let mut flush = DiscoveryFlushLoop::new(feed.clone(), fx.store.clone(), Duration::from_secs(5));
    flush.start();

    feed.send(vec![event(10, 1), event(10, 2)]).unwrap();
    sleep(Duration::from_secs(6)).await;
    flush.stop().await;

    assert_eq!(fx.store.discovery_count(), 2);
    assert_eq!(fx.store.distinct_peers_count(), 2);
}

#[tokio::test]
async fn refresh_skips_without_discoveries() {
    let fx = fixture();
    let fetcher = StaticFetcher::returning(&["1:1"]);
    let outcome = refresh_once(&fx.store, &fx.session, &fetcher).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Skipped);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn refresh_scores_met_infected_peers() {
    let fx = fixture();
    fx.store
        .store(&[event(10, 1), event(10, 2), event(10, 3)])
        .unwrap();
    let fetcher = StaticFetcher::returning(&["10:2", "77:7"]);
    let mut updates = fx.session.subscribe();

    let outcome = refresh_once(&fx.store, &fx.session, &fetcher).await.unwrap();
    let RefreshOutcome::Updated(snapshot) = outcome else {
        panic!("expected an update, got {outcome:?}");
    };
    assert_eq!(snapshot.met_count, 3);
    assert_eq!(snapshot.infected_met_count, 1);
    assert_eq!(snapshot.risk_score, 1);
    assert_eq!(snapshot.risk_level(), RiskLevel::Low);
    assert_eq!(fx.session.dashboard(), snapshot);
    assert!(updates.has_changed().unwrap());
}

#[tokio::test]
async fn refresh_keeps_self_report_filed_by_another_handle() {
    let fx = fixture();
    fx.store.store(&[event(10, 1), event(10, 2)]).unwrap();
    let reporter = SessionState::load(fx.dir.path().join("session.json"));
    reporter
        .update_dashboard(aggregate(
            2,
            0,
            SelfReport {
                infected: true,
                recovered: false,
            },
        ))
        .unwrap();
    assert!(!fx.session.dashboard().self_reported_infected);

    let fetcher = StaticFetcher::returning(&["10:1"]);
    let outcome = refresh_once(&fx.store, &fx.session, &fetcher).await.unwrap();
    let RefreshOutcome::Updated(snapshot) = outcome else {
        panic!("expected an update, got {outcome:?}");
    };
    assert!(snapshot.self_reported_infected);
    assert_eq!(snapshot.risk_level(), RiskLevel::Infected);
    assert!(
        SessionState::load(fx.dir.path().join("session.json"))
            .dashboard()
            .self_reported_infected
    );
}

#[tokio::test]
async fn empty_id_list_keeps_previous_set() {
    let fx = fixture();
    fx.store.store(&[event(10, 1), event(10, 2)]).unwrap();
    fx.store.store_infected(&["10:1".to_string()]).unwrap();

    let fetcher = StaticFetcher::returning(&[]);
    let outcome = refresh_once(&fx.store, &fx.session, &fetcher).await.unwrap();
    let RefreshOutcome::Updated(snapshot) = outcome else {
        panic!("expected an update, got {outcome:?}");
    };
    assert_eq!(snapshot.infected_met_count, 1);
}

#[tokio::test(start_paused = true)]
async fn refresh_loop_ticks_immediately_then_every_interval() {
    let fx = fixture();
    fx.store.store(&[event(10, 1), event(10, 2)]).unwrap();
    let fetcher = Arc::new(StaticFetcher::returning(&["10:1"]));
    let mut refresh = InfectedRefreshLoop::new(
        fx.store.clone(),
        fx.session.clone(),
        fetcher.clone(),
        Duration::from_secs(60),
    );
    refresh.start();
    refresh.start();

    sleep(Duration::from_millis(10)).await;
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(fx.session.dashboard().infected_met_count, 1);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(fetcher.calls(), 2);

    refresh.reload_now();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(fetcher.calls(), 3);

    refresh.stop();
    sleep(Duration::from_secs(300)).await;
    assert_eq!(fetcher.calls(), 3);
    assert!(!refresh.is_running());
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_keeps_loop_alive() {
    let fx = fixture();
    fx.store.store(&[event(10, 1)]).unwrap();
    let fetcher = Arc::new(StaticFetcher {
        fail: true,
        ..Default::default()
    });
    let mut refresh = InfectedRefreshLoop::new(
        fx.store.clone(),
        fx.session.clone(),
        fetcher.clone(),
        Duration::from_secs(60),
    );
    refresh.start();

    sleep(Duration::from_secs(61)).await;
    assert_eq!(fetcher.calls(), 2);
    assert!(refresh.is_running());
    assert_eq!(fx.session.dashboard(), DashboardSnapshot::default());
    refresh.stop();
}

#[tokio::test(start_paused = true)]
async fn stopping_discards_fetch_in_flight() {
    let fx = fixture();
    fx.store.store(&[event(1, 1)]).unwrap();
    let fetcher = Arc::new(GatedFetcher {
        started: Notify::new(),
        release: Notify::new(),
    });
    let mut refresh = InfectedRefreshLoop::new(
        fx.store.clone(),
        fx.session.clone(),
        fetcher.clone(),
        Duration::from_secs(60),
    );
    refresh.start();

    fetcher.started.notified().await;
    refresh.stop();
    fetcher.release.notify_one();
    sleep(Duration::from_secs(1)).await;

    assert_eq!(fx.store.infected_count(), 0);
    assert_eq!(fx.session.dashboard(), DashboardSnapshot::default());
}
