use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use exposure_core::api::InfectedIdsFetcher;
use exposure_core::risk::{aggregate, DashboardSnapshot};
use exposure_core::session::SessionState;
use exposure_core::store::EventStore;
use tokio::sync::{watch, Notify};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::RunningLoop;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Nothing discovered yet, so nothing to match.
    Skipped,
    Updated(DashboardSnapshot),
}

/// Prunes expired discoveries, installs `ids` as the infected set and
/// publishes the recomputed snapshot. An empty `ids` keeps the previous set.
/// Self-report flags come from the session file as it is now, so a report
/// filed by another process is kept.
pub fn apply_infected_ids(
    store: &EventStore,
    session: &SessionState,
    ids: &[String],
) -> Result<DashboardSnapshot> {
    let removed = store
        .cleanup_expired_discoveries()
        .context("cleanup expired discoveries")?;
    if removed > 0 {
        debug!(removed, "pruned expired discoveries");
    }
    if !ids.is_empty() {
        store.store_infected(ids).context("store infected ids")?;
    }
    let met = store.distinct_peers_count() as u64;
    let infected_met = store.infected_peers_met_count() as u64;
    let snapshot = session
        .update_dashboard_with(|current| aggregate(met, infected_met, current.self_report()))
        .context("publish dashboard")?;
    info!(
        met = snapshot.met_count,
        infected_met = snapshot.infected_met_count,
        level = ?snapshot.risk_level(),
        "risk recomputed"
    );
    Ok(snapshot)
}

/// One refresh round: fetch and apply, unless nothing was discovered yet.
pub async fn refresh_once(
    store: &EventStore,
    session: &SessionState,
    fetcher: &dyn InfectedIdsFetcher,
) -> Result<RefreshOutcome> {
    if store.discovery_count() == 0 {
        return Ok(RefreshOutcome::Skipped);
    }
    let ids = fetcher.fetch().await.context("fetch infected ids")?;
    let snapshot = apply_infected_ids(store, session, &ids)?;
    Ok(RefreshOutcome::Updated(snapshot))
}

pub struct InfectedRefreshLoop {
    store: Arc<EventStore>,
    session: Arc<SessionState>,
    fetcher: Arc<dyn InfectedIdsFetcher>,
    interval: Duration,
    wake: Arc<Notify>,
    running: Option<RunningLoop>,
}

impl InfectedRefreshLoop {
    pub fn new(
        store: Arc<EventStore>,
        session: Arc<SessionState>,
        fetcher: Arc<dyn InfectedIdsFetcher>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            session,
            fetcher,
            interval,
            wake: Arc::new(Notify::new()),
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(RunningLoop::is_alive)
    }

    /// First round runs immediately, then every interval. No-op while running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_refresh_loop(
            self.store.clone(),
            self.session.clone(),
            self.fetcher.clone(),
            self.interval,
            self.wake.clone(),
            shutdown_rx,
        ));
        self.running = Some(RunningLoop { task, shutdown_tx });
    }

    /// Cancels the timer. A fetch already in flight finishes but its result
    /// is dropped.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown_tx.send(true);
        }
    }

    /// Runs a round now instead of waiting for the next tick.
    pub fn reload_now(&self) {
        self.wake.notify_one();
    }
}

async fn run_refresh_loop(
    store: Arc<EventStore>,
    session: Arc<SessionState>,
    fetcher: Arc<dyn InfectedIdsFetcher>,
    interval: Duration,
    wake: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "infected refresh loop started");
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            _ = wake.notified() => {
                debug!("infected refresh woken early");
                ticker.reset();
            }
            _ = ticker.tick() => {}
        }

        if store.discovery_count() == 0 {
            debug!("no discoveries yet, skipping refresh");
            continue;
        }

        let fetched = fetcher.fetch().await;
        if *shutdown_rx.borrow() {
            debug!("refresh loop stopped during fetch, discarding result");
            break;
        }
        match fetched {
            Ok(ids) => {
                if let Err(err) = apply_infected_ids(&store, &session, &ids) {
                    warn!(error = %err, "could not apply infected ids");
                }
            }
            Err(err) => warn!(error = %err, "fetching infected ids failed"),
        }
    }
    info!("infected refresh loop stopped");
}
