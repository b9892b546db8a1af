//! Trailing throttle between the proximity machine and the store.
//!
//! Ranging reports arrive about once a second. Each new batch replaces the
//! pending one and at most one batch is written per interval, so only the
//! latest scan of a window reaches disk. Writes run on the blocking pool
//! since the store syncs to disk.

use std::sync::Arc;
use std::time::Duration;

use exposure_core::model::DiscoveryEvent;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::watch;
use tokio::task;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{DiscoverySink, RunningLoop};

pub struct DiscoveryFlushLoop {
    feed: broadcast::Sender<Vec<DiscoveryEvent>>,
    sink: Arc<dyn DiscoverySink>,
    interval: Duration,
    running: Option<RunningLoop>,
}

impl DiscoveryFlushLoop {
    pub fn new(
        feed: broadcast::Sender<Vec<DiscoveryEvent>>,
        sink: Arc<dyn DiscoverySink>,
        interval: Duration,
    ) -> Self {
        Self {
            feed,
            sink,
            interval,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(RunningLoop::is_alive)
    }

    /// Subscribes to the feed and starts flushing. No-op while running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_flush_loop(
            self.feed.subscribe(),
            self.sink.clone(),
            self.interval,
            shutdown_rx,
        ));
        self.running = Some(RunningLoop { task, shutdown_tx });
    }

    /// Stops the loop after writing any pending batch. No-op when stopped.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);
        if let Err(err) = running.task.await {
            warn!(error = %err, "discovery flush task ended abnormally");
        }
    }
}

async fn run_flush_loop(
    mut rx: broadcast::Receiver<Vec<DiscoveryEvent>>,
    sink: Arc<dyn DiscoverySink>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_ms = interval.as_millis() as u64, "discovery flush loop started");
    let mut pending: Option<Vec<DiscoveryEvent>> = None;
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            received = rx.recv() => match received {
                Ok(batch) => pending = Some(batch),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "discovery flush lagged behind the radio");
                }
                Err(RecvError::Closed) => {
                    debug!("discovery feed closed");
                    break;
                }
            },
            _ = ticker.tick() => {
                if let Some(batch) = pending.take() {
                    flush(&sink, batch).await;
                }
            }
        }
    }

    loop {
        match rx.try_recv() {
            Ok(batch) => pending = Some(batch),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    if let Some(batch) = pending.take() {
        flush(&sink, batch).await;
    }
    info!("discovery flush loop stopped");
}

async fn flush(sink: &Arc<dyn DiscoverySink>, batch: Vec<DiscoveryEvent>) {
    let count = batch.len();
    let sink = sink.clone();
    match task::spawn_blocking(move || sink.store_batch(&batch)).await {
        Ok(Ok(())) => debug!(count, "flushed discoveries"),
        Ok(Err(err)) => warn!(error = %err, count, "could not store discoveries"),
        Err(err) => warn!(error = %err, count, "discovery write task failed"),
    }
}
