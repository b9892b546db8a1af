//! Background loops that move data between the radio, the store and the server.
//!
//! * [`DiscoveryFlushLoop`] throttles ranged batches into the store.
//! * [`InfectedRefreshLoop`] periodically pulls infected ids and recomputes risk.

pub mod flush;
pub mod refresh;

pub use flush::DiscoveryFlushLoop;
pub use refresh::{apply_infected_ids, refresh_once, InfectedRefreshLoop, RefreshOutcome};

use exposure_core::error::StoreError;
use exposure_core::model::DiscoveryEvent;
use exposure_core::store::EventStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Destination of flushed discovery batches.
pub trait DiscoverySink: Send + Sync {
    fn store_batch(&self, events: &[DiscoveryEvent]) -> Result<(), StoreError>;
}

impl DiscoverySink for EventStore {
    fn store_batch(&self, events: &[DiscoveryEvent]) -> Result<(), StoreError> {
        self.store(events)
    }
}

/// A spawned loop and the switch that ends it.
struct RunningLoop {
    task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl RunningLoop {
    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}
