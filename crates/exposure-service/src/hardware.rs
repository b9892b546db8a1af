//! Host-side stand-ins for the beacon radio.
//!
//! The service has no radio of its own. Radio callbacks are fed in as JSON
//! lines (see [`RadioEvent`]) and hardware commands are logged.

use anyhow::Result;
use exposure_core::proximity::{
    AdvertisementPayload, BeaconRadio, PermissionPrompter, RadioEvent, RegionSpec,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct LoggingRadio;

impl BeaconRadio for LoggingRadio {
    fn start_advertising(&mut self, payload: &AdvertisementPayload) -> Result<()> {
        info!(
            uuid = %payload.service_uuid,
            major = payload.major,
            minor = payload.minor,
            "start advertising"
        );
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<()> {
        info!("stop advertising");
        Ok(())
    }

    fn start_monitoring(&mut self, region: &RegionSpec) -> Result<()> {
        info!(region = %region.region_id, uuid = %region.service_uuid, "start monitoring");
        Ok(())
    }

    fn stop_monitoring(&mut self, region: &RegionSpec) -> Result<()> {
        info!(region = %region.region_id, "stop monitoring");
        Ok(())
    }

    fn start_ranging(&mut self, region: &RegionSpec) -> Result<()> {
        debug!(region = %region.region_id, "start ranging");
        Ok(())
    }

    fn stop_ranging(&mut self, region: &RegionSpec) -> Result<()> {
        debug!(region = %region.region_id, "stop ranging");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LoggingPrompter;

impl PermissionPrompter for LoggingPrompter {
    fn request_location_always(&mut self) -> Result<()> {
        info!("location permission requested");
        Ok(())
    }

    fn request_radio_access(&mut self) -> Result<()> {
        info!("radio permission requested");
        Ok(())
    }
}

/// Reads one [`RadioEvent`] per line from `reader` into `events`.
///
/// Blank lines are skipped and malformed lines are logged. The task ends at
/// end of input or when the receiver goes away.
pub fn spawn_event_feed<R>(reader: R, events: mpsc::Sender<RadioEvent>) -> JoinHandle<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "radio event input failed");
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<RadioEvent>(trimmed) {
                Ok(event) => {
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "ignoring malformed radio event"),
            }
        }
        debug!("radio event feed finished");
    })
}
