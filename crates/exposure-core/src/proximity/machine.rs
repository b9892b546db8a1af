//! Advertise / monitor / range lifecycle of the proximity beacon.
//!
//! The machine is owned by a single task (see [`run_event_loop`]); every
//! radio callback is applied to it in arrival order. Hardware is reached
//! only through [`BeaconRadio`], so a failing radio call is logged and the
//! machine carries on.

use anyhow::Result;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{
    LocationPermission, ObservedBeacon, ProximityListener, RadioEvent, RadioPermission, RegionState,
};
use crate::model::{peer_id, DiscoveryEvent};

const DISCOVERY_CHANNEL_CAPACITY: usize = 64;

/// What this device broadcasts and which region it watches for peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconIdentity {
    pub service_uuid: String,
    pub region_id: String,
    pub major: u16,
    pub minor: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementPayload {
    pub service_uuid: Uuid,
    pub major: u16,
    pub minor: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSpec {
    pub region_id: String,
    pub service_uuid: Uuid,
}

pub trait BeaconRadio: Send {
    fn start_advertising(&mut self, payload: &AdvertisementPayload) -> Result<()>;
    fn stop_advertising(&mut self) -> Result<()>;
    fn start_monitoring(&mut self, region: &RegionSpec) -> Result<()>;
    fn stop_monitoring(&mut self, region: &RegionSpec) -> Result<()>;
    fn start_ranging(&mut self, region: &RegionSpec) -> Result<()>;
    fn stop_ranging(&mut self, region: &RegionSpec) -> Result<()>;
}

/// Asks the user for the permissions scanning needs. Answers come back
/// later as [`RadioEvent`]s.
pub trait PermissionPrompter: Send {
    fn request_location_always(&mut self) -> Result<()>;
    fn request_radio_access(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    LocationDenied,
    RadioUnauthorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingRadioPowerOn,
    AdvertisingAndMonitoring,
    RangingActive,
    Blocked(BlockReason),
}

#[derive(Debug, Error)]
pub enum ProximityError {
    #[error("Configuration can only change while idle (currently {0:?})")]
    NotIdle(Phase),

    #[error("Beacon identity not configured")]
    NotConfigured,

    #[error("Invalid service UUID: {0}")]
    InvalidServiceUuid(String),

    #[error("Proximity scanning blocked: {0:?}")]
    Blocked(BlockReason),
}

#[derive(Debug, Clone)]
struct ActiveConfig {
    identity: BeaconIdentity,
    payload: AdvertisementPayload,
    region: RegionSpec,
}

pub struct ProximityStateMachine {
    radio: Box<dyn BeaconRadio>,
    prompter: Box<dyn PermissionPrompter>,
    config: Option<ActiveConfig>,
    phase: Phase,
    location: LocationPermission,
    radio_state: RadioPermission,
    advertising: bool,
    monitoring: bool,
    ranging: bool,
    discovery_tx: broadcast::Sender<Vec<DiscoveryEvent>>,
}

impl std::fmt::Debug for ProximityStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProximityStateMachine")
            .field("phase", &self.phase)
            .field("location", &self.location)
            .field("radio_state", &self.radio_state)
            .finish_non_exhaustive()
    }
}

impl ProximityStateMachine {
    pub fn new(radio: Box<dyn BeaconRadio>, prompter: Box<dyn PermissionPrompter>) -> Self {
        let (discovery_tx, _) = broadcast::channel(DISCOVERY_CHANNEL_CAPACITY);
        Self {
            radio,
            prompter,
            config: None,
            phase: Phase::Idle,
            location: LocationPermission::NotDetermined,
            radio_state: RadioPermission::Unknown,
            advertising: false,
            monitoring: false,
            ranging: false,
            discovery_tx,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn location_permission(&self) -> LocationPermission {
        self.location
    }

    pub fn radio_permission(&self) -> RadioPermission {
        self.radio_state
    }

    /// Sender side of the discovery feed; subscribe to it after the machine
    /// has moved into its event loop.
    pub fn discovery_feed(&self) -> broadcast::Sender<Vec<DiscoveryEvent>> {
        self.discovery_tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<DiscoveryEvent>> {
        self.discovery_tx.subscribe()
    }

    /// Sets the identity to advertise. Touches no hardware.
    pub fn configure(&mut self, identity: BeaconIdentity) -> Result<(), ProximityError> {
        if self.phase != Phase::Idle {
            return Err(ProximityError::NotIdle(self.phase));
        }
        let service_uuid = Uuid::parse_str(&identity.service_uuid)
            .map_err(|_| ProximityError::InvalidServiceUuid(identity.service_uuid.clone()))?;
        let payload = AdvertisementPayload {
            service_uuid,
            major: identity.major,
            minor: identity.minor,
        };
        let region = RegionSpec {
            region_id: identity.region_id.clone(),
            service_uuid,
        };
        self.config = Some(ActiveConfig {
            identity,
            payload,
            region,
        });
        Ok(())
    }

    pub fn request_permissions(&mut self) {
        if let Err(err) = self.prompter.request_location_always() {
            warn!(error = %err, "location permission request failed");
        }
        if let Err(err) = self.prompter.request_radio_access() {
            warn!(error = %err, "radio permission request failed");
        }
    }

    /// Leaves `Idle` and waits for the radio. Calling it while running is a no-op.
    pub fn start(&mut self) -> Result<(), ProximityError> {
        match self.phase {
            Phase::Blocked(reason) => return Err(ProximityError::Blocked(reason)),
            Phase::Idle => {}
            _ => return Ok(()),
        }
        if self.config.is_none() {
            return Err(ProximityError::NotConfigured);
        }
        self.phase = Phase::AwaitingRadioPowerOn;
        info!("proximity detection started");

        if self.location == LocationPermission::Denied {
            self.block(BlockReason::LocationDenied);
        } else if self.radio_state == RadioPermission::Unauthorized {
            self.block(BlockReason::RadioUnauthorized);
        } else if self.radio_state == RadioPermission::PoweredOn {
            self.begin_advertising();
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.halt_radio();
        if !matches!(self.phase, Phase::Blocked(_) | Phase::Idle) {
            self.phase = Phase::Idle;
            info!("proximity detection stopped");
        }
    }

    /// Leaves `Blocked` for `Idle` so a new session can start.
    pub fn clear_block(&mut self) {
        if matches!(self.phase, Phase::Blocked(_)) {
            self.phase = Phase::Idle;
        }
    }

    fn is_running(&self) -> bool {
        matches!(
            self.phase,
            Phase::AwaitingRadioPowerOn | Phase::AdvertisingAndMonitoring | Phase::RangingActive
        )
    }

    fn begin_advertising(&mut self) {
        let Some(config) = self.config.clone() else {
            return;
        };
        if self.advertising {
            if let Err(err) = self.radio.stop_advertising() {
                warn!(error = %err, "stop advertising failed");
            }
            self.advertising = false;
        }
        match self.radio.start_advertising(&config.payload) {
            Ok(()) => self.advertising = true,
            Err(err) => warn!(error = %err, "start advertising failed"),
        }
        self.ensure_monitoring(&config.region);
        self.phase = if self.ranging {
            Phase::RangingActive
        } else {
            Phase::AdvertisingAndMonitoring
        };
        info!(
            major = config.identity.major,
            minor = config.identity.minor,
            region = %config.region.region_id,
            "advertising and monitoring"
        );
    }

    fn ensure_monitoring(&mut self, region: &RegionSpec) {
        if self.monitoring {
            return;
        }
        match self.radio.start_monitoring(region) {
            Ok(()) => self.monitoring = true,
            Err(err) => warn!(error = %err, "start monitoring failed"),
        }
    }

    /// Starts ranging unless it is already on. A failed attempt leaves the
    /// phase alone so the next inside/entered callback tries again.
    fn enter_ranging(&mut self) {
        if self.ranging
            || !matches!(
                self.phase,
                Phase::AdvertisingAndMonitoring | Phase::RangingActive
            )
        {
            return;
        }
        let Some(config) = self.config.clone() else {
            return;
        };
        self.ensure_monitoring(&config.region);
        match self.radio.start_ranging(&config.region) {
            Ok(()) => {
                self.ranging = true;
                self.phase = Phase::RangingActive;
                debug!("ranging started");
            }
            Err(err) => warn!(error = %err, "start ranging failed, retrying on next region event"),
        }
    }

    fn leave_ranging(&mut self) {
        if self.phase != Phase::RangingActive {
            return;
        }
        self.stop_ranging();
        self.phase = Phase::AdvertisingAndMonitoring;
        debug!("ranging stopped");
    }

    fn stop_ranging(&mut self) {
        if !self.ranging {
            return;
        }
        if let Some(config) = self.config.as_ref() {
            if let Err(err) = self.radio.stop_ranging(&config.region) {
                warn!(error = %err, "stop ranging failed");
            }
        }
        self.ranging = false;
    }

    fn halt_radio(&mut self) {
        self.stop_ranging();
        if self.monitoring {
            if let Some(config) = self.config.as_ref() {
                if let Err(err) = self.radio.stop_monitoring(&config.region) {
                    warn!(error = %err, "stop monitoring failed");
                }
            }
            self.monitoring = false;
        }
        if self.advertising {
            if let Err(err) = self.radio.stop_advertising() {
                warn!(error = %err, "stop advertising failed");
            }
            self.advertising = false;
        }
    }

    fn block(&mut self, reason: BlockReason) {
        if self.phase == Phase::Blocked(reason) {
            return;
        }
        self.halt_radio();
        self.phase = Phase::Blocked(reason);
        warn!(?reason, "proximity detection blocked by permissions");
    }
}

impl ProximityListener for ProximityStateMachine {
    fn location_authorization_changed(&mut self, status: LocationPermission) {
        debug!(?status, "location authorization changed");
        self.location = status;
        if status == LocationPermission::Denied && self.phase != Phase::Idle {
            self.block(BlockReason::LocationDenied);
        }
    }

    fn radio_state_changed(&mut self, state: RadioPermission) {
        debug!(?state, "radio state changed");
        self.radio_state = state;
        match state {
            RadioPermission::Unauthorized if self.phase != Phase::Idle => {
                self.block(BlockReason::RadioUnauthorized)
            }
            RadioPermission::PoweredOn if self.is_running() => self.begin_advertising(),
            RadioPermission::PoweredOff if self.is_running() => {
                self.stop_ranging();
                // the radio drops advertising and monitoring when it powers off
                self.advertising = false;
                self.monitoring = false;
                self.phase = Phase::AwaitingRadioPowerOn;
            }
            _ => {}
        }
    }

    fn region_entered(&mut self) {
        debug!("region entered");
        self.enter_ranging();
    }

    fn region_exited(&mut self) {
        debug!("region exited");
        self.leave_ranging();
    }

    fn region_state_determined(&mut self, state: RegionState) {
        debug!(?state, "region state determined");
        match state {
            RegionState::Inside => self.enter_ranging(),
            RegionState::Outside => self.leave_ranging(),
            RegionState::Unknown => {}
        }
    }

    fn beacons_ranged(&mut self, beacons: &[ObservedBeacon]) {
        if self.phase != Phase::RangingActive || beacons.is_empty() {
            return;
        }
        let Some(config) = self.config.as_ref() else {
            return;
        };
        let now = Utc::now();
        let batch: Vec<DiscoveryEvent> = beacons
            .iter()
            .map(|beacon| {
                DiscoveryEvent::new(
                    peer_id(beacon.major, beacon.minor),
                    config.identity.service_uuid.clone(),
                    beacon.rssi,
                    beacon.proximity,
                    now,
                )
            })
            .collect();
        debug!(count = batch.len(), "beacons ranged");
        // no subscribers yet is fine
        let _ = self.discovery_tx.send(batch);
    }

    fn ranging_failed(&mut self, reason: &str) {
        warn!(reason, "ranging failed");
    }

    fn monitoring_failed(&mut self, reason: &str) {
        warn!(reason, "monitoring failed");
        // restarted by the next power-on or region callback
        self.monitoring = false;
    }
}

/// Applies radio events to `machine` until the feed closes or shutdown is
/// signalled, then stops the radio and hands the machine back.
pub async fn run_event_loop(
    mut machine: ProximityStateMachine,
    mut events: mpsc::Receiver<RadioEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> ProximityStateMachine {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => event.dispatch(&mut machine),
                None => {
                    debug!("radio event feed closed");
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    machine.stop();
    machine
}

pub fn spawn_event_loop(
    machine: ProximityStateMachine,
    events: mpsc::Receiver<RadioEvent>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<ProximityStateMachine> {
    tokio::spawn(run_event_loop(machine, events, shutdown))
}
