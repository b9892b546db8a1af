use serde::{Deserialize, Serialize};

use crate::model::Proximity;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LocationPermission {
    #[default]
    NotDetermined,
    Denied,
    Granted,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RadioPermission {
    #[default]
    Unknown,
    PoweredOff,
    PoweredOn,
    Unauthorized,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegionState {
    Inside,
    Outside,
    Unknown,
}

/// A peer beacon seen in one ranging scan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservedBeacon {
    pub major: u16,
    pub minor: u16,
    pub rssi: i32,
    #[serde(default)]
    pub proximity: Proximity,
}

/// Everything the radio and location stack can report.
///
/// Serialized as one JSON object per event, e.g.
/// `{"event":"beacons_ranged","beacons":[{"major":1,"minor":2,"rssi":-60,"proximity":"near"}]}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RadioEvent {
    LocationAuthorization { status: LocationPermission },
    RadioState { state: RadioPermission },
    RegionEntered,
    RegionExited,
    RegionStateDetermined { state: RegionState },
    BeaconsRanged { beacons: Vec<ObservedBeacon> },
    RangingFailed { reason: String },
    MonitoringFailed { reason: String },
}

/// Receiver of radio callbacks, one method per event kind.
pub trait ProximityListener {
    fn location_authorization_changed(&mut self, status: LocationPermission);
    fn radio_state_changed(&mut self, state: RadioPermission);
    fn region_entered(&mut self);
    fn region_exited(&mut self);
    fn region_state_determined(&mut self, state: RegionState);
    fn beacons_ranged(&mut self, beacons: &[ObservedBeacon]);
    fn ranging_failed(&mut self, reason: &str);
    fn monitoring_failed(&mut self, reason: &str);
}

impl RadioEvent {
    pub fn dispatch<L: ProximityListener + ?Sized>(&self, listener: &mut L) {
        match self {
            RadioEvent::LocationAuthorization { status } => {
                listener.location_authorization_changed(*status)
            }
            RadioEvent::RadioState { state } => listener.radio_state_changed(*state),
            RadioEvent::RegionEntered => listener.region_entered(),
            RadioEvent::RegionExited => listener.region_exited(),
            RadioEvent::RegionStateDetermined { state } => listener.region_state_determined(*state),
            RadioEvent::BeaconsRanged { beacons } => listener.beacons_ranged(beacons),
            RadioEvent::RangingFailed { reason } => listener.ranging_failed(reason),
            RadioEvent::MonitoringFailed { reason } => listener.monitoring_failed(reason),
        }
    }
}
