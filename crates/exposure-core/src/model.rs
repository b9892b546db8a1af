use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse distance bucket reported by the radio for a ranged beacon.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Proximity {
    #[default]
    Unknown,
    Immediate,
    Near,
    Far,
}

/// Identifier a peer broadcasts, `"major:minor"`.
pub fn peer_id(major: u16, minor: u16) -> String {
    format!("{major}:{minor}")
}

/// One observed proximity sample of a peer beacon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub peer_id: String,
    pub service_uuid: String,
    pub signal_strength: i32,
    pub proximity: Proximity,
    pub observed_at: DateTime<Utc>,
}

impl DiscoveryEvent {
    pub fn new(
        peer_id: impl Into<String>,
        service_uuid: impl Into<String>,
        signal_strength: i32,
        proximity: Proximity,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            service_uuid: service_uuid.into(),
            signal_strength,
            proximity,
            observed_at,
        }
    }

    /// Rough distance from RSSI, exponential fit against calibration samples.
    pub fn estimated_distance_meters(&self) -> f64 {
        let multiplier = (-0.0538911686 * f64::from(self.signal_strength)).exp();
        3.986383967 * multiplier * 0.01
    }

    pub fn is_close(&self) -> bool {
        self.signal_strength < 0 && self.signal_strength >= -70
    }
}
