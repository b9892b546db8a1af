//! Collaborators the core consumes but does not implement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::risk::{DashboardSnapshot, RiskLevel};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No authorization data; device is not registered")]
    NoAuthData,

    #[error("Server rejected request ({status}): {message}")]
    InvalidResponse { status: u16, message: String },

    #[error("Wrong response code: {status}")]
    InvalidResponseCode { status: u16, body: Option<String> },

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Could not decode response: {0}")]
    Decode(String),
}

/// Beacon numbers the server assigned to a device, plus its dashboard if
/// the server already knows one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationGrant {
    pub major: u16,
    pub minor: u16,
    pub status: Option<DashboardSnapshot>,
}

#[async_trait]
pub trait DeviceRegistrar: Send + Sync {
    /// Needs no authorization; the device id is the only input.
    async fn register(&self, device_id: &str) -> Result<RegistrationGrant, ApiError>;
}

#[async_trait]
pub trait InfectedIdsFetcher: Send + Sync {
    /// Peer ids the server currently lists as infected.
    async fn fetch(&self) -> Result<Vec<String>, ApiError>;
}

#[async_trait]
pub trait SelfReportSubmitter: Send + Sync {
    /// A returned snapshot supersedes the locally computed one.
    async fn report_infected(
        &self,
        tested_at: DateTime<Utc>,
    ) -> Result<Option<DashboardSnapshot>, ApiError>;

    async fn report_recovered(
        &self,
        tested_at: DateTime<Utc>,
    ) -> Result<Option<DashboardSnapshot>, ApiError>;
}

/// Holder of the 64-byte store key. Generates it once and keeps returning it.
pub trait SecretKeyProvider: Send + Sync {
    fn get_or_create_key(&self) -> anyhow::Result<Zeroizing<Vec<u8>>>;
}

#[async_trait]
pub trait RiskNotifier: Send + Sync {
    /// Err means the user was not told; the level is not recorded as notified.
    async fn risk_level_changed(&self, level: RiskLevel) -> anyhow::Result<()>;
}
