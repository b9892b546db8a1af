//! First-run registration with the server.

use chrono::Utc;
use exposure_core::api::{ApiError, DeviceRegistrar};
use exposure_core::error::SessionError;
use exposure_core::risk::DashboardSnapshot;
use exposure_core::session::{Registration, SessionState};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Registers `device_id`, stores the assigned beacon numbers and seeds the
/// dashboard from the server's status when it sends one.
pub async fn register_device(
    registrar: &dyn DeviceRegistrar,
    session: &SessionState,
    device_id: &str,
) -> Result<Registration, RegistrationError> {
    let grant = registrar.register(device_id).await?;
    let registration = Registration {
        major: grant.major,
        minor: grant.minor,
        device_id: device_id.to_string(),
        registered_at: Utc::now(),
    };
    session.set_registration(registration.clone())?;
    if let Some(status) = grant.status {
        // the server cannot know how many peers this device met
        session.update_dashboard_with(|current| DashboardSnapshot {
            met_count: current.met_count,
            ..status
        })?;
    }
    info!(peer = %registration.peer_id(), "device registered");
    Ok(registration)
}
