use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use exposure_core::api::RiskNotifier;
use exposure_core::risk::{DashboardSnapshot, RiskLevel};
use exposure_core::session::SessionState;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Notifier that only writes to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl RiskNotifier for LogNotifier {
    async fn risk_level_changed(&self, level: RiskLevel) -> Result<()> {
        info!(?level, "risk level changed");
        Ok(())
    }
}

/// Tells the user when the level of `snapshot` differs from the last one
/// they were told about. Returns whether a notification went out.
pub async fn notify_if_changed(
    notifier: &dyn RiskNotifier,
    session: &SessionState,
    snapshot: &DashboardSnapshot,
) -> bool {
    let level = snapshot.risk_level();
    if level == session.last_notified_risk_level() {
        return false;
    }
    if let Err(err) = notifier.risk_level_changed(level).await {
        warn!(error = %err, ?level, "risk notification not delivered");
        return false;
    }
    if let Err(err) = session.set_last_notified_risk_level(level) {
        warn!(error = %err, "could not record notified risk level");
    }
    true
}

/// Watches the session's dashboard and notifies on every level change.
pub fn spawn_risk_notifier(
    notifier: Arc<dyn RiskNotifier>,
    session: Arc<SessionState>,
) -> JoinHandle<()> {
    let mut rx = session.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let snapshot = *rx.borrow_and_update();
            notify_if_changed(notifier.as_ref(), &session, &snapshot).await;
        }
    })
}
