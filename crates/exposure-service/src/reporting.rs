//! Self reporting of an infection or a recovery.

use chrono::{DateTime, Utc};
use exposure_core::api::{ApiError, SelfReportSubmitter};
use exposure_core::error::{SessionError, StoreError};
use exposure_core::risk::{aggregate, DashboardSnapshot, SelfReport};
use exposure_core::session::SessionState;
use exposure_core::store::EventStore;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
enum ReportKind {
    Infected,
    Recovered,
}

pub async fn report_infected(
    submitter: &dyn SelfReportSubmitter,
    store: &EventStore,
    session: &SessionState,
    tested_at: DateTime<Utc>,
) -> Result<DashboardSnapshot, ReportError> {
    let returned = submitter.report_infected(tested_at).await?;
    publish(store, session, returned, ReportKind::Infected)
}

pub async fn report_recovered(
    submitter: &dyn SelfReportSubmitter,
    store: &EventStore,
    session: &SessionState,
    tested_at: DateTime<Utc>,
) -> Result<DashboardSnapshot, ReportError> {
    let returned = submitter.report_recovered(tested_at).await?;
    publish(store, session, returned, ReportKind::Recovered)
}

fn publish(
    store: &EventStore,
    session: &SessionState,
    returned: Option<DashboardSnapshot>,
    kind: ReportKind,
) -> Result<DashboardSnapshot, ReportError> {
    let removed = store.cleanup_expired_discoveries()?;
    if removed > 0 {
        debug!(removed, "pruned expired discoveries");
    }
    let met_count = store.distinct_peers_count() as u64;
    let infected_met = store.infected_peers_met_count() as u64;
    let snapshot = session.update_dashboard_with(|current| match returned {
        Some(mut snapshot) => {
            snapshot.met_count = met_count;
            snapshot
        }
        None => {
            let mut report: SelfReport = current.self_report();
            match kind {
                ReportKind::Infected => report.infected = true,
                ReportKind::Recovered => report.recovered = true,
            }
            aggregate(met_count, infected_met, report)
        }
    })?;
    info!(?kind, level = ?snapshot.risk_level(), "self report recorded");
    Ok(snapshot)
}
