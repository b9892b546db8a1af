use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use exposure_core::api::InfectedIdsFetcher;
use exposure_core::paths::{data_dir, session_path, settings_path, store_paths};
use exposure_core::proximity::{spawn_event_loop, BeaconIdentity, ProximityStateMachine};
use exposure_core::secure_storage::KeyringKeyProvider;
use exposure_core::session::{Registration, SessionState};
use exposure_core::settings::ExposureSettings;
use exposure_core::store::EventStore;
use exposure_service::api_client::ApiClient;
use exposure_service::hardware::{spawn_event_feed, LoggingPrompter, LoggingRadio};
use exposure_service::notifier::{spawn_risk_notifier, LogNotifier};
use exposure_service::registration::register_device;
use exposure_service::reporting::{report_infected, report_recovered};
use exposure_service::scheduler::{DiscoveryFlushLoop, InfectedRefreshLoop};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const RADIO_EVENT_QUEUE: usize = 256;

#[derive(Parser, Debug)]
#[command(author, version, about = "Anonymous proximity exposure service", long_about = None)]
struct Cli {
    /// Directory holding the event store, session and settings
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Advertise, collect discoveries and keep the risk level current.
    /// Radio events are read from stdin, one JSON object per line.
    Run {
        #[arg(long, env = "EXPOSURE_API_BASE_URL")]
        api_base_url: Option<String>,
        /// Beacon major; skips server registration together with --minor
        #[arg(long, requires = "minor")]
        major: Option<u16>,
        /// Beacon minor; skips server registration together with --major
        #[arg(long, requires = "major")]
        minor: Option<u16>,
        /// Device id sent at registration, random when omitted
        #[arg(long)]
        device_id: Option<String>,
    },
    /// Print the dashboard snapshot and store counters as JSON
    Status,
    /// Report a positive test or a recovery to the server
    Report {
        #[arg(long, env = "EXPOSURE_API_BASE_URL")]
        api_base_url: Option<String>,
        #[arg(long)]
        recovered: bool,
        /// Test time (RFC 3339), defaults to now
        #[arg(long)]
        tested_at: Option<DateTime<Utc>>,
    },
    /// Delete every discovery, infected id and session value
    Wipe {
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let data = match cli.data_dir {
        Some(dir) => dir,
        None => data_dir()?,
    };
    match cli.command {
        Commands::Run {
            api_base_url,
            major,
            minor,
            device_id,
        } => run_command(&data, api_base_url, major.zip(minor), device_id).await,
        Commands::Status => status_command(&data),
        Commands::Report {
            api_base_url,
            recovered,
            tested_at,
        } => report_command(&data, api_base_url, recovered, tested_at).await,
        Commands::Wipe { yes } => wipe_command(&data, yes),
    }
}

fn open_store(data: &Path) -> Result<EventStore> {
    std::fs::create_dir_all(data)
        .with_context(|| format!("create data dir {}", data.display()))?;
    EventStore::open(store_paths(data), &KeyringKeyProvider::new())
        .context("open event store (is `exposure-service run` still running?)")
}

fn resolve_base_url(cli: Option<String>, settings: &ExposureSettings) -> Option<String> {
    cli.or_else(|| settings.api.base_url.clone())
}

async fn run_command(
    data: &Path,
    api_base_url: Option<String>,
    beacon: Option<(u16, u16)>,
    device_id: Option<String>,
) -> Result<()> {
    let settings = ExposureSettings::load(&settings_path(data))?;
    let store = Arc::new(open_store(data)?);
    let session = Arc::new(SessionState::load(session_path(data)));
    let base_url = resolve_base_url(api_base_url, &settings);
    let device_id = device_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let registration = match (beacon, session.registration(), base_url.as_deref()) {
        (Some((major, minor)), current, _) => match current {
            Some(r) if r.major == major && r.minor == minor => r,
            _ => {
                let registration = Registration {
                    major,
                    minor,
                    device_id,
                    registered_at: Utc::now(),
                };
                session.set_registration(registration.clone())?;
                registration
            }
        },
        (None, Some(current), _) => current,
        (None, None, Some(url)) => {
            let client = ApiClient::new(url, None)?;
            register_device(&client, &session, &device_id)
                .await
                .context("register device")?
        }
        (None, None, None) => bail!(
            "device not registered; pass --major and --minor or configure an API base URL"
        ),
    };
    info!(
        peer = %registration.peer_id(),
        discoveries = store.discovery_count(),
        "starting exposure service"
    );

    let mut machine = ProximityStateMachine::new(Box::new(LoggingRadio), Box::new(LoggingPrompter));
    machine.configure(BeaconIdentity {
        service_uuid: settings.beacon.service_uuid.clone(),
        region_id: settings.beacon.region_id.clone(),
        major: registration.major,
        minor: registration.minor,
    })?;
    machine.request_permissions();
    machine.start()?;

    let mut flush_loop = DiscoveryFlushLoop::new(
        machine.discovery_feed(),
        store.clone(),
        settings.flush_interval(),
    );
    flush_loop.start();

    let mut refresh_loop = match base_url {
        Some(url) => {
            let client: Arc<dyn InfectedIdsFetcher> =
                Arc::new(ApiClient::new(&url, Some(&registration))?);
            let mut refresh = InfectedRefreshLoop::new(
                store.clone(),
                session.clone(),
                client,
                settings.refresh_interval(),
            );
            refresh.start();
            Some(refresh)
        }
        None => {
            warn!("no API base URL configured, infected ids will not be refreshed");
            None
        }
    };

    let notifier_task = spawn_risk_notifier(Arc::new(LogNotifier), session.clone());

    let (event_tx, event_rx) = mpsc::channel(RADIO_EVENT_QUEUE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let machine_task = spawn_event_loop(machine, event_rx, shutdown_rx);
    let feed_task = spawn_event_feed(BufReader::new(tokio::io::stdin()), event_tx);

    signal::ctrl_c().await?;
    info!("shutdown requested");

    feed_task.abort();
    let _ = shutdown_tx.send(true);
    match machine_task.await {
        Ok(machine) => info!(
            phase = ?machine.phase(),
            location = ?machine.location_permission(),
            radio = ?machine.radio_permission(),
            "proximity machine stopped"
        ),
        Err(err) => warn!(error = %err, "proximity task ended abnormally"),
    }
    flush_loop.stop().await;
    if let Some(refresh) = refresh_loop.as_mut() {
        refresh.stop();
    }
    notifier_task.abort();
    Ok(())
}

fn status_command(data: &Path) -> Result<()> {
    let store = open_store(data)?;
    let session = SessionState::load(session_path(data));
    let snapshot = session.dashboard();
    let recent: Vec<serde_json::Value> = store
        .recent_discoveries(10)
        .into_iter()
        .map(|event| {
            serde_json::json!({
                "distanceMeters": event.estimated_distance_meters(),
                "close": event.is_close(),
                "event": event,
            })
        })
        .collect();
    let status = serde_json::json!({
        "dashboard": snapshot,
        "riskLevel": snapshot.risk_level(),
        "meterPosition": snapshot.meter_position(),
        "discoveries": store.discovery_count(),
        "distinctPeers": store.distinct_peers_count(),
        "infectedPeersMet": store.infected_peers_met_count(),
        "registered": session.registration().map(|r| r.peer_id()),
        "recent": recent,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn report_command(
    data: &Path,
    api_base_url: Option<String>,
    recovered: bool,
    tested_at: Option<DateTime<Utc>>,
) -> Result<()> {
    let settings = ExposureSettings::load(&settings_path(data))?;
    let url = resolve_base_url(api_base_url, &settings)
        .ok_or_else(|| anyhow!("no API base URL configured"))?;
    let store = open_store(data)?;
    let session = SessionState::load(session_path(data));
    let client = ApiClient::new(&url, session.registration().as_ref())?;
    let tested_at = tested_at.unwrap_or_else(Utc::now);

    let snapshot = if recovered {
        report_recovered(&client, &store, &session, tested_at).await?
    } else {
        report_infected(&client, &store, &session, tested_at).await?
    };
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn wipe_command(data: &Path, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to wipe without --yes");
    }
    let store = open_store(data)?;
    store.wipe_all()?;
    SessionState::load(session_path(data)).clear()?;
    println!("All exposure data deleted");
    Ok(())
}
