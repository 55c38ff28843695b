//! Engage agent - runs the beacon engagement engine from the command line
//!
//! Drives the engine with JSONL replay sources standing in for the platform
//! region-monitoring and ranging subsystems, delivers engagement events to
//! the configured backend, and logs observer callbacks.
//!
//! Module structure:
//! - `domain/` - Core types (identities, observations, engagement events)
//! - `io/` - External interfaces (sources, backend sink, storage)
//! - `services/` - Engine (lifecycle, registry, dispatcher, delivery, facade)
//! - `infra/` - Infrastructure (config, errors, metrics)

use anyhow::Context;
use beacon_engage::domain::{Advertisement, BeaconIdentity, BeaconState, ErrorKind, ObservationSource};
use beacon_engage::infra::Config;
use beacon_engage::io::store::load_or_create_device_id;
use beacon_engage::io::{FileStore, ReplaySource};
use beacon_engage::services::{EngageManager, EngageObserver, ManagerSlot};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Beacon engagement agent
#[derive(Parser, Debug)]
#[command(name = "engage-agent", version, about)]
struct Args {
    /// Path to TOML configuration file [default: $CONFIG_FILE, then config/dev.toml]
    #[arg(short, long)]
    config: Option<String>,

    /// API key sent with every engagement event
    #[arg(long, required_unless_present = "device_id")]
    api_key: Option<String>,

    /// Application-chosen user identifier attached to engagement events
    #[arg(long)]
    user_id: Option<String>,

    /// JSONL sighting script replayed as region and ranging sources
    #[arg(long)]
    script: Option<PathBuf>,

    /// Mark an advertisement opened, as AD_ID@BEACON (repeatable)
    #[arg(long, value_name = "AD@BEACON")]
    mark_opened: Vec<String>,

    /// Mark an advertisement claimed, as AD_ID@BEACON (repeatable)
    #[arg(long, value_name = "AD@BEACON")]
    mark_claimed: Vec<String>,

    /// Verbose per-sighting and per-attempt diagnostics
    #[arg(long)]
    debug: bool,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    run_for_secs: Option<u64>,

    /// Print the persisted device identifier and exit
    #[arg(long)]
    device_id: bool,
}

/// Observer that logs every callback
struct LogObserver;

impl EngageObserver for LogObserver {
    fn on_beacon_appeared(&self, beacon: &BeaconState) {
        info!(beacon = %beacon.identity, proximity = %beacon.proximity.as_str(), "observer_beacon_appeared");
    }

    fn on_beacon_updated(&self, beacon: &BeaconState) {
        info!(beacon = %beacon.identity, proximity = %beacon.proximity.as_str(), "observer_beacon_updated");
    }

    fn on_beacon_disappeared(&self, identity: &BeaconIdentity) {
        info!(beacon = %identity, "observer_beacon_disappeared");
    }

    fn on_failure(&self, kind: ErrorKind, detail: &str) {
        warn!(kind = %kind, detail = %detail, "observer_failure");
    }
}

fn parse_mark(arg: &str) -> anyhow::Result<Advertisement> {
    let (ad_id, beacon) = arg
        .split_once('@')
        .with_context(|| format!("expected AD_ID@BEACON, got {arg:?}"))?;
    let beacon: BeaconIdentity = beacon.parse()?;
    Ok(Advertisement::new(ad_id, beacon))
}

async fn wait_for_exit(run_for_secs: Option<u64>) {
    match run_for_secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown_signal_received");
        }
    }
}

fn log_final_state(manager: &EngageManager) {
    for (key, state) in manager.detected_beacons().iter() {
        info!(beacon = %key, proximity = %state.proximity.as_str(), "detected_beacon");
    }
    manager.metrics().report().log();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Structured logging, level configurable via RUST_LOG (default INFO)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    // Without --config, fall through to CONFIG_FILE and then the default path
    let config = match args.config.as_deref() {
        Some(path) => Config::load_from_path(path),
        None => Config::load(&[]),
    };

    if args.device_id {
        let store = FileStore::open(config.storage_dir())?;
        println!("{}", load_or_create_device_id(&store)?);
        return Ok(());
    }

    info!(
        config_file = %config.config_file(),
        backend_url = %config.backend_url(),
        storage_dir = %config.storage_dir(),
        silence_timeout_ms = %config.silence_timeout().as_millis(),
        max_attempts = %config.max_attempts(),
        "config_loaded"
    );

    let mut builder = EngageManager::builder(config);
    if let Some(script) = &args.script {
        builder = builder
            .source(Arc::new(ReplaySource::from_file(ObservationSource::Region, script)?))
            .source(Arc::new(ReplaySource::from_file(ObservationSource::Ranging, script)?));
    }

    let slot = ManagerSlot::new();
    let manager = slot.get_or_init(builder)?;

    let observer: Arc<dyn EngageObserver> = Arc::new(LogObserver);
    manager.set_delegate(Arc::downgrade(&observer));
    manager.set_debug_mode(args.debug);
    manager.set_user_identifier(args.user_id.as_deref());

    let api_key = args.api_key.as_deref().context("--api-key is required")?;
    manager.start(api_key).await?;
    info!(
        device_id = %manager.device_id(),
        sdk_version = %manager.sdk_version(),
        state = %manager.state().as_str(),
        "engage_agent_started"
    );

    for arg in &args.mark_opened {
        manager.mark_advertisement_opened(&parse_mark(arg)?);
    }
    for arg in &args.mark_claimed {
        manager.mark_advertisement_claimed(&parse_mark(arg)?);
    }

    wait_for_exit(args.run_for_secs).await;

    log_final_state(&manager);
    let pending = manager.pending_events().await.map(|e| e.len()).unwrap_or(0);
    if pending > 0 {
        warn!(pending = %pending, "engagements_pending_at_shutdown");
    }
    manager.shutdown().await;

    info!("engage-agent shutdown complete");
    Ok(())
}
