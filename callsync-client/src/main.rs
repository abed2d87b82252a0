//! callsync-client - device sync agent
//!
//! `pair` binds this device to an employee, `run` keeps both sync paths
//! going until Ctrl+C, `sync-once` does a single manual pass.

use anyhow::{bail, Context, Result};
use callsync_client::call_log::{CallLogSource, FileCallLogSource};
use callsync_client::clock::SystemClock;
use callsync_client::config::{ClientConfig, CONFIG_FILE_NAME};
use callsync_client::ingestor::{CallLogIngestor, IngestSettings};
use callsync_client::locator::RecordingLocator;
use callsync_client::workers::{MetadataSyncWorker, RecordingUploadWorker};
use callsync_client::{
    build_id, pair_device, HttpSyncApi, LocalCallStore, RunMode, SchedulerIntervals, SyncApi, SyncScheduler,
};
use callsync_common::config::user_config_file;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often `run` probes the server for connectivity
const CONNECTIVITY_PROBE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "callsync-client")]
#[command(about = "Call log and recording sync agent")]
#[command(version)]
struct Args {
    /// TOML config file (default: ~/.config/callsync/client.toml)
    #[arg(short, long, env = "CALLSYNC_CLIENT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pair this device with an employee
    Pair {
        #[arg(long)]
        org: String,
        #[arg(long)]
        user: i64,
        /// Overrides `device_id` from the config file
        #[arg(long)]
        device: Option<String>,
    },
    /// Run the sync scheduler until interrupted
    Run,
    /// One manual ingest, metadata and recording pass
    SyncOnce,
}

struct Services {
    store: LocalCallStore,
    api: Arc<HttpSyncApi>,
    ingestor: Option<CallLogIngestor>,
    metadata: MetadataSyncWorker,
    recording: RecordingUploadWorker,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callsync_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting callsync-client {}", build_id());

    let args = Args::parse();
    let config_file = args.config.clone().or_else(|| user_config_file(CONFIG_FILE_NAME));
    let config = ClientConfig::load(config_file.as_deref())?;
    info!("Server: {}", config.server_url);

    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    info!("Database: {}", db_path.display());
    let store = LocalCallStore::open(&db_path).await?;

    match args.command {
        Command::Pair { org, user, device } => {
            let device_id = device.unwrap_or_else(|| config.device_id.clone());
            if device_id.trim().is_empty() {
                bail!("No device id: pass --device or set device_id in {}", CONFIG_FILE_NAME);
            }
            let api = HttpSyncApi::new(&config.server_url, config.request_timeout())?;
            let outcome = pair_device(&api, &store, &org, user, &device_id, config.device_model.as_deref()).await?;
            info!(?outcome, "Pairing complete");
            Ok(())
        }
        Command::Run => {
            let services = build_services(&config, store).await?;
            run_scheduler(&config, services).await
        }
        Command::SyncOnce => {
            let services = build_services(&config, store).await?;
            sync_once(services).await
        }
    }
}

async fn build_services(config: &ClientConfig, store: LocalCallStore) -> Result<Services> {
    let identity = store.pairing_identity().await?;
    let Some(identity) = identity else {
        bail!("Device is not paired; run `callsync-client pair` first");
    };
    if !config.device_id.is_empty() && config.device_id != identity.device_id {
        warn!(
            configured = %config.device_id,
            paired = %identity.device_id,
            "Configured device id differs from the paired one; using the paired id"
        );
    }

    if let Some(dir) = &config.recording_dir {
        store.set_recording_dir(dir).await?;
    }

    let api = Arc::new(HttpSyncApi::new(&config.server_url, config.request_timeout())?);
    let sync_api: Arc<dyn SyncApi> = api.clone();

    let ingestor = match &config.call_log_path {
        Some(path) => {
            let mut settings = IngestSettings::from_config(config)?;
            settings.device_id = identity.device_id.clone();
            let source: Arc<dyn CallLogSource> = Arc::new(FileCallLogSource::new(path));
            Some(CallLogIngestor::new(store.clone(), source, settings))
        }
        None => {
            info!("No call_log_path configured; ingest disabled");
            None
        }
    };

    let metadata = MetadataSyncWorker::new(store.clone(), sync_api.clone());
    let recording = RecordingUploadWorker::new(
        store.clone(),
        sync_api,
        Arc::new(SystemClock),
        config.recording_dir.clone().map(RecordingLocator::new),
        config.recording_batch_size,
    )
    .with_recheck_after(config.recording_interval());

    Ok(Services {
        store,
        api,
        ingestor,
        metadata,
        recording,
    })
}

async fn run_scheduler(config: &ClientConfig, services: Services) -> Result<()> {
    let api = services.api.clone();
    let mut scheduler = SyncScheduler::new(
        services.store,
        services.metadata,
        services.recording,
        SchedulerIntervals {
            metadata: config.metadata_interval(),
            recording: config.recording_interval(),
        },
    );
    if let Some(ingestor) = services.ingestor {
        scheduler = scheduler.with_ingestor(ingestor);
    }
    let handle = scheduler.start();

    let mut probe = interval(CONNECTIVITY_PROBE);
    probe.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C, shutting down");
                break;
            }
            _ = probe.tick() => {
                handle.connectivity_changed(api.ping().await).await;
            }
        }
    }

    handle.shutdown().await;
    info!("Client shutdown complete");
    Ok(())
}

async fn sync_once(services: Services) -> Result<()> {
    if let Some(ingestor) = &services.ingestor {
        let report = ingestor.run().await?;
        info!(?report, "Ingest");
    }
    let metadata = services.metadata.run(RunMode::Manual).await?;
    info!(?metadata, "Metadata");

    // Follow-up passes skip calls just deferred, so each one reaches new rows
    let cancel = CancellationToken::new();
    let mut mode = RunMode::Manual;
    loop {
        let recording = services.recording.run(mode, &cancel).await?;
        info!(?recording, "Recordings");
        if !recording.more_remaining {
            break;
        }
        mode = RunMode::Scheduled;
    }

    let (calls, recordings) = services.store.pending_work().await?;
    info!(pending_calls = calls, pending_recordings = recordings, "Sync pass complete");
    Ok(())
}
