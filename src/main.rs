//! Gateway - per-account transaction sequencing for a remote ledger
//!
//! Entry point wiring the nonce store, ledger client, submission
//! coordinator, resubmitter and session registry together.
//!
//! ## Components
//!
//! - **Nonce store**: file-backed per-account sequence counters
//! - **Drift reconciler**: resyncs local counters against the ledger
//! - **Resubmitter**: resends unconfirmed transactions on an interval
//! - **Session registry**: rate-limited sessions with idle eviction
//! - **Metrics**: Prometheus text endpoint

// Compiler warning configuration
#![deny(unused_imports)]
#![deny(unused_mut)]
#![deny(unused_variables)]
#![warn(dead_code)]
#![warn(unused_must_use)]

use anyhow::{Context, Result};
use clap::Parser;
use gateway::config::GatewayConfig;
use gateway::endpoints;
use gateway::ledger::HttpLedger;
use gateway::nonce_manager::{DriftReconciler, FileBackend, NonceStore, PendingTxStore};
use gateway::observability::init_logging;
use gateway::session::registry::SessionDeps;
use gateway::session::{DerivedAccounts, SessionRegistry};
use gateway::streaming::WsTransport;
use gateway::submission::{AccountLocks, Resubmitter, SubmissionCoordinator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Metrics port (overrides the config file)
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.json_logs)?;

    info!("🚀 Starting gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = load_config(&args.config)?;

    // Nonce persistence (opening migrates a legacy file if one is configured)
    let mut backend = FileBackend::new(&config.nonce.data_dir, &config.nonce.file_name);
    if let Some(legacy) = &config.nonce.legacy_path {
        backend = backend.with_legacy_path(legacy);
    }
    info!("🔢 Nonce state at {}", backend.path().display());
    let store = Arc::new(NonceStore::open(Arc::new(backend)));

    let records = Arc::new(
        PendingTxStore::open(&config.pending.db_path).with_context(|| {
            format!(
                "Failed to open pending transaction store at {}",
                config.pending.db_path.display()
            )
        })?,
    );

    // Ledger client
    info!("🌐 Ledger at {}", config.ledger.base_url);
    let ledger = Arc::new(
        HttpLedger::new(
            &config.ledger.base_url,
            Duration::from_millis(config.ledger.request_timeout_ms),
            config.ledger.max_fetch_retries,
        )
        .context("Failed to build ledger client")?,
    );

    let locks = Arc::new(AccountLocks::new());
    let reconciler = Arc::new(
        DriftReconciler::new(store.clone(), ledger.clone(), config.reconciler_config())
            .with_pending_records(records.clone()),
    );
    let coordinator = Arc::new(
        SubmissionCoordinator::new(store.clone(), reconciler.clone(), ledger.clone(), locks.clone())
            .with_pending_records(records.clone()),
    );

    let registry = Arc::new(SessionRegistry::new(
        config.session_config(),
        SessionDeps {
            transport: Arc::new(WsTransport::new(Duration::from_millis(
                config.stream.connect_timeout_ms,
            ))),
            store: store.clone(),
            reconciler: reconciler.clone(),
            locks: locks.clone(),
            initializer: Arc::new(DerivedAccounts::default()),
            pending_records: Some(records.clone()),
        },
    ));
    registry.set_eviction_callback(|session| {
        info!(session_id = %session.id(), identity = session.identity(), "Evicting idle session");
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Background tasks
    let resubmitter = Arc::new(Resubmitter::new(
        records.clone(),
        ledger.clone(),
        locks.clone(),
        config.resubmit_config(),
    ));
    let resubmit_task = resubmitter.spawn(shutdown_rx.clone());
    let sweeper_task = registry.clone().spawn_sweeper(shutdown_rx.clone());

    // Initialize metrics
    let metrics_port = args.metrics_port.unwrap_or(config.monitoring.metrics_port);
    if config.monitoring.enable_metrics {
        info!("📊 Starting metrics server on port {}", metrics_port);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = endpoints::endpoint_server(metrics_port, shutdown).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    info!("✅ All components initialized successfully");
    run_until_shutdown(&registry, &store, &records, &coordinator).await;

    info!("👋 Shutting down gracefully...");
    let _ = shutdown_tx.send(true);
    let torn_down = registry.destroy_all();
    info!(sessions = torn_down, "Sessions torn down");
    if let Err(e) = store.flush() {
        error!(error = %e, "Final nonce flush failed");
    }
    let _ = tokio::join!(resubmit_task, sweeper_task);

    Ok(())
}

/// Load configuration from file with fallback to defaults
fn load_config(path: &Path) -> Result<GatewayConfig> {
    if path.exists() {
        info!("📋 Loading configuration from: {}", path.display());
        GatewayConfig::load(Some(path))
            .with_context(|| format!("Failed to load config from {}", path.display()))
    } else {
        warn!("Config file '{}' not found, using defaults", path.display());
        GatewayConfig::load(None).context("Invalid configuration")
    }
}

/// Report statistics until ctrl-c
async fn run_until_shutdown(
    registry: &SessionRegistry,
    store: &NonceStore,
    records: &PendingTxStore,
    coordinator: &SubmissionCoordinator,
) {
    let mut stats_interval = tokio::time::interval(Duration::from_secs(60));

    loop {
        tokio::select! {
            // Periodic statistics reporting
            _ = stats_interval.tick() => {
                info!(
                    sessions = registry.len(),
                    accounts = store.len(),
                    pending_records = records.len(),
                    locked_accounts = coordinator.locks().len(),
                    "📊 Statistics"
                );
            }

            // Graceful shutdown signal
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Received shutdown signal");
                break;
            }
        }
    }
}
