//! SWEEPER — locked-token watcher and sweeper
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the store, wires the ledger, pricing, fee, sweep, and detection
//! components together, starts monitoring every configured wallet, and
//! runs until Ctrl+C.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use sweeper::config;
use sweeper::dashboard::{self, DashboardState};
use sweeper::engine::detector::{DetectionEngine, ScanOutcome};
use sweeper::engine::fees::FeeOptimizer;
use sweeper::engine::sweeper::{ConfirmationPolicy, SweepExecutor};
use sweeper::events::{BroadcastSink, EventSink};
use sweeper::ledger::jsonrpc::JsonRpcLedger;
use sweeper::ledger::{EnvKeyring, LedgerClient};
use sweeper::pricing;
use sweeper::storage::{self, SweepStore};

const BANNER: &str = r#"
 ______        _______ _____ ____  _____ ____
/ ___\ \      / / ____| ____|  _ \| ____|  _ \
\___ \\ \ /\ / /|  _| |  _| | |_) |  _| | |_) |
 ___) |\ V  V / | |___| |___|  __/| |___|  _ <
|____/  \_/\_/  |_____|_____|_|   |_____|_| \_\

  Locked-token watcher: sweep the moment trading opens
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("SWEEPER_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        name = %cfg.engine.name,
        scan_interval_secs = cfg.engine.scan_interval_secs,
        wallets = cfg.wallets.len(),
        catalog = cfg.assets.len(),
        "SWEEPER starting up"
    );

    // -- Initialise components -------------------------------------------

    let store = storage::open(&cfg.storage).await?;
    for entry in &cfg.wallets {
        let wallet = entry.to_wallet_config()?;
        storage::upsert_wallet(&*store, &wallet).await?;
        info!(wallet = %wallet, "Wallet configured");
    }

    let ledger: Arc<dyn LedgerClient> = Arc::new(JsonRpcLedger::new(&cfg.ledger)?);
    let prices = pricing::from_config(&cfg.prices)?;
    let sink = BroadcastSink::new();
    let events: Arc<dyn EventSink> = Arc::new(sink.clone());

    let fees = Arc::new(FeeOptimizer::new(
        &cfg.fees,
        ledger.clone(),
        store.clone(),
        events.clone(),
        prices.clone(),
    ));
    let executor = Arc::new(SweepExecutor::new(
        store.clone(),
        ledger.clone(),
        fees.clone(),
        prices.clone(),
        events.clone(),
        Arc::new(EnvKeyring),
        ConfirmationPolicy::from(&cfg.confirmation),
    ));
    let (engine, scan_rx) = DetectionEngine::new(
        store.clone(),
        ledger,
        prices,
        events,
        executor,
        &cfg.assets,
        cfg.scan_interval(),
    );

    // -- Background tasks ------------------------------------------------

    let sampler = fees
        .clone()
        .spawn_sampler(Duration::from_secs(cfg.fees.sample_interval_secs.max(1)));
    let dispatcher = engine.spawn_dispatcher(scan_rx);
    let event_log = spawn_event_log(&sink);

    let status_api = if cfg.dashboard.enabled {
        let state = Arc::new(DashboardState::new(engine.clone(), store.clone(), fees.clone()));
        Some(dashboard::spawn_dashboard(state, cfg.dashboard.port).await?)
    } else {
        None
    };

    // -- Start monitoring ------------------------------------------------

    start_wallets(&engine, &*store, &cfg).await;

    info!("Monitoring. Press Ctrl+C to stop.");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received.");

    // -- Shutdown --------------------------------------------------------

    engine.shutdown().await;
    sampler.abort();
    dispatcher.abort();
    event_log.abort();
    if let Some(handle) = status_api {
        handle.abort();
    }

    let pending = engine.executor().active_sweep_count(None);
    if pending > 0 {
        warn!(pending, "Exiting with sweeps still in flight");
    }
    info!("SWEEPER shut down cleanly.");
    Ok(())
}

/// Begin monitoring every active configured wallet and register its extra
/// assets.
async fn start_wallets(engine: &Arc<DetectionEngine>, store: &dyn SweepStore, cfg: &config::AppConfig) {
    for entry in &cfg.wallets {
        let wallet = match entry.to_wallet_config() {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "Invalid wallet entry");
                continue;
            }
        };
        match store.get_wallet(&wallet.address).await {
            Ok(Some(stored)) if !stored.active => {
                info!(wallet = %wallet.address, "Wallet inactive, not monitoring");
                continue;
            }
            Err(e) => warn!(wallet = %wallet.address, error = %e, "Could not read wallet config"),
            _ => {}
        }

        match engine.start_monitoring(&wallet.address).await {
            Ok(ScanOutcome::Completed(report)) => info!(
                wallet = %wallet.address,
                checked = report.assets_checked,
                detected = report.detections_created,
                "Initial scan complete"
            ),
            Ok(ScanOutcome::Skipped) => {}
            Err(e) => {
                error!(wallet = %wallet.address, error = %e, "Failed to start monitoring");
                continue;
            }
        }

        for asset in &entry.assets {
            match engine.register_and_probe_asset(&wallet.address, asset).await {
                Ok(found) => info!(wallet = %wallet.address, asset = %asset, found, "Registered asset checked"),
                Err(e) => warn!(wallet = %wallet.address, asset = %asset, error = %e, "Registered asset check failed"),
            }
        }
    }
}

/// Forward domain events to the log.
fn spawn_event_log(sink: &BroadcastSink) -> tokio::task::JoinHandle<()> {
    let mut rx = sink.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => info!(
                    kind = %event.kind,
                    wallet = event.wallet.as_deref().unwrap_or("-"),
                    payload = %event.payload,
                    "Event"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sweeper=info"));

    let json_logging = std::env::var("SWEEPER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
