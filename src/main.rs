//! LooseLine wallet service.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! replays the journal into the ledger, then drives settlement triggers
//! and periodic reconciliation until shutdown.

use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use looseline::api::{self, ApiState};
use looseline::clock::SystemClock;
use looseline::config::{self, EventSource, StorageBackend};
use looseline::engine::{
    BetPlacement, FundingGateway, Ledger, LedgerPolicy, ReconcileReport, Reconciler,
    SettlementEngine, SettlementReport, SettlementWorker,
};
use looseline::events::{EventCatalog, HttpCatalog, InMemoryCatalog};
use looseline::storage::{Journal, MemoryJournal, SqliteJournal};
use looseline::types::SettlementTrigger;

/// Capacity of the settlement trigger queue.
const TRIGGER_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;
    init_logging(&cfg);

    info!(
        service = %cfg.service.name,
        currency = %cfg.service.currency,
        storage = ?cfg.storage.backend,
        events = ?cfg.events.source,
        "LooseLine starting up"
    );

    // -- Journal and ledger ----------------------------------------------

    let journal: Arc<dyn Journal> = match cfg.storage.backend {
        StorageBackend::Memory => {
            warn!("In-memory journal: balances are lost on shutdown");
            Arc::new(MemoryJournal::new())
        }
        StorageBackend::Sqlite => {
            let url = cfg.storage.database_url();
            Arc::new(SqliteJournal::connect(url.expose_secret()).await?)
        }
    };

    let ledger = Arc::new(
        Ledger::restore(journal, Arc::new(SystemClock), LedgerPolicy::from(&cfg.ledger))
            .await
            .context("Failed to restore ledger from journal")?,
    );

    // -- Event catalog ---------------------------------------------------

    let (trigger_tx, mut trigger_rx) = mpsc::channel::<SettlementTrigger>(TRIGGER_QUEUE);

    let catalog: Arc<dyn EventCatalog> = match cfg.events.source {
        EventSource::Fixture => {
            let path = cfg
                .events
                .fixture_path
                .as_deref()
                .context("events.fixture_path is required for the fixture source")?;
            let catalog = InMemoryCatalog::from_fixture(path)?.with_triggers(trigger_tx.clone());
            // Events already resolved in the fixture are settled on startup.
            for trigger in catalog.pending_resolutions() {
                trigger_tx.send(trigger).await?;
            }
            Arc::new(catalog)
        }
        EventSource::Http => {
            let base_url = cfg
                .events
                .base_url
                .as_deref()
                .context("events.base_url is required for the http source")?;
            Arc::new(HttpCatalog::new(base_url)?)
        }
    };
    info!(catalog = catalog.name(), "Event catalog ready");

    // -- Services --------------------------------------------------------

    let placement = Arc::new(BetPlacement::new(ledger.clone(), catalog));
    let funding = Arc::new(FundingGateway::new(ledger.clone()));
    let settlement = Arc::new(SettlementEngine::new(ledger.clone()));
    let worker = SettlementWorker::new(settlement, trigger_tx.clone(), &cfg.settlement);
    let reconciler = Reconciler::new(ledger.clone());

    // Locks orphaned by a crash are released before any traffic arrives.
    log_reconcile_report(&reconciler.run().await);

    let _api_handle = if cfg.api.enabled {
        let state = Arc::new(ApiState {
            ledger: ledger.clone(),
            placement,
            funding,
            triggers: trigger_tx.clone(),
            currency: cfg.service.currency.clone(),
        });
        Some(api::spawn_api(state, cfg.api.port).await?)
    } else {
        None
    };

    // -- Main loop -------------------------------------------------------

    let mut reconcile = tokio::time::interval(Duration::from_secs(cfg.service.reconcile_interval_secs));
    // The startup pass above already covered the first tick.
    reconcile.tick().await;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        reconcile_interval_secs = cfg.service.reconcile_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            Some(trigger) = trigger_rx.recv() => {
                let report = worker.handle(trigger).await;
                log_settlement_report(&report);
            }
            _ = reconcile.tick() => {
                log_reconcile_report(&reconciler.run().await);
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    info!(
        users = ledger.users().await.len(),
        "LooseLine shut down cleanly."
    );
    Ok(())
}

fn log_settlement_report(report: &SettlementReport) {
    if report.is_complete() {
        info!(
            event_id = %report.event_id,
            settled = report.settled(),
            skipped = report.skipped,
            paid_out = %report.paid_out,
            "Settlement run complete"
        );
    } else {
        error!(
            event_id = %report.event_id,
            settled = report.settled(),
            failed = report.failed.len(),
            "Settlement run incomplete"
        );
    }
}

fn log_reconcile_report(report: &ReconcileReport) {
    for anomaly in &report.anomalies {
        warn!(anomaly = ?anomaly, "Ledger anomaly");
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging(cfg: &config::AppConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("looseline=info"));

    let json_logging = std::env::var("LOOSELINE_LOG_JSON").is_ok();

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

    let _ = cfg;
}
