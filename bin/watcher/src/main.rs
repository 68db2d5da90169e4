//! Ledgerwatch: indexes an Ethereum chain into PostgreSQL and alerts on
//! accounts with unusually high activity.
//!
//! Tasks, each on its own timer and sharing one cancellation token:
//! - block processor: replays blocks into the ledger and updates stats
//! - log poller: ingests one token contract's Transfer logs and their
//!   balance effects (optional)
//! - activity refresh + write-back: materializes 15-second windows
//! - notifier: alerts on windows past the threshold

use std::sync::Arc;

use alloy::primitives::Address;
use eyre::{Result, WrapErr};
use ledgerwatch_chain::{ChainSource, RpcChainSource};
use ledgerwatch_core::{Settings, telemetry};
use ledgerwatch_indexer::activity::WRITE_BACK_CAPACITY;
use ledgerwatch_indexer::{
    ActivityAggregator, AlertSink, BlockProcessor, ContractCache, LogPoller, LogSink, Notifier,
    StatsAccumulator, Supervisor, TelegramSink,
};
use ledgerwatch_storage::{self as storage, Ledger, PgLedger};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Initialisation ──────────────────────────────────────────────────
    telemetry::init();
    let settings = Settings::from_env()?;

    tracing::info!(rpc = %settings.rpc_url, "Starting ledgerwatch");

    let pool = storage::connect(&settings.database_url).await?;
    tracing::info!("Connected to database");

    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    let chain: Arc<dyn ChainSource> = Arc::new(RpcChainSource::connect(&settings.rpc_url)?);
    let ledger: Arc<dyn Ledger> = Arc::new(PgLedger::new(pool.clone()));

    let head = chain.current_header().await?;
    tracing::info!(head = head.number, "Connected to RPC");

    // ── Components ──────────────────────────────────────────────────────
    let (aggregator, write_back) = ActivityAggregator::new(ledger.clone(), WRITE_BACK_CAPACITY);
    let aggregator = Arc::new(aggregator);

    let contracts = Arc::new(ContractCache::default());
    let stats = StatsAccumulator::new(ledger.clone(), chain.clone(), contracts);
    let processor = BlockProcessor::new(
        chain.clone(),
        ledger.clone(),
        stats.clone(),
        settings.start_block,
        settings.max_blocks_per_tick,
    )
    .with_dirty_periods(aggregator.dirty_periods());

    let poller = match settings.token_contract.as_deref() {
        Some(contract) => {
            let contract: Address = contract
                .parse()
                .wrap_err_with(|| format!("invalid TOKEN_CONTRACT {contract:?}"))?;
            Some(
                LogPoller::new(
                    chain.clone(),
                    ledger.clone(),
                    stats,
                    contract,
                    settings.confirmations,
                    settings.log_batch_size,
                )
                .with_dirty_periods(aggregator.dirty_periods()),
            )
        }
        None => {
            tracing::info!("TOKEN_CONTRACT not set, log poller disabled");
            None
        }
    };

    let mut sinks: Vec<Box<dyn AlertSink>> = vec![Box::new(LogSink)];
    match TelegramSink::from_settings(&settings)? {
        Some(telegram) => sinks.push(Box::new(telegram)),
        None => tracing::info!("Telegram not configured, alerts go to logs only"),
    }
    let notifier = Notifier::new(
        ledger.clone(),
        sinks,
        settings.alert_threshold,
        settings.notify_batch_size,
    );

    // ── Tasks ───────────────────────────────────────────────────────────
    let mut supervisor = Supervisor::new();
    supervisor.spawn(
        "block-processor",
        processor.run(settings.block_poll_interval(), supervisor.token()),
    );
    if let Some(poller) = poller {
        supervisor.spawn(
            "log-poller",
            poller.run(settings.log_poll_interval(), supervisor.token()),
        );
    }
    supervisor.spawn("activity-write-back", write_back.run(supervisor.token()));
    supervisor.spawn(
        "activity-refresh",
        aggregator.run_refresh(settings.activity_refresh_interval(), supervisor.token()),
    );
    supervisor.spawn(
        "notifier",
        notifier.run(
            settings.notify_interval(),
            settings.notify_align_to_period,
            supervisor.token(),
        ),
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down gracefully…");

    supervisor.shutdown().await;
    pool.close().await;

    tracing::info!("Ledgerwatch stopped.");
    Ok(())
}
