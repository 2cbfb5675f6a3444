//! `fanout` binary: start, inspect and reset walks.

use clap::{Parser, Subcommand};
use fanout_engine::config::StoreBackend;
use fanout_engine::{
    CircuitPublisher, FanoutConfig, FanoutEngine, FanoutError, InstrumentedPublisher,
    InstrumentedRunner, InstrumentedStore, NoOpPublisher, Orchestrator, PageStore, PgPageStore,
    ProgressStore, Publisher, RedisStreamPublisher, Result, SqlitePageStore, StepContext,
};
use fanout_engine::resilience::RetryConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "fanout", version, about = "Resumable entity fan-out to a message broker")]
struct Cli {
    /// JSON config file. Defaults apply when omitted.
    #[arg(short, long, global = true, env = "FANOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Walk to operate on (overrides config and FANOUT_WALK_ID).
    #[arg(long, global = true)]
    walk_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the walk, or resume it from its last committed step.
    Run {
        /// Read and checkpoint as usual but drop every message.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the committed cursor and any in-flight snapshots.
    Status,
    /// Forget all progress of the walk.
    Reset {
        /// Required: the next run starts again from offset 0.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fanout failed");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let mut config = FanoutConfig::load(cli.config.as_deref())?;
    if let Some(walk_id) = cli.walk_id {
        config.walk.walk_id = walk_id;
        config.validate()?;
    }

    let progress = Arc::new(ProgressStore::new(&config.progress.sqlite_path, config.progress.wal_mode).await?);

    let result = match cli.command {
        Command::Run { dry_run } => run(&config, Arc::clone(&progress), dry_run).await,
        Command::Status => status(&config, &progress).await,
        Command::Reset { yes } => reset(&config, &progress, yes).await,
    };

    progress.close().await;
    result
}

async fn run(config: &FanoutConfig, progress: Arc<ProgressStore>, dry_run: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling walk");
            on_signal.cancel();
        }
    });

    let flush_shutdown = CancellationToken::new();
    let flusher = progress.spawn_flush_task(config.progress.flush_interval_duration(), flush_shutdown.clone());

    let result = connect_and_walk(config, progress, dry_run, &cancel).await;

    flush_shutdown.cancel();
    if let Err(e) = flusher.await {
        warn!(error = %e, "Progress flush task ended abnormally");
    }
    result
}

async fn connect_and_walk(
    config: &FanoutConfig,
    progress: Arc<ProgressStore>,
    dry_run: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let publisher = connect_publisher(config, dry_run).await?;
    match config.store.backend()? {
        StoreBackend::Postgres => {
            let store = PgPageStore::connect(
                &config.store.database_url,
                config.store.max_connections,
                config.store.acquire_timeout_duration(),
            )
            .await?;
            if config.store.ensure_schema {
                store.ensure_schema().await?;
            }
            let outcome = run_walk(config, store.clone(), publisher, progress, cancel).await;
            store.close().await;
            outcome
        }
        StoreBackend::Sqlite => {
            let store = SqlitePageStore::connect(&config.store.database_url, config.store.max_connections).await?;
            if config.store.ensure_schema {
                store.ensure_schema().await?;
            }
            let outcome = run_walk(config, store.clone(), publisher, progress, cancel).await;
            store.close().await;
            outcome
        }
    }
}

async fn connect_publisher(config: &FanoutConfig, dry_run: bool) -> Result<Box<dyn Publisher>> {
    if dry_run {
        info!("Dry run: messages are dropped");
        return Ok(Box::new(NoOpPublisher));
    }

    let redis = RedisStreamPublisher::connect(&config.broker, &RetryConfig::startup()).await?;
    if config.broker.circuit_enabled {
        Ok(Box::new(CircuitPublisher::new(redis, config.broker.circuit_config())))
    } else {
        Ok(Box::new(redis))
    }
}

async fn run_walk<S: PageStore>(
    config: &FanoutConfig,
    store: S,
    publisher: Box<dyn Publisher>,
    progress: Arc<ProgressStore>,
    cancel: &CancellationToken,
) -> Result<()> {
    let walk_id = config.walk.walk_id.clone();
    let engine = FanoutEngine::new(
        Arc::new(InstrumentedStore::new(store)),
        Arc::new(InstrumentedPublisher::new(publisher)),
        config.engine_settings(),
    );
    let runner = InstrumentedRunner::new(engine, walk_id.clone());
    let orchestrator = Orchestrator::new(walk_id, runner, progress, config.orchestrator_settings());

    let report = orchestrator.run(&StepContext::new(cancel.clone())).await?;
    info!(
        walk_id = %report.walk_id,
        steps = report.steps,
        attempts = report.attempts,
        final_offset = report.final_offset,
        "Walk finished"
    );
    print_json(&report)
}

async fn status(config: &FanoutConfig, progress: &ProgressStore) -> Result<()> {
    let walk_id = &config.walk.walk_id;
    let cursor = progress.load_walk(walk_id).await?;
    let in_flight = progress.snapshots_for(walk_id).await;

    let body = serde_json::json!({
        "walkId": walk_id,
        "cursor": cursor.map(|w| w.cursor),
        "completed": cursor.is_some_and(|w| w.completed),
        "updatedAt": cursor.map(|w| w.updated_at),
        "inFlight": in_flight,
    });
    print_json(&body)
}

async fn reset(config: &FanoutConfig, progress: &ProgressStore, yes: bool) -> Result<()> {
    if !yes {
        return Err(FanoutError::Config(format!(
            "refusing to reset walk {} without --yes",
            config.walk.walk_id
        )));
    }
    progress.delete_walk(&config.walk.walk_id).await
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).map_err(|e| FanoutError::Internal(e.to_string()))?;
    println!("{}", out);
    Ok(())
}
