use std::{process, sync::Arc, time::Duration};

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{filter::LevelFilter, fmt};

use krisis_app::backend::{Backend, StoreCounters};
use krisis_app::cli::{Cli, Commands, ServeArgs};
use krisis_app::config::{self, AppConfig};
use krisis_app::error::AppError;
use krisis_app::services::analysis::{AnalysisClient, HttpCompletionApi};
use krisis_app::services::queue::AnalysisQueue;
use krisis_app::services::store::RedisStore;
use krisis_app::services::tasks::TaskStore;
use krisis_app::services::worker::Worker;
use krisis_server::NewsBackend;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(&cli);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let cfg = config::load()?;

    match cli.command {
        Commands::Serve(args) => serve(cfg, args).await,
        Commands::Worker => worker(cfg).await,
    }
}

async fn serve(cfg: AppConfig, args: ServeArgs) -> Result<(), AppError> {
    let store = RedisStore::connect(&cfg.redis.url).await?;
    tracing::info!("connected to store");

    let backend =
        Backend::new(store.clone(), &cfg).map_err(|err| AppError::Backend(err.to_string()))?;
    let backend: Arc<dyn NewsBackend> = Arc::new(backend);
    let counters = Arc::new(StoreCounters(store.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = if args.no_worker {
        None
    } else {
        let worker = build_worker(store, &cfg)?;
        Some(tokio::spawn(async move { worker.run(shutdown_rx).await }))
    };

    let served = krisis_server::serve(cfg.server.clone(), backend, counters).await;

    if let Some(handle) = worker_handle {
        let _ = shutdown_tx.send(true);
        if let Err(error) = handle.await {
            tracing::warn!(%error, "worker task did not shut down cleanly");
        }
    }

    served.map_err(AppError::from)
}

async fn worker(cfg: AppConfig) -> Result<(), AppError> {
    let store = RedisStore::connect(&cfg.redis.url).await?;
    tracing::info!("connected to store");

    let worker = build_worker(store, &cfg)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    wait_for_signal().await;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    if let Err(error) = handle.await {
        tracing::warn!(%error, "worker task did not shut down cleanly");
    }

    Ok(())
}

fn build_worker(
    store: RedisStore,
    cfg: &AppConfig,
) -> Result<Worker<RedisStore, HttpCompletionApi>, AppError> {
    let analysis = AnalysisClient::from_config(&cfg.analysis)?;
    let result_ttl = Duration::from_secs(cfg.cache.analysis_ttl_secs);
    let queue = AnalysisQueue::new(store.clone(), cfg.queue.clone(), result_ttl);
    let tasks = TaskStore::new(store, result_ttl);
    Ok(Worker::new(
        queue,
        tasks,
        analysis,
        Duration::from_millis(cfg.queue.poll_interval_ms),
    ))
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to capture Ctrl+C signal");
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm => {}
    }
}
