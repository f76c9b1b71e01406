mod cli;

use clap::Parser;
use cli::{Cli, Commands, FetchArgs};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mediafix::cache::ArtifactCache;
use mediafix::config::Config;
use mediafix::job::JobState;
use mediafix::notify::{EventKind, LogSink, summary};
use mediafix::observability::Metrics;
use mediafix::queue::QueueManager;
use mediafix::worker::{ShutdownMode, WorkerContext, WorkerPool};

type AnyError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Serve(args) => {
            let mut config = config;
            if let Some(address) = args.address {
                config.server.bind_addr = address;
            }
            mediafix::api::run(config).await?
        }
        Commands::Fetch(args) => fetch(config, args).await?,
        Commands::PruneCache => prune_cache(&config)?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

/// Run one job through a private queue; Ctrl+C aborts it
async fn fetch(config: Config, args: FetchArgs) -> Result<(), AnyError> {
    let manager = QueueManager::new(
        config.queue.clone(),
        Arc::new(LogSink),
        Arc::new(Metrics::new()),
    );
    let pool = WorkerPool::spawn(&manager, WorkerContext::from_config(&config)?);

    let job_id = manager.submit(args.url, args.requester).await?;
    info!(%job_id, "Submitted");

    let job = tokio::select! {
        job = manager.wait(&job_id) => job?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, cancelling");
            manager.cancel(&job_id).ok();
            manager.wait(&job_id).await?
        }
    };
    pool.shutdown(ShutdownMode::Abort).await;

    let kind = match job.state {
        JobState::Succeeded => EventKind::Succeeded,
        JobState::Cancelled => EventKind::Cancelled,
        _ => EventKind::Failed,
    };
    println!("{}", summary(&job, kind));

    match (&job.state, &job.result) {
        (JobState::Succeeded, Some(artifact)) => {
            println!("{}", artifact.path.display());
            Ok(())
        }
        _ => Err(format!("job {} ended {}", job.id, job.state).into()),
    }
}

fn prune_cache(config: &Config) -> Result<(), AnyError> {
    let ttl = Duration::from_secs(u64::from(config.cache.ttl_days) * 86_400);
    let cache = ArtifactCache::open(&config.cache.path, ttl)?;
    let stats = cache.prune_expired()?;
    println!(
        "Pruned {} entries ({} expired, {} missing, {} corrupt), {} left",
        stats.total(),
        stats.expired,
        stats.missing,
        stats.corrupt,
        cache.stats()?.entries
    );
    Ok(())
}
