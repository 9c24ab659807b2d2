use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sliding_window_counters::config::{AppConfig, LoggingConfig, StoreBackend};
use sliding_window_counters::ratelimit::{
    Limiter, LimiterSettings, RateLimitError, SlidingWindowLimiter,
};
use sliding_window_counters::store::MemoryStore;

/// Sliding-window rate limiter driver.
#[derive(Debug, Parser)]
#[command(name = "swc", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Charge a key and print the resulting status
    Increment {
        /// Rate limit key
        #[arg(long)]
        key: String,

        /// Units to charge per call
        #[arg(long, default_value_t = 1)]
        weight: u64,

        /// Number of calls to make
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Print one JSON object per call
        #[arg(long)]
        json: bool,
    },

    /// Charge random keys with random delays until interrupted
    Simulate {
        /// Number of distinct keys
        #[arg(long, default_value_t = 10)]
        users: u32,

        /// Number of concurrent callers
        #[arg(long, default_value_t = 1)]
        workers: u32,

        /// Stop after this many calls in total
        #[arg(long)]
        requests: Option<u64>,

        /// Upper bound of the random delay between calls
        #[arg(long, default_value_t = 1000)]
        max_delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.logging)?;

    info!("Starting sliding window counters");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        limit = config.limiter.limit,
        period_secs = config.limiter.period_secs,
        counter_window_ms = config.limiter.counter_window_ms,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let limiter = build_limiter(&config).await?;

    match cli.command {
        Command::Increment {
            key,
            weight,
            count,
            json,
        } => run_increment(limiter.as_ref(), &key, weight, count, json).await,
        Command::Simulate {
            users,
            workers,
            requests,
            max_delay_ms,
        } => {
            tokio::select! {
                _ = run_simulation(limiter.as_ref(), users, workers, requests, max_delay_ms) => {}
                stopped = shutdown_signal() => {
                    let name = stopped?;
                    info!(signal = name, "Simulation interrupted");
                }
            }
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("invalid log level")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn build_limiter(config: &AppConfig) -> anyhow::Result<Arc<dyn Limiter>> {
    let settings = config.limiter.to_settings()?;

    match config.store.backend {
        StoreBackend::Memory => {
            let store = MemoryStore::new();
            spawn_purge(store.clone(), settings.period);
            info!("Using in-memory counter store");
            Ok(Arc::new(SlidingWindowLimiter::new(store, settings)?))
        }
        StoreBackend::Redis => redis_limiter(&config.store.redis_url, settings).await,
    }
}

#[cfg(feature = "redis")]
async fn redis_limiter(url: &str, settings: LimiterSettings) -> anyhow::Result<Arc<dyn Limiter>> {
    let store = sliding_window_counters::store::RedisStore::connect(url).await?;
    Ok(Arc::new(SlidingWindowLimiter::new(store, settings)?))
}

#[cfg(not(feature = "redis"))]
async fn redis_limiter(_url: &str, _settings: LimiterSettings) -> anyhow::Result<Arc<dyn Limiter>> {
    anyhow::bail!("the redis backend requires building with the `redis` feature")
}

/// Periodically drop expired records so idle keys do not accumulate.
fn spawn_purge(store: MemoryStore, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            store.purge_expired();
        }
    });
}

async fn run_increment(
    limiter: &dyn Limiter,
    key: &str,
    weight: u64,
    count: u32,
    json: bool,
) -> anyhow::Result<()> {
    for _ in 0..count {
        let outcome = limiter.increment(key, weight).await;
        let (admitted, status) = match &outcome {
            Ok(status) => (true, status),
            Err(RateLimitError::Exceeded(status)) => (false, status),
            Err(e) => return Err(anyhow::anyhow!("increment failed: {e}")),
        };

        if json {
            let line = serde_json::json!({
                "key": key,
                "admitted": admitted,
                "remaining": status.remaining,
                "limit": status.limit,
                "period_secs": status.period.as_secs_f64(),
                "reset": status.reset.to_rfc3339(),
            });
            println!("{line}");
        } else if admitted {
            println!(
                "{key}: admitted, {} of {} remaining, resets at {}",
                status.remaining, status.limit, status.reset
            );
        } else if let Err(e) = &outcome {
            println!("{key}: rejected, {e}");
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct SimulationStats {
    admitted: u64,
    rejected: u64,
    failed: u64,
}

async fn run_simulation(
    limiter: &dyn Limiter,
    users: u32,
    workers: u32,
    requests: Option<u64>,
    max_delay_ms: u64,
) {
    let users = users.max(1);
    let workers = workers.max(1);
    let per_worker = requests.map(|total| total.div_ceil(u64::from(workers)));

    info!(users, workers, ?requests, max_delay_ms, "Starting simulation");

    let runs = (0..workers).map(|_| simulate_worker(limiter, users, per_worker, max_delay_ms));
    let stats = futures::future::join_all(runs).await.into_iter().fold(
        SimulationStats::default(),
        |mut acc, s| {
            acc.admitted += s.admitted;
            acc.rejected += s.rejected;
            acc.failed += s.failed;
            acc
        },
    );

    info!(
        admitted = stats.admitted,
        rejected = stats.rejected,
        failed = stats.failed,
        "Simulation finished"
    );
}

async fn simulate_worker(
    limiter: &dyn Limiter,
    users: u32,
    requests: Option<u64>,
    max_delay_ms: u64,
) -> SimulationStats {
    let mut stats = SimulationStats::default();
    let mut sent = 0u64;

    while requests.map_or(true, |limit| sent < limit) {
        let (user, delay) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(0..users), rng.gen_range(0..=max_delay_ms))
        };
        let key = format!("user{user}");

        match limiter.increment(&key, 1).await {
            Ok(status) => {
                stats.admitted += 1;
                info!(key = %key, remaining = status.remaining, "call admitted");
            }
            Err(RateLimitError::Exceeded(status)) => {
                stats.rejected += 1;
                info!(key = %key, reset = %status.reset, "call rejected");
            }
            Err(e) => {
                stats.failed += 1;
                warn!(key = %key, error = %e, "call failed");
            }
        }
        sent += 1;

        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    stats
}

/// Resolve with the name of the first stop signal received.
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            res = signal::ctrl_c() => res.map(|()| "Ctrl+C").context("failed to listen for Ctrl+C"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
        Ok("Ctrl+C")
    }
}
