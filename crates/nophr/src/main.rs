mod cli;

use std::io;
use std::sync::Arc;

use clap::Parser as _;
use snafu::{ResultExt as _, Snafu};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use nophr_cache::Engine as CacheEngine;
use nophr_config::{CacheEngine as ConfigCacheEngine, Config, ConfigError, StorageDriver};
use nophr_db::{Database, DbError, EventStoreDriver};
use nophr_node::Node;
use nophr_server::{AppState, ServerError};

use cli::{Opts, OptsCmd};

pub const LOG_TARGET: &str = "nophr::cli";

#[derive(Debug, Snafu)]
pub enum CliError {
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },
    #[snafu(display("--config <path> is required to run the gateway"))]
    MissingConfigPath,
    #[snafu(display("Storage initialization error: {source}"))]
    StorageInit { source: DbError },
    #[snafu(display("Server initialization error: {source}"))]
    ServerInit { source: ServerError },
    #[snafu(display("Logging initialization failed"))]
    Logging,
}

pub type CliResult<T> = std::result::Result<T, CliError>;

#[snafu::report]
#[tokio::main]
async fn main() -> CliResult<()> {
    let opts = Opts::parse();

    match opts.cmd {
        Some(OptsCmd::Init) => {
            print!("{}", nophr_config::EXAMPLE_CONFIG);
            Ok(())
        }
        None => {
            let config_path = opts.config.ok_or(CliError::MissingConfigPath)?;
            let config = Arc::new(Config::load(&config_path).context(ConfigSnafu)?);
            init_logging(&config.logging.level)?;
            run(config).await
        }
    }
}

async fn run(config: Arc<Config>) -> CliResult<()> {
    info!(
        target: LOG_TARGET,
        site = %config.site.title,
        owner = %config.owner,
        "Starting nophr"
    );

    let driver = match config.storage.driver {
        StorageDriver::Sqlite => EventStoreDriver::Sqlite,
        StorageDriver::Redb => EventStoreDriver::Redb,
    };
    let db = Arc::new(
        Database::open(driver, &config.storage.data_dir)
            .await
            .context(StorageInitSnafu)?,
    );

    let cache_engine = match config.caching.engine {
        ConfigCacheEngine::Memory => CacheEngine::Memory,
        ConfigCacheEngine::Redis => CacheEngine::Redis,
        ConfigCacheEngine::None => CacheEngine::None,
    };
    let cache = nophr_cache::build_cache(
        config.caching.enabled,
        cache_engine,
        config.caching.redis_url.as_deref(),
        config.caching.max_size_mb * 1024 * 1024,
        std::time::Duration::from_secs(config.caching.cleanup_interval_seconds.max(1)),
    );

    let node = Node::start(config.clone(), db, cache).await;

    let (listener_cancel_tx, listener_cancel_rx) = watch::channel(false);
    let state = AppState::new(node.clone(), config);
    let listeners = nophr_server::spawn_listeners(state, listener_cancel_rx)
        .await
        .context(ServerInitSnafu)?;

    shutdown_signal().await;
    info!(target: LOG_TARGET, "Shutdown signal received");

    // Stop accepting first, then wind the node down (pool, ingest
    // drain, cursor flush, stores).
    let _ = listener_cancel_tx.send(true);
    for listener in listeners {
        listener.abort();
    }
    node.shutdown().await;

    Ok(())
}

fn init_logging(level: &str) -> CliResult<()> {
    let default = match level {
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default.into())
                .with_env_var("NOPHR_LOG")
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| CliError::Logging)?;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
