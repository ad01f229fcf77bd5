//! execforge worker entry point.
//!
//! Initializes logging, loads the configuration file, binds to the
//! JetStream buckets and consumer and runs the worker pool until it
//! fails or the process is interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use execforge::config::WorkerConfig;
use execforge::notify::Notifier;
use execforge::retry::RetryPolicy;
use execforge::runner::{RunnerConfig, ToolRunner};
use execforge::store::nats::{self, NatsBlobStore, NatsKvStore, NatsQueue};
use execforge::store::typed::TypedKv;
use execforge::store::KvStore;
use execforge::worker::{WorkerPool, WorkerPoolConfig};

#[derive(Parser, Debug)]
#[command(name = "execforge-worker", about = "Tool execution worker", version)]
struct Cli {
    /// Path to the worker configuration file
    #[arg(long, env = "EXECFORGE_CONFIG", default_value = "worker-config.json")]
    config_file: PathBuf,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    let config = WorkerConfig::load(&cli.config_file)?;
    info!(config_file = %cli.config_file.display(), "configuration loaded");

    let client = nats::connect(&config.connection_config).await?;
    let context = jetstream::new(client);

    let source = Arc::new(NatsBlobStore::open(&context, &config.source_object_store_bucket).await?);
    let results = Arc::new(NatsBlobStore::open(&context, &config.result_object_store_bucket).await?);
    let status_store: Arc<dyn KvStore> =
        Arc::new(NatsKvStore::open(&context, &config.key_value_bucket).await?);
    let queue = Arc::new(
        NatsQueue::bind(
            &context,
            &config.consumer_config.stream_name,
            &config.consumer_config.name,
        )
        .await?,
    );
    info!(
        stream = %config.consumer_config.stream_name,
        consumer = %config.consumer_config.name,
        "bound to task queue"
    );

    let retry = RetryPolicy::default();
    let runner = Arc::new(ToolRunner::new(
        source,
        results,
        Arc::clone(&status_store),
        retry.clone(),
        RunnerConfig {
            tools_dir: config.path_to_tools.clone(),
            work_dir: config.work_dir.clone(),
            inherit_env: config.inherit_env.clone(),
        },
        Some(Notifier::new()?),
    ));

    let status = TypedKv::new(status_store, retry.clone());
    let mut pool = WorkerPool::new(
        WorkerPoolConfig {
            workers: config.worker_threads,
            fetch_expires: Duration::from_secs(config.fetch_expires_secs),
        },
        queue,
        runner,
        status,
        retry,
    );
    pool.start();

    let outcome = tokio::select! {
        result = pool.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
    };
    pool.shutdown().await;
    outcome?;

    Ok(())
}
