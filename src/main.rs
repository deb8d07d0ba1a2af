use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gpuflow::app::App;
use gpuflow::config::Config;
use gpuflow::shutdown::install_shutdown_handler;
use gpuflow::store::RedisStore;
use gpuflow::store::Store;

#[derive(Parser, Debug)]
#[command(name = "gpuflow")]
#[command(about = "A GPU-aware compute job dispatcher")]
struct Args {
    /// Backing store address
    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    store_addr: String,

    /// Accelerator class this supervisor serves (e.g. AMD, NVIDIA, TT, CPU).
    /// Empty means the supervisor only takes jobs with no GPU requirement.
    #[arg(long, default_value = "")]
    gpu_type: String,

    /// Stable consumer identifier (defaults to a host-derived id)
    #[arg(long)]
    consumer_id: Option<String>,

    /// HTTP listen address
    #[arg(long, default_value = "0.0.0.0:3000")]
    http_addr: String,

    /// Maximum retry attempts before a job fails permanently
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Delay in seconds before a failed job is requeued
    #[arg(long, default_value = "5")]
    retry_delay_secs: u64,

    /// Idle seconds after which pending entries become reclaimable
    #[arg(long, default_value = "30")]
    pending_timeout_secs: u64,
}

const STARTUP_ATTEMPTS: u32 = 5;

async fn connect_with_retry(addr: &str) -> Result<RedisStore, gpuflow::DispatchError> {
    let mut backoff = Duration::from_millis(500);
    let mut last_error = None;

    for attempt in 1..=STARTUP_ATTEMPTS {
        match RedisStore::connect(addr).await {
            Ok(store) => match store.ping().await {
                Ok(()) => return Ok(store),
                Err(e) => last_error = Some(e),
            },
            Err(e) => last_error = Some(e),
        }
        tracing::warn!(
            addr,
            attempt,
            max_attempts = STARTUP_ATTEMPTS,
            "Backing store unreachable, retrying"
        );
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(5));
    }

    Err(last_error.unwrap_or_else(|| {
        gpuflow::DispatchError::Internal("backing store unreachable".to_string())
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let http_addr: SocketAddr = args.http_addr.parse()?;
    let mut config = Config::new(args.store_addr, args.gpu_type)
        .with_max_retries(args.max_retries)
        .with_retry_delay(Duration::from_secs(args.retry_delay_secs))
        .with_pending_timeout(Duration::from_secs(args.pending_timeout_secs));
    config.http_addr = http_addr;
    if let Some(consumer_id) = args.consumer_id {
        config.consumer_id = consumer_id;
    }

    tracing::info!(
        store_addr = %config.store_addr,
        gpu_type = %config.gpu_type,
        consumer_id = %config.consumer_id,
        http_addr = %config.http_addr,
        "Starting gpuflow"
    );

    let store = connect_with_retry(&config.store_addr).await?;
    let token = install_shutdown_handler();

    let app = App::new(config, Arc::new(store));
    app.run(token).await?;

    Ok(())
}
