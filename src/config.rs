use std::net::SocketAddr;
use std::time::Duration;

/// Runtime configuration for one dispatcher process.
///
/// A process hosts the scheduler's event mirror, one supervisor bound to
/// `gpu_type`, and the HTTP control surface. All coordination between
/// processes goes through the backing store at `store_addr`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backing store connection string, e.g. "redis://127.0.0.1:6379".
    pub store_addr: String,
    /// Accelerator class this supervisor binds to ("AMD", "NVIDIA", ...).
    pub gpu_type: String,
    /// Stable consumer identifier within the worker group.
    pub consumer_id: String,
    pub http_addr: SocketAddr,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Pending entries idle longer than this are eligible for reclaim.
    pub pending_timeout: Duration,
    /// Upper bound for one blocking read on the job log.
    pub read_block_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// A supervisor counts as active while its last heartbeat is this recent.
    pub active_window: Duration,
    pub reclaim_interval: Duration,
    /// Maximum entries reclaimed per scan.
    pub reclaim_batch: usize,
    pub shutdown_deadline: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_addr: "redis://127.0.0.1:6379".to_string(),
            gpu_type: String::new(),
            consumer_id: format!("worker_{}", std::process::id()),
            http_addr: "0.0.0.0:3000".parse().unwrap(),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            pending_timeout: Duration::from_secs(30),
            read_block_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            active_window: Duration::from_secs(30),
            reclaim_interval: Duration::from_secs(10),
            reclaim_batch: 10,
            shutdown_deadline: Duration::from_secs(15),
        }
    }
}

impl Config {
    pub fn new(store_addr: impl Into<String>, gpu_type: impl Into<String>) -> Self {
        Self {
            store_addr: store_addr.into(),
            gpu_type: gpu_type.into(),
            ..Default::default()
        }
    }

    pub fn with_consumer_id(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = consumer_id.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_pending_timeout(mut self, pending_timeout: Duration) -> Self {
        self.pending_timeout = pending_timeout;
        self
    }
}
