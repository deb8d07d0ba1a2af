//! Process wiring.
//!
//! One `App` hosts the scheduler's event mirror, one supervisor with its
//! heartbeat and reclaim loops, and the HTTP control surface. The tasks
//! share nothing but the backing store; a single cancellation token brings
//! them all down in order.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::Config;
use crate::error::{DispatchError, Result};
use crate::registry::StatusRegistry;
use crate::scheduler::{EventMirror, Scheduler};
use crate::store::Store;
use crate::supervisor::{Executor, HeartbeatLoop, ReclaimLoop, SimulatedExecutor, Supervisor};

pub struct App {
    config: Config,
    store: Arc<dyn Store>,
    scheduler: Arc<Scheduler>,
    registry: Arc<StatusRegistry>,
    supervisor: Arc<Supervisor>,
    mirror: Arc<EventMirror>,
}

impl App {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        Self::with_executor(config, store, Arc::new(SimulatedExecutor))
    }

    pub fn with_executor(
        config: Config,
        store: Arc<dyn Store>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new(store.clone()));
        let registry = Arc::new(StatusRegistry::new(store.clone(), config.active_window));
        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            scheduler.clone(),
            executor,
            &config,
        ));
        let mirror = Arc::new(EventMirror::new(store.clone()));

        Self {
            config,
            store,
            scheduler,
            registry,
            supervisor,
            mirror,
        }
    }

    /// Run every subsystem until the token is cancelled.
    ///
    /// Shutdown order: the HTTP server drains first (in-flight handlers are
    /// abandoned after the shutdown deadline), then the supervisor finishes
    /// its current message, then the heartbeat writes its final inactive
    /// status.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        // Consumer-group creation failing with anything but "already
        // exists" is a startup error.
        self.supervisor.ensure_group().await?;

        let mirror = self.mirror.clone();
        let mirror_token = token.clone();
        let mirror_handle = tokio::spawn(async move { mirror.run(mirror_token).await });

        let supervisor = self.supervisor.clone();
        let supervisor_token = token.clone();
        let supervisor_handle =
            tokio::spawn(async move { supervisor.run(supervisor_token).await });

        let heartbeat = HeartbeatLoop::new(self.registry.clone(), &self.config);
        let heartbeat_token = token.clone();
        let heartbeat_handle = tokio::spawn(async move { heartbeat.run(heartbeat_token).await });

        let reclaim = ReclaimLoop::new(self.store.clone(), self.supervisor.clone(), &self.config);
        let reclaim_token = token.clone();
        let reclaim_handle = tokio::spawn(async move { reclaim.run(reclaim_token).await });

        let api_state = ApiState {
            scheduler: self.scheduler.clone(),
            registry: self.registry.clone(),
        };
        let http_token = token.clone();
        let mut http_handle =
            tokio::spawn(api::serve(self.config.http_addr, api_state, http_token));

        let mut http_result: Result<()> = Ok(());
        tokio::select! {
            _ = token.cancelled() => {
                match tokio::time::timeout(self.config.shutdown_deadline, &mut http_handle).await {
                    Ok(joined) => http_result = flatten_join(joined),
                    Err(_) => {
                        tracing::warn!(
                            "HTTP server exceeded shutdown deadline, abandoning in-flight handlers"
                        );
                        http_handle.abort();
                    }
                }
            }
            joined = &mut http_handle => {
                // The server died on its own; bring the rest down with it.
                token.cancel();
                http_result = flatten_join(joined);
            }
        }

        let background: [(&str, JoinHandle<()>); 4] = [
            ("supervisor", supervisor_handle),
            ("mirror", mirror_handle),
            ("reclaim", reclaim_handle),
            ("heartbeat", heartbeat_handle),
        ];
        for (name, mut handle) in background {
            if tokio::time::timeout(self.config.shutdown_deadline, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!(task = name, "Task did not stop before deadline, aborting");
                handle.abort();
            }
        }

        tracing::info!("Shutdown completed");
        http_result
    }
}

fn flatten_join(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(DispatchError::Internal(format!("HTTP task failed: {e}"))),
    }
}
