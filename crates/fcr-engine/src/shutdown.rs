//! Orderly shutdown.
//!
//! Sequence: stop consumers from polling (batches already fetched still
//! reach the manager), join the consumer tasks, drain every pool (queued
//! messages are nacked, running dispatches finish), then wait for the
//! in-flight map to empty within a bounded grace. Anything left after the
//! grace is redelivered by the broker's own timers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config_sync::ConfigSyncer;
use crate::manager::ManagerHandle;

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// How long to wait for a consumer task to exit.
    pub consumer_grace: Duration,
    /// How long to wait for in-flight messages to finish after draining.
    /// Also bounds still-running mediator calls, whose HTTP timeout is 30 s.
    pub drain_grace: Duration,
    pub poll_interval: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            consumer_grace: Duration::from_secs(30),
            drain_grace: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    manager: ManagerHandle,
    syncer: Option<Arc<ConfigSyncer>>,
    consumer_handles: Vec<tokio::task::JoinHandle<()>>,
    config: ShutdownConfig,
}

impl ShutdownCoordinator {
    pub fn new(manager: ManagerHandle) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            manager,
            syncer: None,
            consumer_handles: Vec::new(),
            config: ShutdownConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ShutdownConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_syncer(mut self, syncer: Arc<ConfigSyncer>) -> Self {
        self.syncer = Some(syncer);
        self
    }

    /// The signal consumers and periodic tasks subscribe to.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Track a consumer spawned outside the config syncer.
    pub fn register_consumer(&mut self, handle: tokio::task::JoinHandle<()>) {
        self.consumer_handles.push(handle);
    }

    pub async fn shutdown(self) {
        info!("shutdown initiated");

        // Step 1: no new polls.
        let _ = self.shutdown_tx.send(());
        if let Some(syncer) = &self.syncer {
            syncer.stop_consumers().await;
        }

        // Step 2: consumers finish submitting what they already fetched.
        for handle in self.consumer_handles {
            if tokio::time::timeout(self.config.consumer_grace, handle)
                .await
                .is_err()
            {
                warn!("consumer slow to stop, continuing shutdown");
            }
        }

        // Step 3: pools bounce queued work and let running dispatches finish.
        if let Err(e) = self.manager.drain_all().await {
            warn!(error = %e, "drain request failed");
        }

        // Step 4: bounded wait for the pipeline to empty.
        let started = Instant::now();
        loop {
            match self.manager.in_flight_count().await {
                Ok(0) => break,
                Ok(remaining) => {
                    if started.elapsed() >= self.config.drain_grace {
                        warn!(
                            remaining,
                            "drain grace elapsed; broker timers will redeliver the rest"
                        );
                        break;
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(_) => break,
            }
        }

        info!("shutdown complete");
    }
}
