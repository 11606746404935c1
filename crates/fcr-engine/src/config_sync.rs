//! Configuration sync against the central topology document.
//!
//! Fetches the pool + queue definitions at startup and every interval after
//! that, then applies the set differences: new pools and queues are
//! deployed, removed ones drain gracefully, and a changed pool is replaced
//! atomically through the manager (rate-limit-only changes swap the token
//! bucket in place instead).

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use fcr_broker::QueueBroker;
use fcr_common::{PoolConfig, QueueDefinition, RouterTopology};

use crate::consumer::QueueConsumer;
use crate::error::EngineError;
use crate::manager::ManagerHandle;
use crate::Result;

/// Builds a broker client from a queue definition's descriptor.
#[async_trait]
pub trait BrokerFactory: Send + Sync {
    async fn create(&self, definition: &QueueDefinition) -> Result<Arc<dyn QueueBroker>>;
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub config_url: String,
    pub interval: Duration,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Grace period for a consumer to stop during undeploy.
    pub consumer_stop_grace: Duration,
}

impl SyncConfig {
    pub fn new(config_url: impl Into<String>) -> Self {
        Self {
            config_url: config_url.into(),
            interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            max_attempts: 12,
            retry_delay: Duration::from_secs(5),
            consumer_stop_grace: Duration::from_secs(30),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

struct DeployedConsumer {
    definition: QueueDefinition,
    stop_tx: broadcast::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

pub struct ConfigSyncer {
    config: SyncConfig,
    http: reqwest::Client,
    manager: ManagerHandle,
    factory: Arc<dyn BrokerFactory>,
    consumers: Mutex<HashMap<String, DeployedConsumer>>,
    pool_state: Mutex<HashMap<String, PoolConfig>>,
    last_hash: Mutex<Option<u64>>,
}

impl ConfigSyncer {
    pub fn new(config: SyncConfig, manager: ManagerHandle, factory: Arc<dyn BrokerFactory>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("failed to build HTTP client");

        Self {
            config,
            http,
            manager,
            factory,
            consumers: Mutex::new(HashMap::new()),
            pool_state: Mutex::new(HashMap::new()),
            last_hash: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// First fetch + apply. Errors here are startup errors.
    pub async fn initial_sync(&self) -> Result<RouterTopology> {
        info!(url = %self.config.config_url, "initial configuration sync");
        let topology = self.fetch().await?;
        self.apply(topology.clone()).await?;
        *self.last_hash.lock() = Some(topology_hash(&topology));
        info!(
            pools = topology.pools.len(),
            queues = topology.queues.len(),
            "initial configuration applied"
        );
        Ok(topology)
    }

    /// One scheduled sync. Fetch failures leave the current deployment
    /// untouched.
    pub async fn sync(&self) -> Result<()> {
        let topology = self.fetch().await?;

        let new_hash = topology_hash(&topology);
        if *self.last_hash.lock() == Some(new_hash) {
            debug!("configuration unchanged");
            return Ok(());
        }

        info!(
            pools = topology.pools.len(),
            queues = topology.queues.len(),
            "configuration changed, applying"
        );
        self.apply(topology).await?;
        *self.last_hash.lock() = Some(new_hash);
        Ok(())
    }

    async fn fetch(&self) -> Result<RouterTopology> {
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts {
            match self.fetch_once().await {
                Ok(topology) => {
                    if attempt > 1 {
                        info!(attempt, "configuration fetched after retries");
                    }
                    return Ok(topology);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < self.config.max_attempts {
                        warn!(
                            attempt,
                            max_attempts = self.config.max_attempts,
                            error = %last_error,
                            "configuration fetch failed, retrying"
                        );
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        error!(error = %last_error, "configuration fetch exhausted retries");
        Err(EngineError::Config(last_error))
    }

    async fn fetch_once(&self) -> Result<RouterTopology> {
        let response = self.http.get(&self.config.config_url).send().await?;

        if !response.status().is_success() {
            return Err(EngineError::Config(format!(
                "config service returned {}",
                response.status()
            )));
        }

        Ok(response.json::<RouterTopology>().await?)
    }

    /// Apply a topology as set differences against the current deployment.
    pub async fn apply(&self, topology: RouterTopology) -> Result<()> {
        let mut desired_pools: HashMap<String, PoolConfig> = HashMap::new();
        for pool in topology.pools {
            if pool.concurrency == 0 {
                error!(pool_code = %pool.code, "rejecting pool with zero concurrency");
                continue;
            }
            desired_pools.insert(pool.code.clone(), pool);
        }

        let current_pools = self.pool_state.lock().clone();

        for (code, current) in &current_pools {
            match desired_pools.get(code) {
                None => {
                    self.manager.undeploy_pool(code).await?;
                }
                Some(desired) if desired != current => {
                    let only_rate_changed = desired.concurrency == current.concurrency
                        && desired.isolate_default_group == current.isolate_default_group;
                    if only_rate_changed {
                        self.manager
                            .update_pool_rate(code, desired.rate_limit_per_minute)
                            .await?;
                    } else {
                        // Deploy over the existing code: the manager swaps
                        // the dispatcher and drains the old one.
                        self.manager.deploy_pool(desired.clone()).await?;
                    }
                }
                Some(_) => {}
            }
        }

        for (code, desired) in &desired_pools {
            if !current_pools.contains_key(code) {
                self.manager.deploy_pool(desired.clone()).await?;
            }
        }

        *self.pool_state.lock() = desired_pools;

        // Queues: phase out removed consumers, then start new ones.
        let desired_queues: HashMap<String, QueueDefinition> = topology
            .queues
            .into_iter()
            .map(|q| (q.identifier.clone(), q))
            .collect();

        let removed: Vec<String> = self
            .consumers
            .lock()
            .iter()
            .filter(|(id, deployed)| {
                desired_queues
                    .get(*id)
                    .map(|d| *d != deployed.definition)
                    .unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in removed {
            self.undeploy_consumer(&id).await;
        }

        for (id, definition) in desired_queues {
            let already_running = self.consumers.lock().contains_key(&id);
            if already_running {
                continue;
            }
            if let Err(e) = self.deploy_consumer(definition).await {
                error!(queue = %id, error = %e, "failed to start consumer");
            }
        }

        Ok(())
    }

    async fn deploy_consumer(&self, definition: QueueDefinition) -> Result<()> {
        let broker = self.factory.create(&definition).await?;
        let (stop_tx, _) = broadcast::channel(1);
        let handle = QueueConsumer::new(broker, self.manager.clone()).spawn(&stop_tx);

        info!(queue = %definition.identifier, "consumer deployed");
        self.consumers.lock().insert(
            definition.identifier.clone(),
            DeployedConsumer {
                definition,
                stop_tx,
                handle,
            },
        );
        Ok(())
    }

    async fn undeploy_consumer(&self, identifier: &str) {
        let deployed = self.consumers.lock().remove(identifier);
        let Some(deployed) = deployed else { return };

        info!(queue = %identifier, "phasing out consumer");
        let _ = deployed.stop_tx.send(());

        if tokio::time::timeout(self.config.consumer_stop_grace, deployed.handle)
            .await
            .is_err()
        {
            warn!(queue = %identifier, "consumer did not stop within grace period");
        }
    }

    /// Stop every deployed consumer; used by the shutdown coordinator.
    pub async fn stop_consumers(&self) {
        let ids: Vec<String> = self.consumers.lock().keys().cloned().collect();
        for id in ids {
            self.undeploy_consumer(&id).await;
        }
    }
}

fn topology_hash(topology: &RouterTopology) -> u64 {
    // serde_json maps are ordered, so the serialized form is canonical
    // enough for change detection.
    let serialized = serde_json::to_string(topology).unwrap_or_default();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    serialized.hash(&mut hasher);
    hasher.finish()
}

/// Spawn the scheduled sync loop. The initial sync is the caller's job.
pub fn spawn_config_sync_task(
    syncer: Arc<ConfigSyncer>,
    shutdown: &broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown.subscribe();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(syncer.interval());
        // The interval fires immediately; skip that first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = syncer.sync().await {
                        warn!(error = %e, "scheduled sync failed, keeping current configuration");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("config sync task stopped");
                    break;
                }
            }
        }
    })
}
