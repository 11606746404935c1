//! Central routing manager.
//!
//! The manager is the single owner of the in-flight map, the receipt map,
//! and the pool registry. It runs as an actor: consumers, pool workers, the
//! visibility extender, and the config syncer all talk to it through
//! [`ManagerHandle`], and every command is processed serially. Broker calls
//! are spawned after the state mutation so the loop never blocks on I/O.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use fcr_broker::QueueBroker;
use fcr_common::{BrokerReceipt, MessagePointer, PoolConfig, PoolStats};

use crate::error::EngineError;
use crate::mediator::Mediator;
use crate::metrics;
use crate::pool::{EnqueueOutcome, PoolDispatcher};
use crate::Result;

/// NACK delay for pointers addressed to a pool that is not deployed: the
/// config may simply not have arrived yet.
const UNKNOWN_POOL_NACK_DELAY: u32 = 10;
/// NACK delay when a pool bounces a message (draining or full).
const BOUNCE_NACK_DELAY: u32 = 5;
/// NACK delay for enqueue-time cascades.
const CASCADE_NACK_DELAY: u32 = 10;

/// Soft deadline on ack/nack requests from pool workers.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Cap on the consumer's synchronous batch hand-off.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the mediator for a newly deployed pool.
pub type MediatorFactory = Arc<dyn Fn(&PoolConfig) -> Arc<dyn Mediator> + Send + Sync>;

/// One pointer plus the receipt it arrived under.
pub struct BatchEntry {
    pub pointer: MessagePointer,
    pub receipt: BrokerReceipt,
}

/// A message between dedup and broker ack/nack.
struct InFlightEntry {
    #[allow(dead_code)]
    pointer: MessagePointer,
    batch_id: Arc<str>,
    group_id: String,
    pool_code: String,
    enqueued_at: Instant,
}

/// Receipt plus the broker that issued it.
#[derive(Clone)]
struct TrackedReceipt {
    broker: Arc<dyn QueueBroker>,
    receipt: BrokerReceipt,
}

enum Command {
    SubmitBatch {
        batch_id: Arc<str>,
        entries: Vec<BatchEntry>,
        broker: Arc<dyn QueueBroker>,
        reply: oneshot::Sender<()>,
    },
    Ack {
        message_id: String,
    },
    Nack {
        message_id: String,
        delay_seconds: u32,
    },
    DeployPool {
        config: PoolConfig,
        reply: oneshot::Sender<()>,
    },
    UndeployPool {
        code: String,
        reply: oneshot::Sender<bool>,
    },
    UpdatePoolRate {
        code: String,
        rate_limit_per_minute: Option<u32>,
        reply: oneshot::Sender<bool>,
    },
    PoolStats {
        reply: oneshot::Sender<Vec<PoolStats>>,
    },
    InFlightCount {
        reply: oneshot::Sender<usize>,
    },
    ExtendVisibility {
        seconds: u32,
        reply: oneshot::Sender<usize>,
    },
    DrainAll {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable facade over the manager's command channel.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<Command>,
}

impl ManagerHandle {
    /// Hand a polled batch to the manager. Resolves once every entry has
    /// been deduplicated, tracked, and queued (or nacked); capped at 30 s.
    pub async fn submit_batch(
        &self,
        batch_id: Arc<str>,
        entries: Vec<BatchEntry>,
        broker: Arc<dyn QueueBroker>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::SubmitBatch {
                batch_id,
                entries,
                broker,
                reply,
            })
            .await
            .map_err(|_| EngineError::ManagerUnavailable)?;

        tokio::time::timeout(SUBMIT_TIMEOUT, rx)
            .await
            .map_err(|_| EngineError::ManagerTimeout(SUBMIT_TIMEOUT.as_secs()))?
            .map_err(|_| EngineError::ManagerUnavailable)
    }

    pub async fn ack(&self, message_id: &str) -> Result<()> {
        self.send_soft(Command::Ack {
            message_id: message_id.to_string(),
        })
        .await
    }

    pub async fn nack(&self, message_id: &str, delay_seconds: u32) -> Result<()> {
        self.send_soft(Command::Nack {
            message_id: message_id.to_string(),
            delay_seconds,
        })
        .await
    }

    pub async fn deploy_pool(&self, config: PoolConfig) -> Result<()> {
        self.request(|reply| Command::DeployPool { config, reply })
            .await
    }

    /// Returns false when no pool with that code was deployed.
    pub async fn undeploy_pool(&self, code: &str) -> Result<bool> {
        let code = code.to_string();
        self.request(|reply| Command::UndeployPool { code, reply })
            .await
    }

    pub async fn update_pool_rate(
        &self,
        code: &str,
        rate_limit_per_minute: Option<u32>,
    ) -> Result<bool> {
        let code = code.to_string();
        self.request(|reply| Command::UpdatePoolRate {
            code,
            rate_limit_per_minute,
            reply,
        })
        .await
    }

    pub async fn pool_stats(&self) -> Result<Vec<PoolStats>> {
        self.request(|reply| Command::PoolStats { reply }).await
    }

    pub async fn in_flight_count(&self) -> Result<usize> {
        self.request(|reply| Command::InFlightCount { reply }).await
    }

    /// Extend visibility on every tracked receipt. Returns how many receipts
    /// the extension was issued for.
    pub async fn extend_visibility(&self, seconds: u32) -> Result<usize> {
        self.request(|reply| Command::ExtendVisibility { seconds, reply })
            .await
    }

    /// Ask every pool to drain. Queued messages are nacked; dispatches in
    /// flight run to completion.
    pub async fn drain_all(&self) -> Result<()> {
        self.request(|reply| Command::DrainAll { reply }).await
    }

    async fn send_soft(&self, command: Command) -> Result<()> {
        self.tx
            .send_timeout(command, REQUEST_TIMEOUT)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => {
                    EngineError::ManagerTimeout(REQUEST_TIMEOUT.as_secs())
                }
                mpsc::error::SendTimeoutError::Closed(_) => EngineError::ManagerUnavailable,
            })
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| EngineError::ManagerUnavailable)?;
        rx.await.map_err(|_| EngineError::ManagerUnavailable)
    }
}

pub struct RouterManager {
    in_pipeline: HashMap<String, InFlightEntry>,
    receipts: HashMap<String, TrackedReceipt>,
    pools: HashMap<String, Arc<PoolDispatcher>>,
    draining: Vec<Arc<PoolDispatcher>>,
    mediator_factory: MediatorFactory,
    handle: ManagerHandle,
}

impl RouterManager {
    /// Start the actor and return its handle. The actor runs for the life of
    /// the process; pools keep a handle clone, so the loop never observes a
    /// closed channel in practice.
    pub fn spawn(mediator_factory: MediatorFactory) -> ManagerHandle {
        let (tx, rx) = mpsc::channel(256);
        let handle = ManagerHandle { tx };

        let manager = Self {
            in_pipeline: HashMap::new(),
            receipts: HashMap::new(),
            pools: HashMap::new(),
            draining: Vec::new(),
            mediator_factory,
            handle: handle.clone(),
        };

        tokio::spawn(manager.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!("router manager started");

        while let Some(command) = rx.recv().await {
            match command {
                Command::SubmitBatch {
                    batch_id,
                    entries,
                    broker,
                    reply,
                } => {
                    self.handle_submit(batch_id, entries, broker).await;
                    let _ = reply.send(());
                }
                Command::Ack { message_id } => self.finish(&message_id, None),
                Command::Nack {
                    message_id,
                    delay_seconds,
                } => self.finish(&message_id, Some(delay_seconds)),
                Command::DeployPool { config, reply } => {
                    self.deploy_pool(config);
                    let _ = reply.send(());
                }
                Command::UndeployPool { code, reply } => {
                    let found = self.undeploy_pool(&code);
                    let _ = reply.send(found);
                }
                Command::UpdatePoolRate {
                    code,
                    rate_limit_per_minute,
                    reply,
                } => {
                    let found = match self.pools.get(&code) {
                        Some(pool) => {
                            pool.update_rate_limit(rate_limit_per_minute);
                            true
                        }
                        None => false,
                    };
                    let _ = reply.send(found);
                }
                Command::PoolStats { reply } => {
                    let _ = reply.send(self.pools.values().map(|p| p.stats()).collect());
                }
                Command::InFlightCount { reply } => {
                    let _ = reply.send(self.in_pipeline.len());
                }
                Command::ExtendVisibility { seconds, reply } => {
                    let _ = reply.send(self.extend_visibility(seconds));
                }
                Command::DrainAll { reply } => {
                    info!(pools = self.pools.len(), "draining all pools");
                    for pool in self.pools.values() {
                        pool.drain();
                    }
                    for pool in &self.draining {
                        pool.drain();
                    }
                    let _ = reply.send(());
                }
            }
        }

        info!("router manager stopped");
    }

    async fn handle_submit(
        &mut self,
        batch_id: Arc<str>,
        entries: Vec<BatchEntry>,
        broker: Arc<dyn QueueBroker>,
    ) {
        // Groups of this batch that already bounced a message; the rest of
        // the group is nacked unsent so receive order survives the failure.
        // Keyed on the group the pool actually dispatches under, so isolated
        // ungrouped messages never bounce each other.
        let mut bounced_groups: HashSet<(String, Arc<str>)> = HashSet::new();

        for entry in entries {
            let message_id = entry.receipt.message_id.clone();

            if self.in_pipeline.contains_key(&message_id) {
                // Redelivery of a message that is still being worked on.
                // Absorb it and refresh the stored handle so the eventual
                // ack/nack uses one the broker still honors; exactly one
                // terminal broker call is issued per message id.
                metrics::record_duplicate(&entry.receipt.queue);
                debug!(
                    message_id = %message_id,
                    queue = %entry.receipt.queue,
                    "duplicate delivery of in-flight message, refreshing receipt"
                );
                if let Some(tracked) = self.receipts.get_mut(&message_id) {
                    tracked.receipt = entry.receipt;
                }
                continue;
            }

            let Some(pool) = self.pools.get(&entry.pointer.pool_code).cloned() else {
                metrics::record_unknown_pool(&entry.pointer.pool_code);
                warn!(
                    message_id = %entry.pointer.id,
                    pool_code = %entry.pointer.pool_code,
                    "pointer addressed to unknown pool, nacking"
                );
                Self::spawn_nack(broker.clone(), entry.receipt, UNKNOWN_POOL_NACK_DELAY);
                continue;
            };

            let group_id = pool.group_for(&entry.pointer);
            let group_key = (entry.pointer.pool_code.clone(), group_id.clone());
            if bounced_groups.contains(&group_key) {
                debug!(
                    message_id = %entry.pointer.id,
                    group_id = %group_key.1,
                    "earlier message of this group bounced, nacking to keep order"
                );
                Self::spawn_nack(broker.clone(), entry.receipt, BOUNCE_NACK_DELAY);
                continue;
            }

            // Track before handing off: the pool's ack/nack may race the
            // rest of this loop, and must find the entry present.
            self.in_pipeline.insert(
                message_id.clone(),
                InFlightEntry {
                    batch_id: batch_id.clone(),
                    group_id: group_id.to_string(),
                    pool_code: entry.pointer.pool_code.clone(),
                    enqueued_at: Instant::now(),
                    pointer: entry.pointer.clone(),
                },
            );
            self.receipts.insert(
                message_id.clone(),
                TrackedReceipt {
                    broker: broker.clone(),
                    receipt: entry.receipt,
                },
            );

            match pool.enqueue(entry.pointer, &batch_id, message_id.clone()).await {
                EnqueueOutcome::Queued => {}
                EnqueueOutcome::FailedBatch => {
                    self.finish(&message_id, Some(CASCADE_NACK_DELAY));
                }
                EnqueueOutcome::Stopped | EnqueueOutcome::AtCapacity => {
                    self.finish(&message_id, Some(BOUNCE_NACK_DELAY));
                    bounced_groups.insert(group_key);
                }
            }
        }

        metrics::set_in_flight(self.in_pipeline.len());
    }

    /// Remove the tracking entries, then issue the broker call. The removal
    /// happens first so a late duplicate of the same id is detectable as a
    /// fresh delivery rather than an in-flight one.
    fn finish(&mut self, message_id: &str, nack_delay: Option<u32>) {
        let entry = self.in_pipeline.remove(message_id);
        let tracked = self.receipts.remove(message_id);

        let Some(tracked) = tracked else {
            debug!(message_id = %message_id, "ack/nack for untracked message ignored");
            return;
        };

        if let Some(entry) = entry {
            debug!(
                message_id = %message_id,
                pool_code = %entry.pool_code,
                group_id = %entry.group_id,
                batch_id = %entry.batch_id,
                elapsed_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                nack_delay = ?nack_delay,
                "message leaving the pipeline"
            );
        }

        tokio::spawn(async move {
            let queue = tracked.receipt.queue.clone();
            let result = match nack_delay {
                None => tracked.broker.ack(&tracked.receipt).await,
                Some(delay) => tracked.broker.nack(&tracked.receipt, delay).await,
            };
            if let Err(e) = result {
                if nack_delay.is_none() {
                    metrics::record_broker_ack_failure(&queue);
                } else {
                    metrics::record_broker_nack_failure(&queue);
                }
                warn!(
                    queue = %queue,
                    error = %e,
                    "broker ack/nack failed; visibility timer will redeliver"
                );
            }
        });

        metrics::set_in_flight(self.in_pipeline.len());
    }

    fn spawn_nack(broker: Arc<dyn QueueBroker>, receipt: BrokerReceipt, delay_seconds: u32) {
        tokio::spawn(async move {
            if let Err(e) = broker.nack(&receipt, delay_seconds).await {
                metrics::record_broker_nack_failure(&receipt.queue);
                warn!(queue = %receipt.queue, error = %e, "broker nack failed");
            }
        });
    }

    fn deploy_pool(&mut self, config: PoolConfig) {
        self.reap_drained();

        let mediator = (self.mediator_factory)(&config);
        let dispatcher = Arc::new(PoolDispatcher::new(
            config.clone(),
            mediator,
            self.handle.clone(),
        ));

        if let Some(old) = self.pools.insert(config.code.clone(), dispatcher) {
            // Atomic swap: from this point new messages land on the
            // replacement; the old dispatcher drains in the background.
            info!(pool_code = %config.code, "replacing pool, old dispatcher draining");
            old.drain();
            self.draining.push(old);
        } else {
            info!(pool_code = %config.code, "pool deployed");
        }
    }

    fn undeploy_pool(&mut self, code: &str) -> bool {
        self.reap_drained();

        match self.pools.remove(code) {
            Some(pool) => {
                info!(pool_code = %code, "pool undeployed, draining");
                pool.drain();
                self.draining.push(pool);
                true
            }
            None => {
                warn!(pool_code = %code, "undeploy for unknown pool");
                false
            }
        }
    }

    fn reap_drained(&mut self) {
        self.draining.retain(|pool| {
            let done = pool.is_fully_drained();
            if done {
                info!(pool_code = %pool.code(), "drained pool released");
            }
            !done
        });
    }

    fn extend_visibility(&self, seconds: u32) -> usize {
        let snapshot: Vec<TrackedReceipt> = self.receipts.values().cloned().collect();
        let count = snapshot.len();
        if count == 0 {
            return 0;
        }

        tokio::spawn(async move {
            for tracked in snapshot {
                if let Err(e) = tracked
                    .broker
                    .extend_visibility(&tracked.receipt, seconds)
                    .await
                {
                    warn!(
                        queue = %tracked.receipt.queue,
                        message_id = %tracked.receipt.message_id,
                        error = %e,
                        "visibility extension failed"
                    );
                }
            }
            metrics::record_visibility_extension(count);
        });

        debug!(count, seconds, "visibility extension issued");
        count
    }
}

impl std::fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerHandle").finish()
    }
}
