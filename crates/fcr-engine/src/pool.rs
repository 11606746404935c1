//! Per-pool dispatch: group FIFO queues, concurrency cap, rate limit.
//!
//! Each message group gets its own queue and worker task; the worker retires
//! after five idle minutes and is recreated on the next message. Workers
//! share only the pool semaphore, the token bucket, and the failed
//! batch+group set. Ack/nack decisions go back to the manager, which owns the
//! broker receipts.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use fcr_common::{MessagePointer, PoolConfig, PoolStats, Verdict, DEFAULT_GROUP};

use crate::manager::ManagerHandle;
use crate::mediator::Mediator;
use crate::metrics;

const QUEUE_CAPACITY_MULTIPLIER: u32 = 2;
const MIN_QUEUE_CAPACITY: u32 = 50;
/// NACK delay for messages short-circuited because their batch+group failed.
const CASCADE_NACK_DELAY: u32 = 10;
/// NACK delay for messages bounced during a drain.
const DRAIN_NACK_DELAY: u32 = 5;
/// How long a failed batch+group entry is remembered.
const FAILED_BATCH_TTL: Duration = Duration::from_secs(600);
/// Idle time after which a group worker retires.
const GROUP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// Hard deadline on one mediator dispatch, over and above the HTTP timeout.
const DISPATCH_DEADLINE: Duration = Duration::from_secs(120);

/// Key for cascading-nack tracking: one broker poll response (batch) crossed
/// with one message group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchGroupKey {
    pub batch_id: Arc<str>,
    pub group_id: Arc<str>,
}

impl std::fmt::Display for BatchGroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.batch_id, self.group_id)
    }
}

/// What happened to an enqueue attempt. The manager translates non-`Queued`
/// outcomes into broker nacks since it owns the receipts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The batch+group already failed; nack with the cascade delay.
    FailedBatch,
    /// The pool is draining or gone; nack with the drain delay.
    Stopped,
    /// The pool queue is full; nack with the drain delay and let the broker
    /// redeliver once there is room.
    AtCapacity,
}

struct GroupTask {
    pointer: MessagePointer,
    broker_message_id: String,
    key: BatchGroupKey,
}

struct PoolShared {
    code: Arc<str>,
    manager: ManagerHandle,
    mediator: Arc<dyn Mediator>,
    semaphore: Arc<Semaphore>,
    limiter: RwLock<Option<Arc<DefaultDirectRateLimiter>>>,
    rate_limit_per_minute: RwLock<Option<u32>>,
    groups: DashMap<Arc<str>, mpsc::Sender<GroupTask>>,
    failed_batch_groups: DashMap<BatchGroupKey, Instant>,
    queued: AtomicU32,
    active_workers: AtomicU32,
    accepting: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    queue_capacity: u32,
    isolate_default_group: bool,
}

pub struct PoolDispatcher {
    config: PoolConfig,
    shared: Arc<PoolShared>,
}

impl PoolDispatcher {
    pub fn new(config: PoolConfig, mediator: Arc<dyn Mediator>, manager: ManagerHandle) -> Self {
        let queue_capacity = (config.concurrency * QUEUE_CAPACITY_MULTIPLIER).max(MIN_QUEUE_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        let shared = Arc::new(PoolShared {
            code: Arc::from(config.code.as_str()),
            manager,
            mediator,
            semaphore: Arc::new(Semaphore::new(config.concurrency as usize)),
            limiter: RwLock::new(config.rate_limit_per_minute.and_then(build_limiter)),
            rate_limit_per_minute: RwLock::new(config.rate_limit_per_minute),
            groups: DashMap::new(),
            failed_batch_groups: DashMap::new(),
            queued: AtomicU32::new(0),
            active_workers: AtomicU32::new(0),
            accepting: AtomicBool::new(true),
            shutdown_tx,
            queue_capacity,
            isolate_default_group: config.isolate_default_group,
        });

        info!(
            pool_code = %config.code,
            concurrency = config.concurrency,
            rate_limit = ?config.rate_limit_per_minute,
            "pool dispatcher created"
        );

        Self { config, shared }
    }

    pub fn code(&self) -> &str {
        &self.config.code
    }

    pub fn concurrency(&self) -> u32 {
        self.config.concurrency
    }

    pub fn rate_limit_per_minute(&self) -> Option<u32> {
        *self.shared.rate_limit_per_minute.read()
    }

    /// The worker group this pointer lands on, honoring the pool's
    /// default-group isolation setting. The manager keys its same-group
    /// bookkeeping on this, not on the raw wire group id.
    pub fn group_for(&self, pointer: &MessagePointer) -> Arc<str> {
        self.shared.group_for(pointer)
    }

    /// Queue one pointer under its batch+group. Called only by the manager
    /// actor, so enqueues are naturally serialized.
    pub async fn enqueue(
        &self,
        pointer: MessagePointer,
        batch_id: &Arc<str>,
        broker_message_id: String,
    ) -> EnqueueOutcome {
        let shared = &self.shared;

        if !shared.accepting.load(Ordering::SeqCst) {
            return EnqueueOutcome::Stopped;
        }

        let group_id = shared.group_for(&pointer);
        let key = BatchGroupKey {
            batch_id: batch_id.clone(),
            group_id: group_id.clone(),
        };

        if shared.batch_group_failed(&key) {
            metrics::record_cascade(&shared.code);
            debug!(
                message_id = %pointer.id,
                batch_group = %key,
                "batch+group already failed, cascading"
            );
            return EnqueueOutcome::FailedBatch;
        }

        if shared.queued.load(Ordering::SeqCst) >= shared.queue_capacity {
            warn!(
                pool_code = %shared.code,
                capacity = shared.queue_capacity,
                "pool queue full, bouncing message"
            );
            return EnqueueOutcome::AtCapacity;
        }

        shared.queued.fetch_add(1, Ordering::SeqCst);

        let task = GroupTask {
            pointer,
            broker_message_id,
            key,
        };

        let tx = shared.group_sender(&group_id);
        if let Err(send_err) = tx.send(task).await {
            // The worker idled out between lookup and send; retry once with
            // a fresh worker.
            shared.groups.remove(&group_id);
            let tx = shared.group_sender(&group_id);
            if let Err(send_err) = tx.send(send_err.0).await {
                error!(
                    pool_code = %shared.code,
                    group_id = %group_id,
                    message_id = %send_err.0.broker_message_id,
                    "group queue rejected message twice"
                );
                shared.queued.fetch_sub(1, Ordering::SeqCst);
                return EnqueueOutcome::Stopped;
            }
        }

        EnqueueOutcome::Queued
    }

    /// Stop accepting and bounce queued work; in-flight dispatches finish.
    pub fn drain(&self) {
        if self.shared.accepting.swap(false, Ordering::SeqCst) {
            info!(pool_code = %self.shared.code, queued = self.shared.queued.load(Ordering::SeqCst), "draining pool");
            let _ = self.shared.shutdown_tx.send(());
        }
    }

    pub fn is_fully_drained(&self) -> bool {
        self.shared.queued.load(Ordering::SeqCst) == 0
            && self.shared.active_workers.load(Ordering::SeqCst) == 0
            && self.shared.groups.is_empty()
    }

    /// Swap the token bucket without touching queues or workers.
    pub fn update_rate_limit(&self, rate_limit_per_minute: Option<u32>) {
        let current = *self.shared.rate_limit_per_minute.read();
        if current == rate_limit_per_minute {
            return;
        }

        *self.shared.limiter.write() = rate_limit_per_minute.and_then(build_limiter);
        *self.shared.rate_limit_per_minute.write() = rate_limit_per_minute;

        info!(
            pool_code = %self.shared.code,
            old = ?current,
            new = ?rate_limit_per_minute,
            "rate limit replaced in place"
        );
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_code: self.config.code.clone(),
            concurrency: self.config.concurrency,
            active_workers: self.shared.active_workers.load(Ordering::SeqCst),
            queued: self.shared.queued.load(Ordering::SeqCst),
            group_count: self.shared.groups.len() as u32,
            rate_limit_per_minute: *self.shared.rate_limit_per_minute.read(),
        }
    }
}

fn build_limiter(rate_limit_per_minute: u32) -> Option<Arc<DefaultDirectRateLimiter>> {
    let per_minute = NonZeroU32::new(rate_limit_per_minute)?;
    // Token bucket: sustained rate/60 per second, burst of one second's
    // worth of tokens (at least one).
    let burst = NonZeroU32::new(rate_limit_per_minute.div_ceil(60)).unwrap_or(nonzero!(1u32));
    Some(Arc::new(RateLimiter::direct(
        Quota::per_minute(per_minute).allow_burst(burst),
    )))
}

impl PoolShared {
    fn group_for(&self, pointer: &MessagePointer) -> Arc<str> {
        match pointer.message_group_id.as_deref().filter(|g| !g.is_empty()) {
            Some(group) => Arc::from(group),
            None if self.isolate_default_group => Arc::from(pointer.id.as_str()),
            None => Arc::from(DEFAULT_GROUP),
        }
    }

    fn batch_group_failed(&self, key: &BatchGroupKey) -> bool {
        let expired = match self.failed_batch_groups.get(key) {
            Some(entry) => {
                if entry.value().elapsed() < FAILED_BATCH_TTL {
                    return true;
                }
                true
            }
            None => false,
        };
        if expired {
            self.failed_batch_groups.remove(key);
        }
        false
    }

    fn mark_batch_group_failed(&self, key: &BatchGroupKey) {
        // Prune on insert so the set never outgrows one TTL window.
        self.failed_batch_groups
            .retain(|_, inserted| inserted.elapsed() < FAILED_BATCH_TTL);

        if self
            .failed_batch_groups
            .insert(key.clone(), Instant::now())
            .is_none()
        {
            warn!(
                pool_code = %self.code,
                batch_group = %key,
                "batch+group marked failed, remaining messages will cascade"
            );
        }
    }

    fn group_sender(self: &Arc<Self>, group_id: &Arc<str>) -> mpsc::Sender<GroupTask> {
        if let Some(tx) = self.groups.get(group_id) {
            return tx.clone();
        }

        // Channel capacity equals the pool queue capacity, so a send after a
        // successful capacity check cannot block the caller.
        let (tx, rx) = mpsc::channel(self.queue_capacity as usize);
        self.groups.insert(group_id.clone(), tx.clone());
        debug!(pool_code = %self.code, group_id = %group_id, "starting group worker");
        tokio::spawn(run_group_worker(self.clone(), group_id.clone(), tx.clone(), rx));
        tx
    }

    async fn request_ack(&self, message_id: &str) {
        if let Err(e) = self.manager.ack(message_id).await {
            warn!(
                pool_code = %self.code,
                message_id = %message_id,
                error = %e,
                "ack request did not reach the manager; broker timer will redeliver"
            );
        }
    }

    async fn request_nack(&self, message_id: &str, delay_seconds: u32) {
        if let Err(e) = self.manager.nack(message_id, delay_seconds).await {
            warn!(
                pool_code = %self.code,
                message_id = %message_id,
                error = %e,
                "nack request did not reach the manager; broker timer will redeliver"
            );
        }
    }
}

async fn run_group_worker(
    shared: Arc<PoolShared>,
    group_id: Arc<str>,
    my_tx: mpsc::Sender<GroupTask>,
    mut rx: mpsc::Receiver<GroupTask>,
) {
    debug!(pool_code = %shared.code, group_id = %group_id, "group worker started");

    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut draining = !shared.accepting.load(Ordering::SeqCst);

    loop {
        if draining {
            // Bounce everything still queued, then exit.
            match rx.try_recv() {
                Ok(task) => {
                    shared.queued.fetch_sub(1, Ordering::SeqCst);
                    shared
                        .request_nack(&task.broker_message_id, DRAIN_NACK_DELAY)
                        .await;
                    continue;
                }
                Err(_) => break,
            }
        }

        let task = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                draining = true;
                continue;
            }
            received = tokio::time::timeout(GROUP_IDLE_TIMEOUT, rx.recv()) => match received {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(_) => {
                    if rx.is_empty() {
                        debug!(pool_code = %shared.code, group_id = %group_id, "group idle, retiring worker");
                        break;
                    }
                    continue;
                }
            }
        };

        shared.queued.fetch_sub(1, Ordering::SeqCst);

        // A failure may have landed while this task sat in the queue.
        if shared.batch_group_failed(&task.key) {
            metrics::record_cascade(&shared.code);
            warn!(
                message_id = %task.pointer.id,
                batch_group = %task.key,
                "batch+group failed while queued, nacking to preserve order"
            );
            shared
                .request_nack(&task.broker_message_id, CASCADE_NACK_DELAY)
                .await;
            continue;
        }

        // Rate token before the semaphore: never hold a permit while throttled.
        let limiter = shared.limiter.read().clone();
        if let Some(limiter) = limiter {
            if limiter.check().is_err() {
                metrics::record_rate_limited(&shared.code);
                let throttled = tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => true,
                    _ = limiter.until_ready() => false,
                };
                if throttled {
                    draining = true;
                    shared
                        .request_nack(&task.broker_message_id, DRAIN_NACK_DELAY)
                        .await;
                    continue;
                }
            }
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                draining = true;
                shared
                    .request_nack(&task.broker_message_id, DRAIN_NACK_DELAY)
                    .await;
                continue;
            }
            permit = shared.semaphore.acquire() => match permit {
                Ok(p) => p,
                Err(_) => {
                    shared
                        .request_nack(&task.broker_message_id, DRAIN_NACK_DELAY)
                        .await;
                    break;
                }
            }
        };

        shared.active_workers.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let verdict = match tokio::time::timeout(DISPATCH_DEADLINE, shared.mediator.dispatch(&task.pointer)).await {
            Ok(verdict) => verdict,
            Err(_) => {
                warn!(
                    message_id = %task.pointer.id,
                    deadline_secs = DISPATCH_DEADLINE.as_secs(),
                    "dispatch deadline exceeded"
                );
                Verdict::Retry { delay_seconds: 10 }
            }
        };
        drop(permit);
        shared.active_workers.fetch_sub(1, Ordering::SeqCst);
        metrics::record_dispatch_latency(&shared.code, started.elapsed());

        match verdict {
            Verdict::Delivered => {
                metrics::record_dispatch(&shared.code, "delivered");
                shared.request_ack(&task.broker_message_id).await;
            }
            Verdict::Retry { delay_seconds } => {
                metrics::record_dispatch(&shared.code, "retry");
                shared.mark_batch_group_failed(&task.key);
                shared
                    .request_nack(&task.broker_message_id, delay_seconds)
                    .await;
            }
            Verdict::Rejected { status } => {
                metrics::record_dispatch(&shared.code, "rejected");
                warn!(
                    message_id = %task.pointer.id,
                    status,
                    "terminal client error, acking so the broker stops redelivering"
                );
                shared.request_ack(&task.broker_message_id).await;
            }
            Verdict::Unavailable { delay_seconds } => {
                metrics::record_circuit_open(&shared.code);
                metrics::record_dispatch(&shared.code, "unavailable");
                shared
                    .request_nack(&task.broker_message_id, delay_seconds)
                    .await;
            }
        }
    }

    // Deregister only our own sender: a replacement worker may already have
    // claimed the group after a send raced our idle retirement.
    shared
        .groups
        .remove_if(&group_id, |_, tx| tx.same_channel(&my_tx));

    // Anything that slipped into the channel while we were retiring goes
    // straight back to the broker; a fresh worker picks it up on redelivery.
    rx.close();
    while let Ok(task) = rx.try_recv() {
        shared.queued.fetch_sub(1, Ordering::SeqCst);
        shared.request_nack(&task.broker_message_id, 0).await;
    }

    debug!(pool_code = %shared.code, group_id = %group_id, "group worker exited");
}
