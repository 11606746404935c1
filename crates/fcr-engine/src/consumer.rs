//! Queue consumer: one long-poll loop per configured queue.
//!
//! Every non-empty poll becomes a batch with a fresh id. Bodies that fail to
//! parse are nacked immediately with zero delay and do not block the rest of
//! the batch. The valid remainder is handed to the manager synchronously so
//! the next poll only starts once the batch is tracked.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use fcr_broker::{BrokerError, QueueBroker};
use fcr_common::MessagePointer;

use crate::manager::{BatchEntry, ManagerHandle};
use crate::metrics;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Messages requested per poll (broker cap is 10).
    pub max_messages: u32,
    /// Long-poll wait passed to the broker.
    pub wait: Duration,
    /// First backoff after a broker error.
    pub backoff_start: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_messages: 10,
            wait: Duration::from_secs(20),
            backoff_start: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

pub struct QueueConsumer {
    broker: Arc<dyn QueueBroker>,
    manager: ManagerHandle,
    config: ConsumerConfig,
}

impl QueueConsumer {
    pub fn new(broker: Arc<dyn QueueBroker>, manager: ManagerHandle) -> Self {
        Self::with_config(broker, manager, ConsumerConfig::default())
    }

    pub fn with_config(
        broker: Arc<dyn QueueBroker>,
        manager: ManagerHandle,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            manager,
            config,
        }
    }

    /// Spawn the poll loop. It stops when `shutdown` fires; a batch already
    /// fetched at that point is still submitted to the manager first.
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(self.run(shutdown_rx))
    }

    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let queue = self.broker.identifier().to_string();
        let mut backoff = self.config.backoff_start;

        info!(queue = %queue, "consumer started");

        loop {
            // Poll is listed first: a completed poll is always processed
            // (and its batch submitted) before the shutdown branch wins.
            let polled = tokio::select! {
                biased;
                result = self.broker.poll(self.config.max_messages, self.config.wait) => result,
                _ = shutdown_rx.recv() => break,
            };

            match polled {
                Ok(batch) => {
                    backoff = self.config.backoff_start;
                    metrics::record_consumer_poll(&queue, batch.len());
                    if batch.is_empty() {
                        continue;
                    }

                    let batch_id: Arc<str> = Arc::from(uuid::Uuid::new_v4().to_string());
                    let mut entries = Vec::with_capacity(batch.len());

                    for (receipt, body) in batch {
                        match serde_json::from_str::<MessagePointer>(&body) {
                            Ok(pointer) => entries.push(BatchEntry { pointer, receipt }),
                            Err(e) => {
                                metrics::record_malformed(&queue);
                                warn!(
                                    queue = %queue,
                                    message_id = %receipt.message_id,
                                    error = %e,
                                    "malformed body, nacking without delay"
                                );
                                if let Err(e) = self.broker.nack(&receipt, 0).await {
                                    metrics::record_broker_nack_failure(&queue);
                                    warn!(queue = %queue, error = %e, "nack of malformed body failed");
                                }
                            }
                        }
                    }

                    if entries.is_empty() {
                        continue;
                    }

                    debug!(
                        queue = %queue,
                        batch_id = %batch_id,
                        count = entries.len(),
                        "submitting batch to manager"
                    );
                    if let Err(e) = self
                        .manager
                        .submit_batch(batch_id, entries, self.broker.clone())
                        .await
                    {
                        error!(
                            queue = %queue,
                            error = %e,
                            "batch submission failed; broker will redeliver the batch"
                        );
                    }
                }
                Err(BrokerError::Stopped) => break,
                Err(e) => {
                    metrics::record_consumer_error(&queue);
                    warn!(
                        queue = %queue,
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "poll failed, backing off"
                    );
                    let stopped = tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => true,
                        _ = tokio::time::sleep(backoff) => false,
                    };
                    if stopped {
                        break;
                    }
                    backoff = (backoff * 2).min(self.config.backoff_max);
                }
            }
        }

        info!(queue = %queue, "consumer stopped");
    }
}
