//! Broker contract and backends.
//!
//! The engine only ever talks to a [`QueueBroker`]: long-poll raw bodies,
//! then ack, nack-with-delay, or extend visibility per receipt. Backends are
//! feature-gated; the embedded SQLite broker doubles as the dev-mode queue
//! and the reference implementation for tests.

use std::time::Duration;

use async_trait::async_trait;
use fcr_common::BrokerReceipt;

pub mod error;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqs")]
pub mod sqs;

pub use error::BrokerError;

pub type Result<T> = std::result::Result<T, BrokerError>;

/// One broker endpoint (a single queue) the router consumes from.
///
/// All operations are at-least-once: a failed ack is recovered by the
/// broker's own visibility timer, so callers log and move on rather than
/// retrying in a loop.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Stable identifier for this queue, used in logs and receipts.
    fn identifier(&self) -> &str;

    /// Long-poll up to `max_messages` raw bodies. Returns as soon as at
    /// least one message is available, or after `wait` with an empty list.
    async fn poll(&self, max_messages: u32, wait: Duration) -> Result<Vec<(BrokerReceipt, String)>>;

    /// Remove a message from the queue. Idempotent on the broker side.
    async fn ack(&self, receipt: &BrokerReceipt) -> Result<()>;

    /// Return a message for redelivery after `delay_seconds`. Realized as a
    /// visibility-timeout change on SQS-family brokers.
    async fn nack(&self, receipt: &BrokerReceipt, delay_seconds: u32) -> Result<()>;

    /// Push the redelivery horizon of an in-flight message out to `seconds`
    /// from now.
    async fn extend_visibility(&self, receipt: &BrokerReceipt, seconds: u32) -> Result<()>;
}

/// Publish side of a broker, used by the embedded backend and by tests.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Enqueue a raw body, optionally under a FIFO message group.
    /// Returns the broker-assigned message id.
    async fn publish(&self, body: &str, message_group_id: Option<&str>) -> Result<String>;
}
