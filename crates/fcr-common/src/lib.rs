//! Shared types for the FlowCatalyst message router.
//!
//! Everything that crosses a crate boundary lives here: the wire-level
//! `MessagePointer`, broker receipts, pool and queue definitions, and the
//! mediation `Verdict` enum that drives ack/nack decisions.

use serde::{Deserialize, Serialize};

pub mod logging;

/// Group id used when a pointer carries no `messageGroupId`.
pub const DEFAULT_GROUP: &str = "__DEFAULT__";

// ============================================================================
// Wire types
// ============================================================================

/// A routable message as it arrives in a broker body.
///
/// Wire format is a single camelCase JSON object; a body that fails to parse
/// into this shape is NACKed with zero delay by the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePointer {
    pub id: String,
    pub pool_code: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    pub mediation_type: MediationType,
    pub mediation_target: String,
    #[serde(default)]
    pub message_group_id: Option<String>,
}

impl MessagePointer {
    /// The FIFO group this pointer belongs to, falling back to the shared
    /// default group when none is set.
    pub fn group_id(&self) -> &str {
        self.message_group_id
            .as_deref()
            .filter(|g| !g.is_empty())
            .unwrap_or(DEFAULT_GROUP)
    }
}

/// How a pointer is delivered downstream. Only HTTP is defined today;
/// unknown discriminators fail deserialization and are treated as malformed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediationType {
    HTTP,
}

/// Opaque handle for acknowledging one broker delivery.
///
/// The engine never interprets the fields; only the broker that produced the
/// receipt knows what they mean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerReceipt {
    /// Identifier of the queue this delivery came from.
    pub queue: String,
    /// Broker-assigned message id; unique per delivery, used as the
    /// in-flight tracking key.
    pub message_id: String,
    /// Token required for ack/nack/extend calls.
    pub receipt_handle: String,
}

// ============================================================================
// Topology
// ============================================================================

/// Definition of one dispatch pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub code: String,
    pub concurrency: u32,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    /// When true, pointers without a group id each become their own
    /// single-message group instead of sharing the default group worker.
    #[serde(default)]
    pub isolate_default_group: bool,
}

/// Identity of one queue the router should consume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueDefinition {
    pub identifier: String,
    /// Backend-specific connection settings, interpreted by the broker
    /// factory (queue URL for SQS, database path for the embedded broker).
    #[serde(default)]
    pub broker_descriptor: serde_json::Value,
}

/// The authoritative pool + queue document fetched by the config syncer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouterTopology {
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub queues: Vec<QueueDefinition>,
}

// ============================================================================
// Mediation verdicts
// ============================================================================

/// Outcome of a single mediation attempt.
///
/// Anything other than `Rejected` keeps the message retryable through the
/// broker; there is no in-process retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Target accepted the message; ack it.
    Delivered,
    /// Target (or transport) asked for a retry; nack with the given delay
    /// and mark the batch+group failed so ordering survives.
    Retry { delay_seconds: u32 },
    /// Terminal client error; retrying cannot help, so the message is acked
    /// and the failure surfaced as a warning.
    Rejected { status: u16 },
    /// Circuit breaker refused the call; nack with delay but do not poison
    /// the batch+group, the target may recover.
    Unavailable { delay_seconds: u32 },
}

impl Verdict {
    pub fn is_retry(&self) -> bool {
        matches!(self, Verdict::Retry { .. })
    }
}

// ============================================================================
// Pool snapshot
// ============================================================================

/// Point-in-time view of one dispatcher, for logs and tests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub pool_code: String,
    pub concurrency: u32,
    pub active_workers: u32,
    pub queued: u32,
    pub group_count: u32,
    pub rate_limit_per_minute: Option<u32>,
}
