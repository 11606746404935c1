//! FlowCatalyst message routing engine.
//!
//! Data flow: broker → [`consumer::QueueConsumer`] → [`manager::RouterManager`]
//! (dedup, tracking) → [`pool::PoolDispatcher`] (per-group FIFO, concurrency,
//! rate limit) → [`mediator::HttpMediator`] (circuit-broken HTTP POST) →
//! verdict → manager → broker ack/nack.
//!
//! The manager is an actor: every component that needs to touch the in-flight
//! maps sends a command over its channel, which removes concurrent-map
//! hazards by construction. Pools own only their own queues and counters.

pub mod breaker;
pub mod config_sync;
pub mod consumer;
pub mod error;
pub mod manager;
pub mod mediator;
pub mod metrics;
pub mod pool;
pub mod shutdown;
pub mod visibility;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use config_sync::{spawn_config_sync_task, BrokerFactory, ConfigSyncer, SyncConfig};
pub use consumer::{ConsumerConfig, QueueConsumer};
pub use error::EngineError;
pub use manager::{BatchEntry, ManagerHandle, MediatorFactory, RouterManager};
pub use mediator::{HttpMediator, HttpMediatorConfig, Mediator};
pub use pool::{BatchGroupKey, EnqueueOutcome, PoolDispatcher};
pub use shutdown::{ShutdownConfig, ShutdownCoordinator};
pub use visibility::{spawn_visibility_extender, VisibilityConfig};

pub type Result<T> = std::result::Result<T, EngineError>;
