//! HTTP delivery to mediation targets.
//!
//! One POST per dispatch, no in-process retry: every retryable outcome goes
//! back to the broker as a delayed NACK, which keeps retries durable and
//! observable. The per-pool circuit breaker wraps the call; short-circuited
//! dispatches never reach the wire and count neither as success nor failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fcr_common::{MediationType, MessagePointer, Verdict};

use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};

/// Delivery abstraction the pool workers drive. `HttpMediator` is the real
/// implementation; tests substitute their own.
#[async_trait]
pub trait Mediator: Send + Sync {
    async fn dispatch(&self, pointer: &MessagePointer) -> Verdict;
}

/// Body sent to the target: `{"messageId":"<id>"}`.
#[derive(Debug, Serialize)]
struct DispatchPayload<'a> {
    #[serde(rename = "messageId")]
    message_id: &'a str,
}

/// Body expected on a 200: `{"ack": bool, "delaySeconds": n}`, both optional.
#[derive(Debug, Deserialize)]
struct TargetResponse {
    #[serde(default = "default_ack")]
    ack: bool,
    #[serde(rename = "delaySeconds")]
    delay_seconds: Option<u32>,
}

fn default_ack() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct HttpMediatorConfig {
    /// Overall HTTP timeout per dispatch.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub breaker: BreakerConfig,
    /// NACK delay returned while the breaker is open.
    pub circuit_open_delay_seconds: u32,
    /// NACK delay for 5xx, transport errors, and timeouts.
    pub transient_delay_seconds: u32,
    /// Delay used for a 429 without a parseable Retry-After header.
    pub retry_after_default_seconds: u32,
}

impl Default for HttpMediatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            breaker: BreakerConfig::default(),
            circuit_open_delay_seconds: 30,
            transient_delay_seconds: 10,
            retry_after_default_seconds: 60,
        }
    }
}

pub struct HttpMediator {
    client: Client,
    config: HttpMediatorConfig,
    breaker: CircuitBreaker,
}

impl HttpMediator {
    pub fn new() -> Self {
        Self::with_config(HttpMediatorConfig::default())
    }

    pub fn with_config(config: HttpMediatorConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .expect("failed to build HTTP client");

        let breaker = CircuitBreaker::new(config.breaker.clone());

        Self {
            client,
            config,
            breaker,
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }
}

impl Default for HttpMediator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mediator for HttpMediator {
    async fn dispatch(&self, pointer: &MessagePointer) -> Verdict {
        if pointer.mediation_type != MediationType::HTTP {
            warn!(
                message_id = %pointer.id,
                mediation_type = ?pointer.mediation_type,
                "unsupported mediation type"
            );
            return Verdict::Rejected { status: 0 };
        }

        if !self.breaker.try_acquire() {
            debug!(message_id = %pointer.id, "circuit open, short-circuiting dispatch");
            return Verdict::Unavailable {
                delay_seconds: self.config.circuit_open_delay_seconds,
            };
        }

        let mut request = self
            .client
            .post(&pointer.mediation_target)
            .header("Content-Type", "application/json")
            .json(&DispatchPayload {
                message_id: &pointer.id,
            });

        if let Some(token) = &pointer.auth_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                self.breaker.record_failure();
                warn!(
                    message_id = %pointer.id,
                    target = %pointer.mediation_target,
                    error = %e,
                    timeout = e.is_timeout(),
                    "dispatch transport failure"
                );
                return Verdict::Retry {
                    delay_seconds: self.config.transient_delay_seconds,
                };
            }
        };

        let status = response.status();
        let status_code = status.as_u16();

        if status.is_success() {
            self.breaker.record_success();

            // Missing or unparseable bodies mean ack; only an explicit
            // ack=false defers the message.
            let parsed = response
                .text()
                .await
                .ok()
                .and_then(|body| serde_json::from_str::<TargetResponse>(&body).ok());

            if let Some(reply) = parsed {
                if !reply.ack {
                    let delay = reply.delay_seconds.unwrap_or(0);
                    debug!(
                        message_id = %pointer.id,
                        delay_seconds = delay,
                        "target deferred with ack=false"
                    );
                    return Verdict::Retry {
                        delay_seconds: delay,
                    };
                }
            }

            info!(message_id = %pointer.id, status = status_code, "delivered");
            return Verdict::Delivered;
        }

        if status_code == 429 {
            // Rate limiting by the target is not a target failure.
            self.breaker.record_success();
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(self.config.retry_after_default_seconds);
            warn!(
                message_id = %pointer.id,
                retry_after,
                "target rate limited the dispatch"
            );
            return Verdict::Retry {
                delay_seconds: retry_after,
            };
        }

        if status.is_client_error() {
            // The target reached a verdict; retrying an identical request
            // cannot change it, so the message is terminal.
            self.breaker.record_success();
            warn!(
                message_id = %pointer.id,
                status = status_code,
                target = %pointer.mediation_target,
                "client error from target, not retryable"
            );
            return Verdict::Rejected {
                status: status_code,
            };
        }

        // 5xx and anything else unexpected.
        self.breaker.record_failure();
        warn!(
            message_id = %pointer.id,
            status = status_code,
            "server error from target"
        );
        Verdict::Retry {
            delay_seconds: self.config.transient_delay_seconds,
        }
    }
}
