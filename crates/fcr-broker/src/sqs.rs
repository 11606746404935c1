//! AWS SQS backend.
//!
//! Nack and visibility extension are both `ChangeMessageVisibility`; ack is
//! `DeleteMessage`. The queue URL is the broker descriptor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::Client;
use tracing::{debug, info, warn};

use fcr_common::BrokerReceipt;

use crate::{BrokerError, QueueBroker, Result};

pub struct SqsBroker {
    client: Client,
    queue_url: String,
    queue_name: String,
    running: AtomicBool,
}

impl SqsBroker {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        let queue_url = queue_url.into();
        let queue_name = queue_url
            .rsplit('/')
            .next()
            .unwrap_or(queue_url.as_str())
            .to_string();

        Self {
            client,
            queue_url,
            queue_name,
            running: AtomicBool::new(true),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "sqs broker stopped");
    }
}

#[async_trait]
impl QueueBroker for SqsBroker {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn poll(&self, max_messages: u32, wait: Duration) -> Result<Vec<(BrokerReceipt, String)>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::Stopped);
        }

        let result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.min(10) as i32)
            .wait_time_seconds((wait.as_secs() as i32).clamp(0, 20))
            .send()
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;

        let sqs_messages = result.messages.unwrap_or_default();
        let mut messages = Vec::with_capacity(sqs_messages.len());

        for msg in sqs_messages {
            let (Some(message_id), Some(receipt_handle), Some(body)) =
                (msg.message_id(), msg.receipt_handle(), msg.body())
            else {
                warn!(queue = %self.queue_name, "sqs delivery missing id, handle, or body; skipping");
                continue;
            };

            messages.push((
                BrokerReceipt {
                    queue: self.queue_name.clone(),
                    message_id: message_id.to_string(),
                    receipt_handle: receipt_handle.to_string(),
                },
                body.to_string(),
            ));
        }

        if !messages.is_empty() {
            debug!(queue = %self.queue_name, count = messages.len(), "polled messages");
        }

        Ok(messages)
    }

    async fn ack(&self, receipt: &BrokerReceipt) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&receipt.receipt_handle)
            .send()
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;

        debug!(queue = %self.queue_name, message_id = %receipt.message_id, "acked");
        Ok(())
    }

    async fn nack(&self, receipt: &BrokerReceipt, delay_seconds: u32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&receipt.receipt_handle)
            .visibility_timeout(delay_seconds as i32)
            .send()
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;

        debug!(
            queue = %self.queue_name,
            message_id = %receipt.message_id,
            delay_seconds,
            "nacked"
        );
        Ok(())
    }

    async fn extend_visibility(&self, receipt: &BrokerReceipt, seconds: u32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&receipt.receipt_handle)
            .visibility_timeout(seconds as i32)
            .send()
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        Ok(())
    }
}
