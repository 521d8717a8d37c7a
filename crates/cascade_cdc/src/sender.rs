//! Asynchronous mutation dispatch to the bus.
//!
//! `send_async` never blocks the caller: each call spawns one publish task and
//! hands back an independent completion handle. No ordering is guaranteed
//! between sends; the downstream deduplicator resolves conflicts by writetime,
//! not arrival order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bus::BusClient;
use crate::error::CdcError;
use crate::model::{self, Mutation};

/// Completion handle for one send. Dropping it does not cancel the in-flight
/// publish.
pub struct SendHandle {
    rx: oneshot::Receiver<Result<(), CdcError>>,
}

impl SendHandle {
    /// Wrap an externally driven completion channel. Lets test doubles and
    /// alternative senders produce handles without spawning.
    pub fn from_receiver(rx: oneshot::Receiver<Result<(), CdcError>>) -> Self {
        Self { rx }
    }

    /// Wait for the publish to resolve.
    pub async fn join(self) -> Result<(), CdcError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CdcError::BrokerUnavailable("send task dropped".into())),
        }
    }
}

/// Bounded retry policy for transient publish failures.
#[derive(Clone, Copy, Debug)]
pub struct SendRetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for SendRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(50),
        }
    }
}

impl SendRetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        // Exponential, capped at 2^6 to keep the worst case bounded.
        self.backoff_base * (1u32 << attempt.min(6))
    }
}

pub trait MutationSender: Send + Sync + 'static {
    /// Dispatch one mutation. Safe under concurrent invocation; each call
    /// returns its own completion handle.
    fn send_async(&self, mutation: Mutation) -> SendHandle;
}

/// Production sender: serializes the record and publishes it keyed by the
/// canonical primary-key bytes on the table's topic.
pub struct BusSender {
    bus: Arc<dyn BusClient>,
    retry: SendRetryPolicy,
}

impl BusSender {
    pub fn new(bus: Arc<dyn BusClient>, retry: SendRetryPolicy) -> Self {
        Self { bus, retry }
    }
}

impl MutationSender for BusSender {
    fn send_async(&self, mutation: Mutation) -> SendHandle {
        let (tx, rx) = oneshot::channel();
        let bus = Arc::clone(&self.bus);
        let retry = self.retry;
        tokio::spawn(async move {
            let result = publish_with_retry(bus.as_ref(), &mutation, retry).await;
            // The caller may have dropped the handle; the publish still
            // completed either way.
            let _ = tx.send(result);
        });
        SendHandle { rx }
    }
}

async fn publish_with_retry(
    bus: &dyn BusClient,
    mutation: &Mutation,
    retry: SendRetryPolicy,
) -> Result<(), CdcError> {
    let topic = mutation.table.topic();
    let key = mutation.key_bytes();
    let payload = model::encode_message(mutation);

    let mut attempt = 0u32;
    loop {
        match bus.publish(&topic, key.clone(), payload.clone()).await {
            Ok(()) => {
                debug!(topic = %topic, digest = %mutation.digest, "mutation published");
                return Ok(());
            }
            Err(err) if err.is_retryable() && attempt < retry.max_retries => {
                let delay = retry.backoff(attempt);
                warn!(
                    topic = %topic,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "publish failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
