// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker collaborator interface.
//!
//! The transport only needs four capabilities from a message broker:
//! publish to a named queue, consume a named queue, declare a queue and
//! delete a queue. Delivery is assumed to be competing-consumer (each
//! message goes to exactly one consumer) with per-queue FIFO ordering.
//!
//! Publishing to a queue that does not exist drops the message, which is
//! how a late reply to an already discarded private queue disappears.

mod memory;

pub use memory::MemoryBroker;

use crate::address::Address;
use crate::envelope::Envelope;
use crate::error::RpcResult;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Shared handle to a broker connection.
pub type BrokerRef = Arc<dyn Broker>;

/// Errors reported by a broker binding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker connection lost")]
    ConnectionLost,

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("broker error: {0}")]
    Other(String),
}

/// Queue declaration options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Owned by a single channel or session.
    pub exclusive: bool,
    /// Reclaim the queue after this long without consumers or traffic.
    /// `None` keeps it until explicitly deleted.
    pub idle_expiry: Option<Duration>,
}

impl QueueOptions {
    /// Options for a shared service queue.
    pub fn service(durable: bool) -> Self {
        Self {
            durable,
            exclusive: false,
            idle_expiry: None,
        }
    }

    /// Options for a private reply or session endpoint queue.
    pub fn private(idle_expiry: Option<Duration>) -> Self {
        Self {
            durable: false,
            exclusive: true,
            idle_expiry,
        }
    }
}

/// Future returned by [`QueueConsumer::recv`].
pub type RecvFuture<'a> = Pin<Box<dyn Future<Output = BrokerResult<Option<Vec<u8>>>> + Send + 'a>>;

/// Binding-specific consumer of one queue.
///
/// `recv` must be cancel-safe: a message is removed from the queue only in
/// the poll that returns it. `Ok(None)` means the queue was deleted or the
/// consumer was cancelled by the broker.
pub trait QueueConsumer: Send {
    fn recv(&mut self) -> RecvFuture<'_>;

    fn queue(&self) -> &str;
}

/// Consumer registered on a queue. Dropping it cancels the subscription.
pub struct Consumer {
    inner: Box<dyn QueueConsumer>,
}

impl Consumer {
    pub fn new(inner: impl QueueConsumer + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    /// Next message body, `None` once the queue is gone.
    pub async fn recv(&mut self) -> BrokerResult<Option<Vec<u8>>> {
        self.inner.recv().await
    }

    /// Name of the consumed queue.
    pub fn queue(&self) -> &str {
        self.inner.queue()
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.queue())
            .finish()
    }
}

/// Capabilities the transport needs from a broker connection.
///
/// Implementations must be safe to call from many tasks at once.
pub trait Broker: Send + Sync {
    /// Publish a message body. Returns once the broker accepted it.
    fn publish(&self, queue: &str, body: Vec<u8>) -> BrokerResult<()>;

    /// Start consuming a queue.
    fn consume(&self, queue: &str) -> BrokerResult<Consumer>;

    /// Declare a queue if it does not exist. Idempotent.
    fn ensure_queue(&self, queue: &str, options: &QueueOptions) -> BrokerResult<()>;

    /// Delete a queue and its messages. Idempotent.
    fn delete_queue(&self, queue: &str) -> BrokerResult<()>;

    /// Whether a queue currently exists.
    fn queue_exists(&self, queue: &str) -> BrokerResult<bool>;
}

/// Encode and publish an envelope to an address.
pub(crate) fn publish_envelope(
    broker: &dyn Broker,
    to: &Address,
    envelope: &Envelope,
) -> RpcResult<()> {
    let body = envelope.encode()?;
    broker.publish(&to.queue_name(), body)?;
    Ok(())
}

/// Next decodable envelope from a consumer.
///
/// Undecodable messages are logged and skipped. `Ok(None)` once the queue
/// is gone.
pub(crate) async fn next_envelope(consumer: &mut Consumer) -> RpcResult<Option<Envelope>> {
    loop {
        let Some(body) = consumer.recv().await? else {
            return Ok(None);
        };
        match Envelope::decode(&body) {
            Ok(envelope) => return Ok(Some(envelope)),
            Err(e) => {
                tracing::warn!(
                    "Dropping undecodable message on '{}': {}",
                    consumer.queue(),
                    e
                );
            }
        }
    }
}

/// Delete a queue, logging instead of failing.
pub(crate) fn delete_queue_best_effort(broker: &dyn Broker, queue: &str) {
    if let Err(e) = broker.delete_queue(queue) {
        tracing::warn!("Failed to delete queue '{}': {}", queue, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_options() {
        let svc = QueueOptions::service(true);
        assert!(svc.durable);
        assert!(!svc.exclusive);
        assert!(svc.idle_expiry.is_none());

        let private = QueueOptions::private(Some(Duration::from_secs(60)));
        assert!(private.exclusive);
        assert!(!private.durable);
        assert_eq!(private.idle_expiry, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_next_envelope_skips_garbage() {
        let broker = MemoryBroker::new();
        broker
            .ensure_queue("q", &QueueOptions::default())
            .expect("declare");
        broker.publish("q", b"garbage".to_vec()).expect("publish");

        let env = Envelope::one_way(b"hello".to_vec());
        broker.publish("q", env.encode().expect("encode")).expect("publish");

        let mut consumer = broker.consume("q").expect("consume");
        let got = next_envelope(&mut consumer)
            .await
            .expect("recv")
            .expect("some");
        assert_eq!(got.payload, b"hello");
    }

    #[test]
    fn test_broker_error_display() {
        assert!(BrokerError::QueueNotFound("q".into())
            .to_string()
            .contains("q"));
    }
}
