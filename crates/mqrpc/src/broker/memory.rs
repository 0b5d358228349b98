// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process broker.
//!
//! Queues are FIFO buffers shared by competing consumers: every message is
//! popped by exactly one consumer. Used by the tests and `mqrpc-bench`, and
//! as the reference for what a real binding must provide.

use super::{Broker, BrokerError, BrokerResult, Consumer, QueueConsumer, QueueOptions, RecvFuture};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;

struct MemoryQueue {
    name: String,
    options: QueueOptions,
    messages: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    deleted: AtomicBool,
    consumers: AtomicUsize,
    last_activity: Mutex<Instant>,
}

impl MemoryQueue {
    fn new(name: &str, options: QueueOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            deleted: AtomicBool::new(false),
            consumers: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn push(&self, body: Vec<u8>) {
        self.messages.lock().push_back(body);
        self.touch();
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Vec<u8>> {
        let mut messages = self.messages.lock();
        let body = messages.pop_front()?;
        if !messages.is_empty() {
            // Pass the wakeup on to the next waiting consumer.
            self.notify.notify_one();
        }
        drop(messages);
        self.touch();
        Some(body)
    }

    fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
        self.messages.lock().clear();
        self.notify.notify_waiters();
    }

    fn is_idle_at(&self, now: Instant) -> bool {
        let Some(expiry) = self.options.idle_expiry else {
            return false;
        };
        self.consumers.load(Ordering::Acquire) == 0
            && now.saturating_duration_since(*self.last_activity.lock()) >= expiry
    }
}

struct BrokerInner {
    queues: DashMap<String, Arc<MemoryQueue>>,
    connected: AtomicBool,
}

/// In-process [`Broker`] implementation.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty, connected broker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: DashMap::new(),
                connected: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate losing the connection: every operation fails with
    /// [`BrokerError::ConnectionLost`] and blocked consumers wake up.
    pub fn disconnect(&self) {
        tracing::warn!("Memory broker: connection dropped");
        self.inner.connected.store(false, Ordering::Release);
        for queue in self.inner.queues.iter() {
            queue.notify.notify_waiters();
        }
    }

    /// Restore the connection after [`disconnect`](Self::disconnect).
    pub fn reconnect(&self) {
        self.inner.connected.store(true, Ordering::Release);
    }

    /// Whether the broker is currently reachable.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Number of ready messages in a queue, `None` if it does not exist.
    pub fn message_count(&self, queue: &str) -> Option<usize> {
        self.inner
            .queues
            .get(queue)
            .map(|q| q.messages.lock().len())
    }

    /// Number of active consumers on a queue, `None` if it does not exist.
    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.inner
            .queues
            .get(queue)
            .map(|q| q.consumers.load(Ordering::Acquire))
    }

    /// Names of all declared queues.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.queues.iter().map(|q| q.key().clone()).collect();
        names.sort();
        names
    }

    /// Delete queues whose idle expiry elapsed. Returns the deleted names.
    pub fn reap_idle_queues(&self) -> Vec<String> {
        self.reap_idle_queues_at(Instant::now())
    }

    /// [`reap_idle_queues`](Self::reap_idle_queues) against an explicit clock.
    pub fn reap_idle_queues_at(&self, now: Instant) -> Vec<String> {
        let idle: Vec<String> = self
            .inner
            .queues
            .iter()
            .filter(|q| q.is_idle_at(now))
            .map(|q| q.key().clone())
            .collect();

        for name in &idle {
            if let Some((_, queue)) = self.inner.queues.remove(name) {
                tracing::info!("Memory broker: reaped idle queue '{}'", queue.name);
                queue.mark_deleted();
            }
        }
        idle
    }

    fn check_connected(&self) -> BrokerResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::ConnectionLost)
        }
    }
}

impl Broker for MemoryBroker {
    fn publish(&self, queue: &str, body: Vec<u8>) -> BrokerResult<()> {
        self.check_connected()?;
        match self.inner.queues.get(queue) {
            Some(q) => q.push(body),
            None => tracing::debug!("Memory broker: dropping unroutable message for '{}'", queue),
        }
        Ok(())
    }

    fn consume(&self, queue: &str) -> BrokerResult<Consumer> {
        self.check_connected()?;
        let q = self
            .inner
            .queues
            .get(queue)
            .map(|q| q.clone())
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

        q.consumers.fetch_add(1, Ordering::AcqRel);
        q.touch();
        Ok(Consumer::new(MemoryConsumer {
            queue: q,
            broker: self.inner.clone(),
        }))
    }

    fn ensure_queue(&self, queue: &str, options: &QueueOptions) -> BrokerResult<()> {
        self.check_connected()?;
        self.inner
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| {
                tracing::debug!("Memory broker: declared queue '{}'", queue);
                Arc::new(MemoryQueue::new(queue, options.clone()))
            })
            .touch();
        Ok(())
    }

    fn delete_queue(&self, queue: &str) -> BrokerResult<()> {
        self.check_connected()?;
        if let Some((_, q)) = self.inner.queues.remove(queue) {
            tracing::debug!("Memory broker: deleted queue '{}'", queue);
            q.mark_deleted();
        }
        Ok(())
    }

    fn queue_exists(&self, queue: &str) -> BrokerResult<bool> {
        self.check_connected()?;
        Ok(self.inner.queues.contains_key(queue))
    }
}

struct MemoryConsumer {
    queue: Arc<MemoryQueue>,
    broker: Arc<BrokerInner>,
}

impl QueueConsumer for MemoryConsumer {
    fn recv(&mut self) -> RecvFuture<'_> {
        Box::pin(async move {
            loop {
                let notified = self.queue.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if !self.broker.connected.load(Ordering::Acquire) {
                    return Err(BrokerError::ConnectionLost);
                }
                if self.queue.deleted.load(Ordering::Acquire) {
                    return Ok(None);
                }
                if let Some(body) = self.queue.pop() {
                    return Ok(Some(body));
                }

                notified.await;
            }
        })
    }

    fn queue(&self) -> &str {
        &self.queue.name
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.queue.consumers.fetch_sub(1, Ordering::AcqRel);
        self.queue.touch();
    }
}
