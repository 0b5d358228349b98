// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client request channel.
//!
//! Every two-way call allocates its own private reply queue, publishes the
//! request to the service queue and waits on that queue for the correlated
//! reply. The queue is deleted when the call returns, whatever the outcome,
//! so a late reply is dropped by the broker as unroutable.

use crate::address::Address;
use crate::broker::{delete_queue_best_effort, next_envelope, publish_envelope, Broker, BrokerRef};
use crate::config::TransportConfig;
use crate::correlation::PendingTable;
use crate::envelope::Envelope;
use crate::error::{RpcError, RpcResult};
use crate::state::{CommunicationObject, CommunicationState, StateMachine};
use std::time::Duration;

/// Client side of the request/reply transport.
///
/// # Example
///
/// ```rust,no_run
/// use mqrpc::{Address, MemoryBroker, RequestChannel, TransportConfig};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = Arc::new(MemoryBroker::new());
/// let target = Address::resolve("localhost", 5672, "Calculator", None)?;
/// let channel = RequestChannel::new(broker, target, TransportConfig::default());
///
/// channel.open(Duration::from_secs(5)).await?;
/// let reply = channel.send(b"1+1".to_vec(), Duration::from_secs(5)).await?;
/// channel.close(Duration::from_secs(5)).await?;
/// # Ok(())
/// # }
/// ```
pub struct RequestChannel {
    broker: BrokerRef,
    remote: Address,
    config: TransportConfig,
    state: StateMachine,
    pending: PendingTable,
}

impl RequestChannel {
    /// Create a channel targeting a service address. Nothing touches the
    /// broker before [`open`](Self::open).
    pub fn new(broker: BrokerRef, remote: Address, config: TransportConfig) -> Self {
        let label = format!("client {}", remote);
        Self {
            broker,
            remote,
            config,
            state: StateMachine::new(label),
            pending: PendingTable::new(),
        }
    }

    /// Service address this channel sends to.
    pub fn remote(&self) -> &Address {
        &self.remote
    }

    /// Two-way calls currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Bind to the target service.
    ///
    /// The service queue is declared if missing so requests published before
    /// the first listener starts are kept. A broker failure faults the
    /// channel.
    pub async fn open(&self, timeout: Duration) -> RpcResult<()> {
        self.state.begin_open()?;

        let queue = self.remote.queue_name();
        let options = self.config.service_queue_options();
        let acquired = tokio::time::timeout(timeout, async {
            self.broker.ensure_queue(&queue, &options)
        })
        .await;

        match acquired {
            Ok(Ok(())) => {
                self.state.complete_open()?;
                tracing::debug!("Request channel bound to '{}'", queue);
                Ok(())
            }
            Ok(Err(e)) => {
                self.state.fault();
                Err(e.into())
            }
            Err(_) => {
                self.state.fault();
                Err(RpcError::TimedOut(timeout))
            }
        }
    }

    /// Send a two-way request and wait for its reply.
    ///
    /// # Returns
    /// The reply payload, or [`RpcError::Faulted`] when the service answered
    /// with a fault (the channel stays `Opened`). [`RpcError::TimedOut`] when
    /// no reply arrived in time, [`RpcError::Aborted`] when the channel was
    /// aborted meanwhile.
    pub async fn send(&self, payload: Vec<u8>, timeout: Duration) -> RpcResult<Vec<u8>> {
        let reply_to = self.remote.new_private_reply();
        let reply_queue = reply_to.queue_name();
        let request = Envelope::request(payload, reply_to);

        // Registered before the state check: a concurrent close either
        // rejects this call or waits for it.
        let mut call = self.pending.register(request.correlation_id);
        let id = call.id();
        self.state.ensure_opened()?;

        let options = self.config.private_queue_options();
        let mut consumer = self
            .broker
            .ensure_queue(&reply_queue, &options)
            .and_then(|()| self.broker.consume(&reply_queue))
            .map_err(|e| self.fail(e.into()))?;
        let _lease = QueueLease {
            broker: self.broker.as_ref(),
            queue: &reply_queue,
        };
        publish_envelope(self.broker.as_ref(), &self.remote, &request).map_err(|e| self.fail(e))?;
        tracing::debug!(
            "Sent request {} to '{}', waiting on '{}'",
            id,
            self.remote,
            reply_queue
        );

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let reply = loop {
            tokio::select! {
                biased;
                reply = call.wait() => match reply {
                    Some(reply) => break reply,
                    None => return Err(self.state.interruption_error()),
                },
                received = next_envelope(&mut consumer) => match received {
                    Ok(Some(envelope)) => {
                        if !self.pending.complete(envelope) {
                            tracing::warn!("Dropping uncorrelated message on '{}'", reply_queue);
                        }
                    }
                    Ok(None) => {
                        return Err(self.fail(RpcError::TransportFaulted(format!(
                            "reply queue '{}' was deleted",
                            reply_queue
                        ))));
                    }
                    Err(e) => return Err(self.fail(e)),
                },
                _ = self.state.wait_terminal() => return Err(self.state.interruption_error()),
                _ = &mut deadline => {
                    tracing::debug!("Request {} timed out after {:?}", id, timeout);
                    return Err(RpcError::TimedOut(timeout));
                }
            }
        };

        reply.into_reply().map_err(RpcError::Faulted)
    }

    /// Publish a one-way request. Returns once the broker accepted it.
    pub fn send_one_way(&self, payload: Vec<u8>) -> RpcResult<()> {
        self.state.ensure_opened()?;
        let request = Envelope::one_way(payload);
        publish_envelope(self.broker.as_ref(), &self.remote, &request).map_err(|e| self.fail(e))
    }

    /// Orderly close: waits for outstanding calls, then moves to `Closed`.
    ///
    /// If they do not finish in time the channel is aborted and
    /// [`RpcError::TimedOut`] is returned.
    pub async fn close(&self, timeout: Duration) -> RpcResult<()> {
        if !self.state.begin_close()? {
            return Ok(());
        }

        match tokio::time::timeout(timeout, self.pending.wait_drained()).await {
            Ok(()) => {
                self.state.complete_close();
                Ok(())
            }
            Err(_) => {
                tracing::warn!(
                    "Request channel to '{}' did not drain in {:?}, aborting",
                    self.remote,
                    timeout
                );
                self.abort();
                Err(RpcError::TimedOut(timeout))
            }
        }
    }

    /// Immediate teardown; blocked calls return [`RpcError::Aborted`].
    pub fn abort(&self) {
        if self.state.abort() {
            self.pending.clear();
        }
    }

    pub fn state(&self) -> CommunicationState {
        self.state.current()
    }

    /// Fault the channel on transport errors; other errors pass through.
    fn fail(&self, err: RpcError) -> RpcError {
        if err.is_transport() && self.state.fault() {
            self.pending.clear();
        }
        err
    }
}

impl CommunicationObject for RequestChannel {
    fn state(&self) -> CommunicationState {
        RequestChannel::state(self)
    }

    fn abort(&self) {
        RequestChannel::abort(self)
    }
}

impl Drop for RequestChannel {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Deletes a private reply queue when the call that owns it returns.
struct QueueLease<'a> {
    broker: &'a dyn Broker,
    queue: &'a str,
}

impl Drop for QueueLease<'_> {
    fn drop(&mut self) {
        delete_queue_best_effort(self.broker, self.queue);
    }
}
