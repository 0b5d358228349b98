// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server listener.
//!
//! A [`Listener`] consumes a service queue and turns every inbound envelope
//! into an accepted channel: a [`RequestContext`] for plain requests, a
//! [`DuplexChannel`] for session openings. Several listeners (in this or
//! other processes) may consume the same service queue; the broker hands
//! each request to exactly one of them.
//!
//! Closing the listener while callers are blocked in
//! [`Listener::accept_channel`] makes those calls return `Ok(None)`.

use crate::address::Address;
use crate::broker::{next_envelope, publish_envelope, BrokerRef, Consumer};
use crate::config::TransportConfig;
use crate::correlation::{CorrelationId, SessionId};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{RpcError, RpcResult};
use crate::fault::{translate_outcome, FaultRecord};
use crate::session::DuplexChannel;
use crate::state::{CommunicationObject, CommunicationState, StateMachine};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Channel handed out by [`Listener::accept_channel`].
#[derive(Debug)]
pub enum AcceptedChannel {
    /// A single request (one-way or two-way).
    Request(RequestContext),
    /// A duplex session opened by a client; already `Opened`.
    Session(DuplexChannel),
}

/// Server side of the request/reply transport.
pub struct Listener {
    broker: BrokerRef,
    address: Address,
    config: TransportConfig,
    state: StateMachine,
    consumer: Mutex<Option<Consumer>>,
    accepted: AtomicU64,
}

impl Listener {
    pub fn new(broker: BrokerRef, address: Address, config: TransportConfig) -> Self {
        let label = format!("listener {}", address);
        Self {
            broker,
            address,
            config,
            state: StateMachine::new(label),
            consumer: Mutex::new(None),
            accepted: AtomicU64::new(0),
        }
    }

    /// Service address this listener serves.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Channels handed out so far.
    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> CommunicationState {
        self.state.current()
    }

    /// Declare the service queue and start consuming it.
    pub async fn open(&self, timeout: Duration) -> RpcResult<()> {
        self.state.begin_open()?;

        let queue = self.address.queue_name();
        let options = self.config.service_queue_options();
        let acquired = tokio::time::timeout(timeout, async {
            self.broker
                .ensure_queue(&queue, &options)
                .and_then(|()| self.broker.consume(&queue))
        })
        .await;

        let consumer = match acquired {
            Ok(Ok(consumer)) => consumer,
            Ok(Err(e)) => {
                self.state.fault();
                return Err(e.into());
            }
            Err(_) => {
                self.state.fault();
                return Err(RpcError::TimedOut(timeout));
            }
        };

        *self.consumer.lock().await = Some(consumer);
        if let Err(e) = self.state.complete_open() {
            self.release_consumer();
            return Err(e);
        }
        tracing::info!("Listening on '{}'", queue);
        Ok(())
    }

    /// Wait for the next inbound channel.
    ///
    /// # Returns
    /// - `Ok(Some(channel))` for a new request or session
    /// - `Ok(None)` when the listener is closed or aborted, including while
    ///   this call was blocked
    /// - `Err(RpcError::TimedOut)` when nothing arrived in time
    /// - `Err(RpcError::TransportFaulted)` when the broker failed
    pub async fn accept_channel(&self, timeout: Duration) -> RpcResult<Option<AcceptedChannel>> {
        match self.state.current() {
            CommunicationState::Opened => {}
            CommunicationState::Faulted => return Err(self.state.interruption_error()),
            state if state.is_shutting_down() => return Ok(None),
            state => {
                return Err(RpcError::InvalidState {
                    expected: "Opened",
                    actual: state,
                })
            }
        }

        let outcome = tokio::select! {
            biased;
            _ = self.state.wait_shutting_down() => Ok(None),
            received = self.receive_next() => received,
            _ = tokio::time::sleep(timeout) => Err(RpcError::TimedOut(timeout)),
        };

        match outcome {
            Ok(Some(channel)) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(Some(channel))
            }
            Ok(None) => self.shutdown_outcome(),
            Err(e) if e.is_transport() => {
                if self.state.fault() {
                    self.release_consumer();
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Next envelope that starts a channel. Cancel-safe.
    async fn receive_next(&self) -> RpcResult<Option<AcceptedChannel>> {
        let mut consumer = self.consumer.lock().await;
        let Some(consumer) = consumer.as_mut() else {
            return Ok(None);
        };

        loop {
            let Some(envelope) = next_envelope(consumer).await? else {
                return Err(RpcError::TransportFaulted(format!(
                    "service queue '{}' was deleted",
                    consumer.queue()
                )));
            };
            if let Some(channel) = self.materialize(envelope)? {
                return Ok(Some(channel));
            }
        }
    }

    /// Result reported to an accept interrupted by a state change.
    fn shutdown_outcome(&self) -> RpcResult<Option<AcceptedChannel>> {
        if self.state.current().is_terminal() {
            self.release_consumer();
        }
        match self.state.current() {
            CommunicationState::Faulted => Err(self.state.interruption_error()),
            _ => Ok(None),
        }
    }

    /// Wrap an inbound envelope. `Ok(None)` skips envelopes that do not
    /// start a channel.
    fn materialize(&self, envelope: Envelope) -> RpcResult<Option<AcceptedChannel>> {
        match envelope.kind {
            EnvelopeKind::Request => Ok(Some(AcceptedChannel::Request(RequestContext::new(
                self.broker.clone(),
                envelope,
            )))),
            EnvelopeKind::SessionOpen => {
                let accepted =
                    DuplexChannel::accept(self.broker.clone(), &self.address, &envelope, &self.config);
                match accepted {
                    Ok(session) => Ok(session.map(AcceptedChannel::Session)),
                    Err(e) if e.is_transport() => Err(e),
                    Err(e) => {
                        tracing::warn!("Rejecting session open on '{}': {}", self.address, e);
                        Ok(None)
                    }
                }
            }
            kind => {
                tracing::warn!(
                    "Dropping {:?} envelope {} on service queue '{}'",
                    kind,
                    envelope.correlation_id,
                    self.address
                );
                Ok(None)
            }
        }
    }

    /// Stop accepting. Blocked and later `accept_channel` calls return
    /// `Ok(None)`; channels already handed out are unaffected. The service
    /// queue is kept for other listeners.
    pub async fn close(&self, timeout: Duration) -> RpcResult<()> {
        if !self.state.begin_close()? {
            return Ok(());
        }

        // Blocked accepts release the consumer lock once they see Closing.
        match tokio::time::timeout(timeout, self.consumer.lock()).await {
            Ok(mut consumer) => {
                consumer.take();
                drop(consumer);
                if self.state.complete_close() {
                    tracing::info!("Listener on '{}' closed", self.address);
                }
                Ok(())
            }
            Err(_) => {
                self.abort();
                Err(RpcError::TimedOut(timeout))
            }
        }
    }

    /// Immediate teardown; blocked accepts return `Ok(None)`.
    pub fn abort(&self) {
        if self.state.abort() {
            tracing::debug!("Listener on '{}' aborted", self.address);
            self.release_consumer();
        }
    }

    /// Drop the consumer if no accept holds it; a holder drops it on exit.
    fn release_consumer(&self) {
        if let Ok(mut consumer) = self.consumer.try_lock() {
            consumer.take();
        }
    }
}

impl CommunicationObject for Listener {
    fn state(&self) -> CommunicationState {
        Listener::state(self)
    }

    fn abort(&self) {
        Listener::abort(self)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Server-side channel for one accepted request.
///
/// Bound to the caller's reply-to; closes itself after the single reply.
/// Replying with a fault leaves the listener untouched.
pub struct RequestContext {
    broker: BrokerRef,
    envelope: Envelope,
    state: StateMachine,
}

impl RequestContext {
    fn new(broker: BrokerRef, envelope: Envelope) -> Self {
        let label = format!("request {}", envelope.correlation_id);
        Self {
            broker,
            envelope,
            state: StateMachine::opened(label),
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.envelope.correlation_id
    }

    pub fn is_one_way(&self) -> bool {
        self.envelope.one_way
    }

    /// Caller's private reply address; `None` for one-way requests.
    pub fn reply_to(&self) -> Option<&Address> {
        self.envelope.reply_to.as_ref()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.envelope.session_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.envelope.payload
    }

    /// Take the request payload; later calls return an empty buffer.
    pub fn receive(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.envelope.payload)
    }

    pub fn reply(&self, payload: Vec<u8>) -> RpcResult<()> {
        self.respond(Ok(payload))
    }

    pub fn reply_fault(&self, fault: FaultRecord) -> RpcResult<()> {
        self.respond(Err(fault))
    }

    /// Publish the processing outcome to the caller and close.
    ///
    /// One-way requests have no reply path; a failure is logged instead.
    /// A second answer fails with [`RpcError::AlreadyClosed`]. A broker
    /// failure faults this context only.
    pub fn respond(&self, outcome: Result<Vec<u8>, FaultRecord>) -> RpcResult<()> {
        if !self.state.begin_close()? {
            return Err(RpcError::AlreadyClosed);
        }

        let published = match (&self.envelope.reply_to, outcome) {
            (None, Ok(_)) => Ok(()),
            (None, Err(fault)) => {
                tracing::warn!(
                    "One-way request {} failed: {}",
                    self.envelope.correlation_id,
                    fault
                );
                Ok(())
            }
            (Some(reply_to), outcome) => {
                let reply = translate_outcome(self.envelope.correlation_id, outcome);
                publish_envelope(self.broker.as_ref(), reply_to, &reply)
            }
        };

        match published {
            Ok(()) => {
                self.state.complete_close();
                Ok(())
            }
            Err(e) => {
                if e.is_transport() {
                    self.state.fault();
                } else {
                    self.state.complete_close();
                }
                Err(e)
            }
        }
    }

    pub fn state(&self) -> CommunicationState {
        self.state.current()
    }
}

impl CommunicationObject for RequestContext {
    fn state(&self) -> CommunicationState {
        RequestContext::state(self)
    }

    fn abort(&self) {
        self.state.abort();
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if !self.envelope.one_way && self.state.current() == CommunicationState::Opened {
            tracing::warn!(
                "Request {} dropped without a reply",
                self.envelope.correlation_id
            );
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("correlation_id", &self.envelope.correlation_id)
            .field("one_way", &self.envelope.one_way)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::fault::FaultCode;
    use std::sync::Arc;

    fn service() -> Address {
        Address::resolve("localhost", 5672, "Echo", None).expect("address")
    }

    async fn open_listener() -> (MemoryBroker, Arc<Listener>) {
        let broker = MemoryBroker::new();
        let listener = Arc::new(Listener::new(
            Arc::new(broker.clone()),
            service(),
            TransportConfig::default(),
        ));
        listener.open(Duration::from_secs(1)).await.expect("open");
        (broker, listener)
    }

    fn accept_request(channel: Option<AcceptedChannel>) -> RequestContext {
        match channel {
            Some(AcceptedChannel::Request(ctx)) => ctx,
            other => panic!("expected a request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reply_reaches_private_queue() {
        let (broker, listener) = open_listener().await;
        let reply_to = service().new_private_reply();
        broker
            .ensure_queue(&reply_to.queue_name(), &Default::default())
            .expect("declare");

        let request = Envelope::request(b"ping".to_vec(), reply_to.clone());
        publish_envelope(&broker, &service(), &request).expect("publish");

        let mut ctx = accept_request(
            listener
                .accept_channel(Duration::from_secs(1))
                .await
                .expect("accept"),
        );
        assert_eq!(ctx.correlation_id(), request.correlation_id);
        assert_eq!(ctx.receive(), b"ping");
        ctx.reply(b"pong".to_vec()).expect("reply");
        assert_eq!(ctx.state(), CommunicationState::Closed);
        assert!(matches!(ctx.reply(Vec::new()), Err(RpcError::AlreadyClosed)));

        let mut consumer = broker.consume(&reply_to.queue_name()).expect("consume");
        let reply = next_envelope(&mut consumer).await.expect("recv").expect("reply");
        assert_eq!(reply.correlation_id, request.correlation_id);
        assert_eq!(reply.payload, b"pong");
        assert_eq!(listener.accepted_count(), 1);
    }

    #[tokio::test]
    async fn test_fault_reply_keeps_listener_open() {
        let (broker, listener) = open_listener().await;
        let reply_to = service().new_private_reply();
        broker
            .ensure_queue(&reply_to.queue_name(), &Default::default())
            .expect("declare");
        publish_envelope(&broker, &service(), &Envelope::request(Vec::new(), reply_to))
            .expect("publish");

        let ctx = accept_request(
            listener
                .accept_channel(Duration::from_secs(1))
                .await
                .expect("accept"),
        );
        ctx.reply_fault(FaultRecord::new(FaultCode::InternalError, "E1"))
            .expect("fault");
        assert_eq!(listener.state(), CommunicationState::Opened);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_times_out() {
        let (_broker, listener) = open_listener().await;
        let err = listener
            .accept_channel(Duration::from_secs(5))
            .await
            .expect_err("timeout");
        assert!(err.is_retryable());
        assert_eq!(listener.state(), CommunicationState::Opened);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_blocked_accept() {
        let (broker, listener) = open_listener().await;

        let waiter = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept_channel(Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        listener.close(Duration::from_secs(30)).await.expect("close");

        let accepted = tokio::time::timeout(Duration::from_secs(30), waiter)
            .await
            .expect("accept returned")
            .expect("join")
            .expect("no error");
        assert!(accepted.is_none());
        assert_eq!(listener.state(), CommunicationState::Closed);
        assert_eq!(broker.consumer_count(&service().queue_name()), Some(0));
        // Service queue survives for other listeners.
        assert!(broker.queue_exists(&service().queue_name()).expect("exists"));

        assert!(listener
            .accept_channel(Duration::from_secs(1))
            .await
            .expect("after close")
            .is_none());
    }

    #[tokio::test]
    async fn test_abort_releases_blocked_accept() {
        let (_broker, listener) = open_listener().await;
        let waiter = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept_channel(Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        listener.abort();
        let accepted = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("unblocked")
            .expect("join")
            .expect("no error");
        assert!(accepted.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_faults_listener() {
        let (broker, listener) = open_listener().await;
        broker.disconnect();

        let err = listener
            .accept_channel(Duration::from_secs(1))
            .await
            .expect_err("transport");
        assert!(err.is_transport());
        assert_eq!(listener.state(), CommunicationState::Faulted);
    }

    #[tokio::test]
    async fn test_one_way_context_has_no_reply_path() {
        let (broker, listener) = open_listener().await;
        publish_envelope(&broker, &service(), &Envelope::one_way(b"ack".to_vec()))
            .expect("publish");

        let ctx = accept_request(
            listener
                .accept_channel(Duration::from_secs(1))
                .await
                .expect("accept"),
        );
        assert!(ctx.is_one_way());
        assert!(ctx.reply_to().is_none());
        ctx.reply_fault(FaultRecord::new(FaultCode::InternalError, "ignored"))
            .expect("logged only");
        assert_eq!(broker.queue_names(), vec![service().queue_name()]);
    }

    #[tokio::test]
    async fn test_stray_replies_are_skipped() {
        let (broker, listener) = open_listener().await;
        publish_envelope(
            &broker,
            &service(),
            &Envelope::reply_for(CorrelationId::new(), Vec::new()),
        )
        .expect("publish");
        publish_envelope(&broker, &service(), &Envelope::one_way(Vec::new())).expect("publish");

        let accepted = listener
            .accept_channel(Duration::from_secs(1))
            .await
            .expect("accept");
        assert!(matches!(accepted, Some(AcceptedChannel::Request(_))));
    }

    #[tokio::test]
    async fn test_stale_session_open_is_dropped() {
        let (broker, listener) = open_listener().await;
        // The client endpoint was never declared (or already deleted).
        let gone = service().new_session_endpoint();
        publish_envelope(&broker, &service(), &Envelope::session_open(SessionId::new(), gone))
            .expect("publish");
        publish_envelope(&broker, &service(), &Envelope::one_way(Vec::new())).expect("publish");

        let accepted = listener
            .accept_channel(Duration::from_secs(1))
            .await
            .expect("accept");
        assert!(matches!(accepted, Some(AcceptedChannel::Request(_))));
        assert_eq!(broker.queue_names(), vec![service().queue_name()]);
    }
}
