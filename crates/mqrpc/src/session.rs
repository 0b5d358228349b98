// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Duplex session transport.
//!
//! A session pairs two endpoint queues, one owned by each side:
//!
//! ```text
//! client                         service queue                  server
//!   | SessionOpen(reply_to = client endpoint) -->|                 |
//!   |                                            |--> accept ----->|
//!   |<------------- SessionAccept(reply_to = server endpoint) -----|
//!   |<================ requests / replies / SessionClose =========>|
//! ```
//!
//! Both sides then run the same [`DuplexChannel`]: a pump task consumes the
//! local endpoint and routes replies to the pending table, requests to
//! [`DuplexChannel::receive`] and a `SessionClose` from the peer to an
//! orderly local close. Either side may send one-way or two-way calls.
//!
//! How many inbound calls are processed at once is set by
//! [`SessionConcurrency`](crate::config::SessionConcurrency): every
//! [`SessionRequest`] holds a permit until it is dropped, so in `single`
//! mode the next `receive` waits for the previous call to finish.

use crate::address::Address;
use crate::broker::{delete_queue_best_effort, next_envelope, publish_envelope, BrokerRef, Consumer};
use crate::config::{SessionConcurrency, TransportConfig};
use crate::correlation::{CorrelationId, PendingTable, SessionId};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{RpcError, RpcResult};
use crate::fault::{translate_outcome, FaultRecord};
use crate::state::{CommunicationObject, CommunicationState, StateMachine};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Inbound calls currently being processed.
#[derive(Default)]
struct InFlight {
    one_way: AtomicUsize,
    two_way: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn counter(&self, one_way: bool) -> &AtomicUsize {
        if one_way {
            &self.one_way
        } else {
            &self.two_way
        }
    }

    fn enter(&self, one_way: bool) {
        self.counter(one_way).fetch_add(1, Ordering::AcqRel);
    }

    fn exit(&self, one_way: bool) {
        self.counter(one_way).fetch_sub(1, Ordering::AcqRel);
        if self.is_idle() {
            self.idle.notify_waiters();
        }
    }

    fn is_idle(&self) -> bool {
        self.one_way.load(Ordering::Acquire) == 0 && self.two_way.load(Ordering::Acquire) == 0
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

/// State shared between a session channel and its pump task.
struct SessionShared {
    broker: BrokerRef,
    session_id: SessionId,
    service: Address,
    local: Address,
    remote: OnceLock<Address>,
    state: StateMachine,
    pending: PendingTable,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
}

impl SessionShared {
    fn remote(&self) -> RpcResult<&Address> {
        self.remote.get().ok_or_else(|| RpcError::InvalidState {
            expected: "Opened",
            actual: self.state.current(),
        })
    }

    fn publish(&self, envelope: &Envelope) -> RpcResult<()> {
        let remote = self.remote()?;
        publish_envelope(self.broker.as_ref(), remote, envelope).map_err(|e| self.fail(e))
    }

    /// Fault the session on transport errors; other errors pass through.
    fn fail(&self, err: RpcError) -> RpcError {
        if err.is_transport() && self.state.fault() {
            tracing::error!("Session {}: {}", self.session_id, err);
            self.release_local();
        }
        err
    }

    /// Drop outstanding calls and the local endpoint queue.
    fn release_local(&self) {
        self.pending.clear();
        self.permits.close();
        delete_queue_best_effort(self.broker.as_ref(), &self.local.queue_name());
    }

    /// Tell the peer the session is over. Best effort.
    fn notify_peer(&self) {
        let Some(remote) = self.remote.get() else {
            return;
        };
        let close = Envelope::session_close(self.session_id);
        if let Err(e) = publish_envelope(self.broker.as_ref(), remote, &close) {
            tracing::warn!(
                "Session {}: failed to notify peer of close: {}",
                self.session_id,
                e
            );
        }
    }

    /// Dispatch one envelope from the local endpoint. Returns `false` once
    /// the pump should stop.
    fn route(&self, envelope: Envelope, inbound: &mpsc::UnboundedSender<Envelope>) -> bool {
        if envelope.session_id != Some(self.session_id) {
            tracing::warn!(
                "Session {}: dropping {:?} addressed to another session",
                self.session_id,
                envelope.kind
            );
            return true;
        }

        match envelope.kind {
            EnvelopeKind::Reply => {
                let id = envelope.correlation_id;
                if !self.pending.complete(envelope) {
                    tracing::debug!("Session {}: late reply {} dropped", self.session_id, id);
                }
                true
            }
            EnvelopeKind::Request => {
                if inbound.send(envelope).is_err() {
                    tracing::debug!("Session {}: receiver gone, request dropped", self.session_id);
                }
                true
            }
            EnvelopeKind::SessionClose => {
                self.peer_closed();
                false
            }
            EnvelopeKind::SessionOpen | EnvelopeKind::SessionAccept => {
                tracing::warn!(
                    "Session {}: unexpected {:?} on session endpoint",
                    self.session_id,
                    envelope.kind
                );
                true
            }
        }
    }

    fn peer_closed(&self) {
        tracing::info!("Session {}: closed by peer", self.session_id);
        let draining = matches!(self.state.begin_close(), Ok(true));

        // The peer will not answer anything still outstanding.
        self.pending.clear();

        if draining {
            delete_queue_best_effort(self.broker.as_ref(), &self.local.queue_name());
            self.state.complete_close();
        }
    }
}

/// Peer endpoint carried by a `SessionAccept`.
fn accepted_endpoint(accept: Envelope) -> RpcResult<Address> {
    accept
        .reply_to
        .ok_or_else(|| RpcError::Codec("session accept without endpoint".into()))
}

async fn pump(
    shared: Arc<SessionShared>,
    mut consumer: Consumer,
    inbound: mpsc::UnboundedSender<Envelope>,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = shared.state.wait_terminal() => break,
            received = next_envelope(&mut consumer) => received,
        };

        match received {
            Ok(Some(envelope)) => {
                if !shared.route(envelope, &inbound) {
                    break;
                }
            }
            Ok(None) => {
                if !shared.state.current().is_shutting_down() {
                    shared.fail(RpcError::TransportFaulted(format!(
                        "session queue '{}' was deleted",
                        consumer.queue()
                    )));
                }
                break;
            }
            Err(e) => {
                shared.fail(e);
                break;
            }
        }
    }
    tracing::debug!("Session {}: pump stopped", shared.session_id);
}

/// One end of a duplex session.
///
/// Created on the client with [`DuplexChannel::new`] + [`open`](Self::open),
/// or handed out already open by
/// [`Listener::accept_channel`](crate::listener::Listener::accept_channel)
/// on the server.
pub struct DuplexChannel {
    shared: Arc<SessionShared>,
    concurrency: SessionConcurrency,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    config: TransportConfig,
}

impl DuplexChannel {
    /// Create the client end of a session with a service.
    pub fn new(broker: BrokerRef, service: Address, config: TransportConfig) -> Self {
        let session_id = SessionId::new();
        Self::build(broker, service, session_id, config, StateMachine::new)
    }

    fn build(
        broker: BrokerRef,
        service: Address,
        session_id: SessionId,
        config: TransportConfig,
        state: fn(String) -> StateMachine,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let local = service.new_session_endpoint();
        let permits = config.session.permits().clamp(1, Semaphore::MAX_PERMITS);

        Self {
            shared: Arc::new(SessionShared {
                broker,
                session_id,
                service,
                local,
                remote: OnceLock::new(),
                state: state(format!("session {}", session_id)),
                pending: PendingTable::new(),
                permits: Arc::new(Semaphore::new(permits)),
                in_flight: InFlight::default(),
            }),
            concurrency: config.session.concurrency,
            inbound: tokio::sync::Mutex::new(rx),
            inbound_tx: Mutex::new(Some(tx)),
            pump: Mutex::new(None),
            config,
        }
    }

    /// Server end of a session, materialized from a `SessionOpen`.
    ///
    /// Declares the local endpoint, answers with `SessionAccept` and starts
    /// pumping. Must be called within a tokio runtime.
    ///
    /// Returns `Ok(None)` when the client endpoint no longer exists: the
    /// client gave up on the open (timeout, abort) before it was accepted.
    pub(crate) fn accept(
        broker: BrokerRef,
        service: &Address,
        open: &Envelope,
        config: &TransportConfig,
    ) -> RpcResult<Option<Self>> {
        let (Some(session_id), Some(remote)) = (open.session_id, open.reply_to.clone()) else {
            return Err(RpcError::Codec(
                "session open without session id or endpoint".into(),
            ));
        };

        if !broker.queue_exists(&remote.queue_name())? {
            tracing::warn!(
                "Session {}: client endpoint '{}' is gone, dropping stale open",
                session_id,
                remote
            );
            return Ok(None);
        }

        let channel = Self::build(
            broker,
            service.clone(),
            session_id,
            config.clone(),
            StateMachine::opened,
        );
        let shared = &channel.shared;
        // Set before anything can fail so teardown can notify the peer.
        let _ = shared.remote.set(remote.clone());

        let local_queue = shared.local.queue_name();
        shared
            .broker
            .ensure_queue(&local_queue, &config.private_queue_options())?;
        let consumer = shared.broker.consume(&local_queue)?;

        let accept = Envelope::session_accept(open, shared.local.clone());
        publish_envelope(shared.broker.as_ref(), &remote, &accept)?;

        channel.start_pump(consumer);
        tracing::info!(
            "Session {} accepted on '{}' (peer '{}')",
            session_id,
            channel.shared.service,
            remote
        );
        Ok(Some(channel))
    }

    /// Open the session: declare the local endpoint, send `SessionOpen` to
    /// the service and wait for its `SessionAccept`.
    ///
    /// Fails with [`RpcError::TimedOut`] (channel `Faulted`) when no service
    /// accepts in time, or [`RpcError::Aborted`] when aborted meanwhile.
    pub async fn open(&self, timeout: Duration) -> RpcResult<()> {
        self.shared.state.begin_open()?;

        match self.handshake(timeout).await {
            Ok(consumer) => {
                if let Err(e) = self.shared.state.complete_open() {
                    self.shared.release_local();
                    return Err(e);
                }
                self.start_pump(consumer);
                tracing::info!(
                    "Session {} opened with '{}'",
                    self.shared.session_id,
                    self.shared.service
                );
                Ok(())
            }
            Err(e) => {
                if !e.is_cancellation() {
                    self.shared.state.fault();
                }
                self.shared.release_local();
                Err(e)
            }
        }
    }

    async fn handshake(&self, timeout: Duration) -> RpcResult<Consumer> {
        let shared = &self.shared;
        let broker = shared.broker.as_ref();
        let local_queue = shared.local.queue_name();

        broker.ensure_queue(
            &shared.service.queue_name(),
            &self.config.service_queue_options(),
        )?;
        broker.ensure_queue(&local_queue, &self.config.private_queue_options())?;
        let mut consumer = broker.consume(&local_queue)?;

        let open = Envelope::session_open(shared.session_id, shared.local.clone());
        publish_envelope(broker, &shared.service, &open)?;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let received = tokio::select! {
                biased;
                _ = shared.state.wait_terminal() => return Err(shared.state.interruption_error()),
                received = next_envelope(&mut consumer) => received?,
                _ = &mut deadline => return Err(RpcError::TimedOut(timeout)),
            };

            match received {
                Some(envelope)
                    if envelope.kind == EnvelopeKind::SessionAccept
                        && envelope.correlation_id == open.correlation_id =>
                {
                    let _ = shared.remote.set(accepted_endpoint(envelope)?);
                    return Ok(consumer);
                }
                Some(envelope) => {
                    tracing::warn!(
                        "Session {}: ignoring {:?} received before accept",
                        shared.session_id,
                        envelope.kind
                    );
                }
                None => {
                    return Err(RpcError::TransportFaulted(format!(
                        "session queue '{}' deleted during open",
                        local_queue
                    )))
                }
            }
        }
    }

    fn start_pump(&self, consumer: Consumer) {
        let Some(inbound) = self.inbound_tx.lock().take() else {
            return;
        };
        let handle = tokio::spawn(pump(self.shared.clone(), consumer, inbound));
        *self.pump.lock() = Some(handle);
    }

    fn stop_pump(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }

    /// Fire-and-forget call to the peer.
    pub fn send_one_way(&self, payload: Vec<u8>) -> RpcResult<()> {
        self.shared.state.ensure_opened()?;
        let request = Envelope::one_way(payload).with_session(self.shared.session_id);
        self.shared.publish(&request)
    }

    /// Two-way call to the peer, answered on this side's endpoint.
    pub async fn call(&self, payload: Vec<u8>, timeout: Duration) -> RpcResult<Vec<u8>> {
        let shared = &self.shared;
        let request =
            Envelope::request(payload, shared.local.clone()).with_session(shared.session_id);
        let mut call = shared.pending.register(request.correlation_id);
        let id = call.id();
        shared.state.ensure_opened()?;
        shared.publish(&request)?;

        let reply = tokio::select! {
            biased;
            reply = call.wait() => reply,
            _ = shared.state.wait_terminal() => None,
            _ = tokio::time::sleep(timeout) => {
                tracing::debug!("Session {}: call {} timed out", shared.session_id, id);
                return Err(RpcError::TimedOut(timeout));
            }
        };

        match reply {
            Some(reply) => reply.into_reply().map_err(RpcError::Faulted),
            None => Err(shared.state.interruption_error()),
        }
    }

    /// Next inbound call from the peer.
    ///
    /// `None` as timeout waits indefinitely: a session is never torn down by
    /// an idle receive. Returns `Ok(None)` once the session is closed (by
    /// either side) and every buffered call was handed out, or right away
    /// after an abort.
    pub async fn receive(&self, timeout: Option<Duration>) -> RpcResult<Option<SessionRequest>> {
        let shared = &self.shared;
        match shared.state.current() {
            CommunicationState::Aborted => return Ok(None),
            CommunicationState::Faulted => return Err(shared.state.interruption_error()),
            state @ (CommunicationState::Created | CommunicationState::Opening) => {
                return Err(RpcError::InvalidState {
                    expected: "Opened",
                    actual: state,
                })
            }
            _ => {}
        }

        let next = async {
            let permit = shared.permits.clone().acquire_owned().await.ok()?;
            let envelope = self.inbound.lock().await.recv().await?;
            Some((permit, envelope))
        };
        let deadline = async move {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };

        let received = tokio::select! {
            biased;
            _ = shared.state.wait_until(CommunicationState::is_interrupted) => None,
            received = next => received,
            _ = deadline => return Err(RpcError::TimedOut(timeout.unwrap_or_default())),
        };

        match received {
            Some((permit, envelope)) => Ok(Some(SessionRequest::new(
                shared.clone(),
                envelope,
                permit,
            ))),
            None if shared.state.current() == CommunicationState::Faulted => {
                Err(shared.state.interruption_error())
            }
            None => Ok(None),
        }
    }

    /// Orderly close.
    ///
    /// Waits for outstanding outbound calls and inbound calls in process,
    /// then sends `SessionClose` to the peer and deletes the local endpoint.
    /// On timeout the session is aborted and [`RpcError::TimedOut`] returned.
    pub async fn close(&self, timeout: Duration) -> RpcResult<()> {
        let shared = &self.shared;
        if !shared.state.begin_close()? {
            return Ok(());
        }

        let drained = tokio::time::timeout(timeout, async {
            shared.pending.wait_drained().await;
            shared.in_flight.wait_idle().await;
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                "Session {} did not drain in {:?}, aborting",
                shared.session_id,
                timeout
            );
            self.abort();
            return Err(RpcError::TimedOut(timeout));
        }

        shared.notify_peer();
        self.stop_pump();
        delete_queue_best_effort(shared.broker.as_ref(), &shared.local.queue_name());
        if shared.state.complete_close() {
            tracing::info!("Session {} closed", shared.session_id);
        }
        Ok(())
    }

    /// Immediate teardown. Blocked `call`s fail with [`RpcError::Aborted`],
    /// blocked `receive`s return `Ok(None)`. The peer is notified.
    pub fn abort(&self) {
        if self.shared.state.abort() {
            tracing::debug!("Session {} aborted", self.shared.session_id);
            self.shared.notify_peer();
            self.shared.release_local();
            self.stop_pump();
        }
    }

    pub fn state(&self) -> CommunicationState {
        self.shared.state.current()
    }

    pub fn session_id(&self) -> SessionId {
        self.shared.session_id
    }

    /// Service the session was opened with.
    pub fn service(&self) -> &Address {
        &self.shared.service
    }

    /// This side's endpoint (the callback address given to the peer).
    pub fn local_endpoint(&self) -> &Address {
        &self.shared.local
    }

    /// The peer's endpoint, known once the handshake completed.
    pub fn remote_endpoint(&self) -> Option<&Address> {
        self.shared.remote.get()
    }

    pub fn concurrency(&self) -> SessionConcurrency {
        self.concurrency
    }

    /// Inbound one-way calls currently being processed.
    pub fn in_flight_one_way(&self) -> usize {
        self.shared.in_flight.one_way.load(Ordering::Acquire)
    }

    /// Inbound two-way calls currently being processed.
    pub fn in_flight_two_way(&self) -> usize {
        self.shared.in_flight.two_way.load(Ordering::Acquire)
    }

    /// Outbound two-way calls waiting for the peer's reply.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }
}

impl CommunicationObject for DuplexChannel {
    fn state(&self) -> CommunicationState {
        DuplexChannel::state(self)
    }

    fn abort(&self) {
        DuplexChannel::abort(self)
    }
}

impl Drop for DuplexChannel {
    fn drop(&mut self) {
        self.abort();
    }
}

impl std::fmt::Debug for DuplexChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexChannel")
            .field("session_id", &self.shared.session_id)
            .field("local", &self.shared.local)
            .field("state", &self.state())
            .finish()
    }
}

/// Inbound call received on a session.
///
/// Counts as in flight (and holds a concurrency permit) until dropped.
pub struct SessionRequest {
    shared: Arc<SessionShared>,
    envelope: Envelope,
    answered: AtomicBool,
    _permit: OwnedSemaphorePermit,
}

impl SessionRequest {
    fn new(shared: Arc<SessionShared>, envelope: Envelope, permit: OwnedSemaphorePermit) -> Self {
        shared.in_flight.enter(envelope.one_way);
        Self {
            shared,
            envelope,
            answered: AtomicBool::new(false),
            _permit: permit,
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.envelope.correlation_id
    }

    pub fn session_id(&self) -> SessionId {
        self.shared.session_id
    }

    pub fn is_one_way(&self) -> bool {
        self.envelope.one_way
    }

    pub fn payload(&self) -> &[u8] {
        &self.envelope.payload
    }

    /// Take the request payload; later calls return an empty buffer.
    pub fn receive(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.envelope.payload)
    }

    /// Answer with a payload.
    pub fn reply(&self, payload: Vec<u8>) -> RpcResult<()> {
        self.respond(Ok(payload))
    }

    /// Answer with a fault. The session stays open.
    pub fn reply_fault(&self, fault: FaultRecord) -> RpcResult<()> {
        self.respond(Err(fault))
    }

    /// Publish the outcome of processing this call.
    ///
    /// A one-way call has no reply path: a failure is only logged. Only the
    /// first answer is sent, later ones fail with
    /// [`RpcError::AlreadyClosed`].
    pub fn respond(&self, outcome: Result<Vec<u8>, FaultRecord>) -> RpcResult<()> {
        if self.answered.swap(true, Ordering::AcqRel) {
            return Err(RpcError::AlreadyClosed);
        }

        if self.envelope.one_way {
            if let Err(fault) = outcome {
                tracing::warn!(
                    "Session {}: one-way call {} failed: {}",
                    self.shared.session_id,
                    self.envelope.correlation_id,
                    fault
                );
            }
            return Ok(());
        }

        if self.shared.state.current().is_terminal() {
            return Err(self.shared.state.interruption_error());
        }
        let Some(reply_to) = &self.envelope.reply_to else {
            return Err(RpcError::Codec("two-way request without reply-to".into()));
        };

        let reply = translate_outcome(self.envelope.correlation_id, outcome)
            .with_session(self.shared.session_id);
        publish_envelope(self.shared.broker.as_ref(), reply_to, &reply)
            .map_err(|e| self.shared.fail(e))
    }
}

impl Drop for SessionRequest {
    fn drop(&mut self) {
        if !self.envelope.one_way
            && !self.answered.load(Ordering::Acquire)
            && self.shared.state.current() == CommunicationState::Opened
        {
            tracing::warn!(
                "Session {}: call {} dropped without a reply",
                self.shared.session_id,
                self.envelope.correlation_id
            );
        }
        self.shared.in_flight.exit(self.envelope.one_way);
    }
}

impl std::fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRequest")
            .field("session_id", &self.shared.session_id)
            .field("correlation_id", &self.envelope.correlation_id)
            .field("one_way", &self.envelope.one_way)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use std::time::Instant;

    fn service() -> Address {
        Address::resolve("localhost", 5672, "Callback", None).expect("address")
    }

    /// Open a session with a hand-rolled acceptor on the service queue.
    async fn connect(config: TransportConfig) -> (MemoryBroker, DuplexChannel, DuplexChannel) {
        let broker = MemoryBroker::new();
        let broker_ref: BrokerRef = Arc::new(broker.clone());
        let svc = service();
        broker_ref
            .ensure_queue(&svc.queue_name(), &config.service_queue_options())
            .expect("declare");

        let acceptor = {
            let broker_ref = broker_ref.clone();
            let svc = svc.clone();
            let config = config.clone();
            tokio::spawn(async move {
                let mut consumer = broker_ref.consume(&svc.queue_name()).expect("consume");
                let open = next_envelope(&mut consumer)
                    .await
                    .expect("recv")
                    .expect("open");
                DuplexChannel::accept(broker_ref, &svc, &open, &config)
                    .expect("accept")
                    .expect("client endpoint exists")
            })
        };

        let client = DuplexChannel::new(broker_ref, svc, config);
        client.open(Duration::from_secs(5)).await.expect("open");
        let server = acceptor.await.expect("join");
        (broker, client, server)
    }

    #[tokio::test]
    async fn test_handshake_links_endpoints() {
        let (_broker, client, server) = connect(TransportConfig::default()).await;

        assert_eq!(client.session_id(), server.session_id());
        assert_eq!(client.state(), CommunicationState::Opened);
        assert_eq!(server.state(), CommunicationState::Opened);
        assert_eq!(client.remote_endpoint(), Some(server.local_endpoint()));
        assert_eq!(server.remote_endpoint(), Some(client.local_endpoint()));
    }

    #[tokio::test]
    async fn test_one_way_order_is_preserved() {
        let (_broker, client, server) = connect(TransportConfig::default()).await;

        for i in 0..5u8 {
            client.send_one_way(vec![i]).expect("send");
        }
        for i in 0..5u8 {
            let request = server
                .receive(Some(Duration::from_secs(1)))
                .await
                .expect("receive")
                .expect("request");
            assert!(request.is_one_way());
            assert_eq!(request.payload(), [i]);
        }
    }

    #[tokio::test]
    async fn test_callback_from_server() {
        let (_broker, client, server) = connect(TransportConfig::default()).await;

        let responder = tokio::spawn(async move {
            let mut request = client
                .receive(None)
                .await
                .expect("receive")
                .expect("request");
            let payload = request.receive();
            request.reply([payload, b"!".to_vec()].concat()).expect("reply");
            // A second answer is rejected.
            assert!(matches!(request.reply(Vec::new()), Err(RpcError::AlreadyClosed)));
            client
        });

        let reply = server
            .call(b"progress".to_vec(), Duration::from_secs(2))
            .await
            .expect("call");
        assert_eq!(reply, b"progress!");
        let _client = responder.await.expect("join");
    }

    #[tokio::test]
    async fn test_fault_keeps_session_open() {
        let (_broker, client, server) = connect(TransportConfig::default()).await;

        let responder = tokio::spawn(async move {
            let request = server.receive(None).await.expect("receive").expect("request");
            request
                .reply_fault(FaultRecord::new(crate::fault::FaultCode::InternalError, "E1"))
                .expect("fault");
            server
        });

        let err = client
            .call(Vec::new(), Duration::from_secs(2))
            .await
            .expect_err("fault");
        assert!(err.fault().expect("fault").message.contains("E1"));
        assert_eq!(client.state(), CommunicationState::Opened);

        let server = responder.await.expect("join");
        assert_eq!(server.state(), CommunicationState::Opened);
    }

    #[tokio::test]
    async fn test_close_propagates_to_peer() {
        let (broker, client, server) = connect(TransportConfig::default()).await;
        let client_queue = client.local_endpoint().queue_name();

        client.send_one_way(b"last".to_vec()).expect("send");
        client.close(Duration::from_secs(1)).await.expect("close");
        assert_eq!(client.state(), CommunicationState::Closed);
        assert!(!broker.queue_exists(&client_queue).expect("exists"));

        // Buffered calls are still handed out, then the session ends.
        let last = server
            .receive(Some(Duration::from_secs(1)))
            .await
            .expect("receive")
            .expect("request");
        assert_eq!(last.payload(), b"last");
        drop(last);
        assert!(server
            .receive(Some(Duration::from_secs(1)))
            .await
            .expect("receive")
            .is_none());
        assert_eq!(server.state(), CommunicationState::Closed);
        assert!(!broker
            .queue_exists(&server.local_endpoint().queue_name())
            .expect("exists"));
    }

    #[tokio::test]
    async fn test_abort_unblocks_receive_and_call() {
        let (_broker, client, server) = connect(TransportConfig::default()).await;
        let client = Arc::new(client);

        let receiver = {
            let client = client.clone();
            tokio::spawn(async move { client.receive(None).await })
        };
        let caller = {
            let client = client.clone();
            tokio::spawn(async move { client.call(Vec::new(), Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        client.abort();
        assert!(receiver.await.expect("join").expect("receive").is_none());
        assert!(matches!(caller.await.expect("join"), Err(RpcError::Aborted)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(client.state(), CommunicationState::Aborted);
        drop(server);
    }

    #[tokio::test]
    async fn test_single_concurrency_serializes_calls() {
        let (_broker, client, server) = connect(TransportConfig::default()).await;
        assert_eq!(server.concurrency(), SessionConcurrency::Single);

        client.send_one_way(b"a".to_vec()).expect("send");
        client.send_one_way(b"b".to_vec()).expect("send");

        let first = server.receive(None).await.expect("receive").expect("first");
        assert_eq!(server.in_flight_one_way(), 1);
        assert!(matches!(
            server.receive(Some(Duration::from_millis(100))).await,
            Err(RpcError::TimedOut(_))
        ));

        drop(first);
        assert_eq!(server.in_flight_one_way(), 0);
        let second = server.receive(None).await.expect("receive").expect("second");
        assert_eq!(second.payload(), b"b");
    }

    #[tokio::test]
    async fn test_multiple_concurrency_overlaps_calls() {
        let config = TransportConfig::default().with_concurrent_sessions(4);
        let (_broker, client, server) = connect(config).await;

        for _ in 0..3 {
            client.send_one_way(Vec::new()).expect("send");
        }
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(server.receive(None).await.expect("receive").expect("request"));
        }
        assert_eq!(server.in_flight_one_way(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_without_acceptor_times_out() {
        let broker = MemoryBroker::new();
        let client = DuplexChannel::new(
            Arc::new(broker.clone()),
            service(),
            TransportConfig::default(),
        );

        let err = client.open(Duration::from_secs(10)).await.expect_err("open");
        assert!(matches!(err, RpcError::TimedOut(_)));
        assert_eq!(client.state(), CommunicationState::Faulted);
        assert!(!broker
            .queue_exists(&client.local_endpoint().queue_name())
            .expect("exists"));
    }

    #[tokio::test]
    async fn test_disconnect_faults_session() {
        let (broker, client, _server) = connect(TransportConfig::default()).await;

        broker.disconnect();
        let err = client
            .receive(Some(Duration::from_secs(2)))
            .await
            .expect_err("transport");
        assert!(err.is_transport());
        assert_eq!(client.state(), CommunicationState::Faulted);
    }

    #[test]
    fn test_accept_without_endpoint_is_rejected() {
        let open = Envelope::session_open(SessionId::new(), service().new_session_endpoint());
        let mut accept = Envelope::session_accept(&open, service().new_session_endpoint());
        assert!(accepted_endpoint(accept.clone()).is_ok());

        accept.reply_to = None;
        assert!(matches!(accepted_endpoint(accept), Err(RpcError::Codec(_))));
    }

    #[tokio::test]
    async fn test_accept_skips_open_from_departed_client() {
        let broker = MemoryBroker::new();
        let open = Envelope::session_open(SessionId::new(), service().new_session_endpoint());

        let accepted = DuplexChannel::accept(
            Arc::new(broker.clone()),
            &service(),
            &open,
            &TransportConfig::default(),
        )
        .expect("accept");
        assert!(accepted.is_none());
        assert!(broker.queue_names().is_empty());
    }
}
