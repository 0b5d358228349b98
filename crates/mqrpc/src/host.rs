// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service host.
//!
//! Drives a [`Listener`] and hands every accepted call to a
//! [`RequestHandler`]. Plain requests are processed on their own task;
//! each accepted session gets a receive loop honoring its concurrency
//! policy. Two-way failures go back to the caller as fault replies,
//! one-way failures are only logged and counted. Session calls carry a
//! handle to their session so handlers can call the client back.

use crate::address::Address;
use crate::broker::BrokerRef;
use crate::config::TransportConfig;
use crate::correlation::{CorrelationId, SessionId};
use crate::error::{RpcError, RpcResult};
use crate::fault::FaultRecord;
use crate::listener::{AcceptedChannel, Listener, RequestContext};
use crate::session::{DuplexChannel, SessionRequest};
use crate::state::CommunicationState;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Future returned by [`RequestHandler::handle`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, FaultRecord>> + Send>>;

/// A call handed to the processing layer.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub correlation_id: CorrelationId,
    pub one_way: bool,
    /// Set for calls received on a duplex session.
    pub session_id: Option<SessionId>,
    /// The session the call arrived on, for callbacks to the caller.
    pub session: Option<Arc<DuplexChannel>>,
    pub payload: Vec<u8>,
}

/// Processing collaborator invoked once per accepted call.
pub trait RequestHandler: Send + Sync + 'static {
    /// Process a call.
    ///
    /// # Returns
    /// Ok(payload) on success, or a fault record sent back to two-way
    /// callers. For one-way calls the result is only observed by the host.
    fn handle(&self, call: IncomingCall) -> HandlerFuture;
}

/// A closure-based request handler.
impl<F, Fut> RequestHandler for F
where
    F: Fn(IncomingCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, FaultRecord>> + Send + 'static,
{
    fn handle(&self, call: IncomingCall) -> HandlerFuture {
        Box::pin(self(call))
    }
}

/// Host statistics.
#[derive(Debug)]
pub struct HostStats {
    /// Calls handed to the handler.
    pub requests_processed: AtomicU64,

    /// Two-way calls answered with a fault.
    pub faults_returned: AtomicU64,

    /// One-way calls whose processing failed.
    pub one_way_failures: AtomicU64,

    /// Sessions accepted.
    pub sessions_accepted: AtomicU64,

    /// Replies that could not be published.
    pub reply_errors: AtomicU64,

    created: Instant,
}

impl HostStats {
    pub fn new() -> Self {
        Self {
            requests_processed: AtomicU64::new(0),
            faults_returned: AtomicU64::new(0),
            one_way_failures: AtomicU64::new(0),
            sessions_accepted: AtomicU64::new(0),
            reply_errors: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    fn record_outcome(&self, one_way: bool, outcome: &Result<Vec<u8>, FaultRecord>) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
        match (one_way, outcome.is_err()) {
            (true, true) => {
                self.one_way_failures.fetch_add(1, Ordering::Relaxed);
            }
            (false, true) => {
                self.faults_returned.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Get a snapshot of current stats.
    pub fn snapshot(&self) -> HostStatsSnapshot {
        HostStatsSnapshot {
            requests_processed: self.requests_processed.load(Ordering::Relaxed),
            faults_returned: self.faults_returned.load(Ordering::Relaxed),
            one_way_failures: self.one_way_failures.load(Ordering::Relaxed),
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            reply_errors: self.reply_errors.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

impl Default for HostStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of host statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStatsSnapshot {
    pub requests_processed: u64,
    pub faults_returned: u64,
    pub one_way_failures: u64,
    pub sessions_accepted: u64,
    pub reply_errors: u64,
    pub uptime_secs: u64,
}

impl HostStatsSnapshot {
    /// Calculate requests per second.
    pub fn requests_per_second(&self) -> f64 {
        if self.uptime_secs > 0 {
            self.requests_processed as f64 / self.uptime_secs as f64
        } else {
            0.0
        }
    }
}

type SessionMap = Arc<DashMap<SessionId, Arc<DuplexChannel>>>;

/// Runs a handler behind a listener until shut down.
///
/// # Example
///
/// ```rust,no_run
/// use mqrpc::{Address, FaultCode, FaultRecord, IncomingCall, MemoryBroker, ServiceHost, TransportConfig};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// async fn upper(call: IncomingCall) -> Result<Vec<u8>, FaultRecord> {
///     let text = String::from_utf8(call.payload)
///         .map_err(|e| FaultRecord::new(FaultCode::InvalidArgument, e.to_string()))?;
///     Ok(text.to_uppercase().into_bytes())
/// }
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = Arc::new(MemoryBroker::new());
/// let address = Address::resolve("localhost", 5672, "Upper", None)?;
/// let host = ServiceHost::start(broker, address, TransportConfig::default(), upper).await?;
///
/// host.shutdown(Duration::from_secs(5)).await?;
/// # Ok(())
/// # }
/// ```
pub struct ServiceHost {
    listener: Arc<Listener>,
    stats: Arc<HostStats>,
    sessions: SessionMap,
    accept_loop: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ServiceHost {
    /// Open a listener on `address` and start accepting.
    pub async fn start(
        broker: BrokerRef,
        address: Address,
        config: TransportConfig,
        handler: impl RequestHandler,
    ) -> RpcResult<Self> {
        let accept_timeout = config.accept_timeout();
        let listener = Arc::new(Listener::new(broker, address, config.clone()));
        listener.open(config.open_timeout()).await?;

        let handler: Arc<dyn RequestHandler> = Arc::new(handler);
        let stats = Arc::new(HostStats::new());
        let sessions: SessionMap = Arc::new(DashMap::new());

        let handle = tokio::spawn(accept_loop(
            listener.clone(),
            handler,
            stats.clone(),
            sessions.clone(),
            accept_timeout,
        ));
        tracing::info!("Service host started on '{}'", listener.address());

        Ok(Self {
            listener,
            stats,
            sessions,
            accept_loop: parking_lot::Mutex::new(Some(handle)),
        })
    }

    pub fn address(&self) -> &Address {
        self.listener.address()
    }

    /// Listener state and counters.
    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn stats(&self) -> HostStatsSnapshot {
        self.stats.snapshot()
    }

    /// Sessions currently served.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// A served session, to push calls to its client.
    pub fn session(&self, session_id: &SessionId) -> Option<Arc<DuplexChannel>> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    /// Close the listener, wait for the accept loop, then close live
    /// sessions. Everything shares one deadline.
    pub async fn shutdown(&self, timeout: Duration) -> RpcResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut result = self.listener.close(timeout).await;

        let accept_loop = self.accept_loop.lock().take();
        if let Some(handle) = accept_loop {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                result = result.and(Err(RpcError::TimedOut(timeout)));
            }
        }

        let sessions: Vec<Arc<DuplexChannel>> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        for session in sessions {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if let Err(e) = session.close(remaining).await {
                tracing::warn!("Session {} did not close cleanly: {}", session.session_id(), e);
                result = result.and(Err(e));
            }
        }

        tracing::info!("Service host on '{}' stopped", self.listener.address());
        result
    }
}

impl Drop for ServiceHost {
    fn drop(&mut self) {
        self.listener.abort();
        if let Some(handle) = self.accept_loop.lock().take() {
            handle.abort();
        }
    }
}

async fn accept_loop(
    listener: Arc<Listener>,
    handler: Arc<dyn RequestHandler>,
    stats: Arc<HostStats>,
    sessions: SessionMap,
    accept_timeout: Duration,
) {
    loop {
        match listener.accept_channel(accept_timeout).await {
            Ok(Some(AcceptedChannel::Request(ctx))) => {
                tokio::spawn(handle_request(handler.clone(), stats.clone(), ctx));
            }
            Ok(Some(AcceptedChannel::Session(session))) => {
                stats.sessions_accepted.fetch_add(1, Ordering::Relaxed);
                let session = Arc::new(session);
                sessions.insert(session.session_id(), session.clone());
                tokio::spawn(run_session(
                    handler.clone(),
                    stats.clone(),
                    sessions.clone(),
                    session,
                ));
            }
            Ok(None) => break,
            // Idle accept window.
            Err(e) if e.is_retryable() => continue,
            Err(e) => {
                tracing::error!("Accept loop on '{}' stopped: {}", listener.address(), e);
                break;
            }
        }
    }
    tracing::debug!("Accept loop on '{}' finished", listener.address());
}

async fn handle_request(
    handler: Arc<dyn RequestHandler>,
    stats: Arc<HostStats>,
    mut ctx: RequestContext,
) {
    let one_way = ctx.is_one_way();
    let call = IncomingCall {
        correlation_id: ctx.correlation_id(),
        one_way,
        session_id: ctx.session_id(),
        session: None,
        payload: ctx.receive(),
    };

    let outcome = handler.handle(call).await;
    stats.record_outcome(one_way, &outcome);

    if let Err(e) = ctx.respond(outcome) {
        stats.reply_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Failed to reply to request {}: {}", ctx.correlation_id(), e);
    }
}

async fn run_session(
    handler: Arc<dyn RequestHandler>,
    stats: Arc<HostStats>,
    sessions: SessionMap,
    session: Arc<DuplexChannel>,
) {
    let session_id = session.session_id();
    loop {
        match session.receive(None).await {
            Ok(Some(request)) => {
                tokio::spawn(handle_session_request(
                    handler.clone(),
                    stats.clone(),
                    session.clone(),
                    request,
                ));
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Session {} receive loop stopped: {}", session_id, e);
                break;
            }
        }
    }

    sessions.remove(&session_id);
    if session.state() == CommunicationState::Closed {
        tracing::debug!("Session {} finished", session_id);
    }
}

async fn handle_session_request(
    handler: Arc<dyn RequestHandler>,
    stats: Arc<HostStats>,
    session: Arc<DuplexChannel>,
    mut request: SessionRequest,
) {
    let one_way = request.is_one_way();
    let call = IncomingCall {
        correlation_id: request.correlation_id(),
        one_way,
        session_id: Some(request.session_id()),
        session: Some(session),
        payload: request.receive(),
    };

    let outcome = handler.handle(call).await;
    stats.record_outcome(one_way, &outcome);

    if let Err(e) = request.respond(outcome) {
        stats.reply_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            "Session {}: failed to reply to {}: {}",
            request.session_id(),
            request.correlation_id(),
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultCode;

    fn call(payload: &[u8], one_way: bool) -> IncomingCall {
        IncomingCall {
            correlation_id: CorrelationId::new(),
            one_way,
            session_id: None,
            session: None,
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = |call: IncomingCall| async move {
            if call.payload.is_empty() {
                Err(FaultRecord::new(FaultCode::InvalidArgument, "empty"))
            } else {
                Ok(call.payload)
            }
        };

        assert_eq!(handler.handle(call(b"x", false)).await, Ok(b"x".to_vec()));
        assert!(handler.handle(call(b"", false)).await.is_err());
    }

    #[test]
    fn test_stats_outcomes() {
        let stats = HostStats::new();
        let fault = FaultRecord::new(FaultCode::InternalError, "boom");

        stats.record_outcome(false, &Ok(Vec::new()));
        stats.record_outcome(false, &Err(fault.clone()));
        stats.record_outcome(true, &Err(fault));
        stats.record_outcome(true, &Ok(Vec::new()));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_processed, 4);
        assert_eq!(snapshot.faults_returned, 1);
        assert_eq!(snapshot.one_way_failures, 1);
        assert_eq!(snapshot.requests_per_second(), 0.0);
    }
}
