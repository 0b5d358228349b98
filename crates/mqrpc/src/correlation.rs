// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Correlation and session identifiers, and the pending-call table.

use crate::envelope::Envelope;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

/// Unique token linking a request envelope to its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a new random correlation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Identifier of a duplex session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell sessions apart in logs.
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Outstanding two-way calls: correlation id -> waiting caller.
///
/// Replies for ids no longer in the table (timed out, aborted) are dropped.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: DashMap<CorrelationId, oneshot::Sender<Envelope>>,
    drained: Notify,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id`.
    ///
    /// The entry is removed when the returned [`PendingCall`] is dropped.
    pub(crate) fn register(&self, id: CorrelationId) -> PendingCall<'_> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, tx);
        PendingCall {
            table: self,
            id,
            rx,
        }
    }

    /// Route a reply to its waiter. Returns `false` if nobody waits for it.
    pub(crate) fn complete(&self, envelope: Envelope) -> bool {
        match self.entries.remove(&envelope.correlation_id) {
            Some((_, tx)) => {
                // Receiver may have given up between removal and send.
                let delivered = tx.send(envelope).is_ok();
                self.notify_if_drained();
                delivered
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every waiter; their `wait()` returns `None`.
    pub(crate) fn clear(&self) {
        self.entries.clear();
        self.drained.notify_waiters();
    }

    /// Resolve once no call is outstanding.
    pub(crate) async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.entries.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn remove(&self, id: &CorrelationId) {
        self.entries.remove(id);
        self.notify_if_drained();
    }

    fn notify_if_drained(&self) {
        if self.entries.is_empty() {
            self.drained.notify_waiters();
        }
    }
}

/// RAII registration of one outstanding call.
pub(crate) struct PendingCall<'a> {
    table: &'a PendingTable,
    id: CorrelationId,
    rx: oneshot::Receiver<Envelope>,
}

impl PendingCall<'_> {
    pub(crate) fn id(&self) -> CorrelationId {
        self.id
    }

    /// Wait for the reply. `None` if the table was cleared.
    pub(crate) async fn wait(&mut self) -> Option<Envelope> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    #[test]
    fn test_correlation_ids_are_unique() {
        let ids: HashSet<CorrelationId> = (0..1000).map(|_| CorrelationId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_session_id_display_is_short() {
        assert_eq!(SessionId::new().to_string().len(), 8);
    }

    #[tokio::test]
    async fn test_complete_routes_to_waiter() {
        let table = PendingTable::new();
        let mut call = table.register(CorrelationId::new());
        assert_eq!(table.len(), 1);

        let reply = Envelope::reply_for(call.id(), b"pong".to_vec());
        assert!(table.complete(reply));

        let got = call.wait().await.expect("reply");
        assert_eq!(got.payload, b"pong");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_reply_is_dropped() {
        let table = PendingTable::new();
        let reply = Envelope::reply_for(CorrelationId::new(), Vec::new());
        assert!(!table.complete(reply));
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let table = PendingTable::new();
        let id = CorrelationId::new();
        {
            let _call = table.register(id);
            assert_eq!(table.len(), 1);
        }
        assert!(table.is_empty());

        // Late reply after the caller gave up.
        assert!(!table.complete(Envelope::reply_for(id, Vec::new())));
    }

    #[tokio::test]
    async fn test_clear_wakes_waiters() {
        let table = PendingTable::new();
        let mut call = table.register(CorrelationId::new());
        table.clear();
        assert!(call.wait().await.is_none());
    }

    #[tokio::test]
    async fn test_wait_drained() {
        let table = std::sync::Arc::new(PendingTable::new());
        let id = CorrelationId::new();
        let (tx, rx) = oneshot::channel::<()>();

        let holder = {
            let table = table.clone();
            tokio::spawn(async move {
                let _call = table.register(id);
                tx.send(()).ok();
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
        };

        rx.await.expect("registered");
        tokio::time::timeout(Duration::from_secs(2), table.wait_drained())
            .await
            .expect("drained");
        holder.await.expect("join");
    }
}
