// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lifecycle state machine shared by channels, listeners and sessions.
//!
//! ```text
//! Created -> Opening -> Opened -> Closing -> Closed
//!               |          |         |
//!               v          v         v
//!            Faulted    Faulted   Aborted     (abort() from any live state)
//! ```
//!
//! `Closed`, `Faulted` and `Aborted` are terminal. State changes are
//! published through a `tokio::sync::watch` channel so blocked operations
//! can select on them.

use crate::error::{RpcError, RpcResult};
use std::fmt;
use tokio::sync::watch;

/// Lifecycle state of a communication object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommunicationState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
    Aborted,
}

impl CommunicationState {
    /// Whether no further operation is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Faulted | Self::Aborted)
    }

    /// Whether a close or abort has started (or the object faulted).
    pub fn is_shutting_down(self) -> bool {
        self == Self::Closing || self.is_terminal()
    }

    /// Whether the object ended abnormally (faulted or aborted).
    pub fn is_interrupted(self) -> bool {
        matches!(self, Self::Faulted | Self::Aborted)
    }
}

impl fmt::Display for CommunicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Common surface of channels, listeners and sessions.
pub trait CommunicationObject {
    /// Current lifecycle state.
    fn state(&self) -> CommunicationState;

    /// Immediate, non-blocking teardown. Idempotent.
    fn abort(&self);
}

/// Thread-safe lifecycle state machine.
pub(crate) struct StateMachine {
    label: String,
    tx: watch::Sender<CommunicationState>,
}

impl StateMachine {
    pub(crate) fn new(label: impl Into<String>) -> Self {
        Self::starting_at(label, CommunicationState::Created)
    }

    /// For objects materialized already open (accepted server channels).
    pub(crate) fn opened(label: impl Into<String>) -> Self {
        Self::starting_at(label, CommunicationState::Opened)
    }

    fn starting_at(label: impl Into<String>, state: CommunicationState) -> Self {
        let (tx, _) = watch::channel(state);
        Self {
            label: label.into(),
            tx,
        }
    }

    pub(crate) fn current(&self) -> CommunicationState {
        *self.tx.borrow()
    }

    /// Atomically move `from -> to`. Returns the state seen before.
    fn transition(
        &self,
        allowed: impl Fn(CommunicationState) -> bool,
        to: CommunicationState,
    ) -> Result<CommunicationState, CommunicationState> {
        let mut seen = self.current();
        let changed = self.tx.send_if_modified(|state| {
            seen = *state;
            if allowed(*state) {
                *state = to;
                true
            } else {
                false
            }
        });

        if changed {
            tracing::debug!("[{}] {} -> {}", self.label, seen, to);
            Ok(seen)
        } else {
            Err(seen)
        }
    }

    /// Created -> Opening.
    pub(crate) fn begin_open(&self) -> RpcResult<()> {
        self.transition(
            |s| s == CommunicationState::Created,
            CommunicationState::Opening,
        )
        .map(|_| ())
        .map_err(|seen| unexpected(seen, "Created"))
    }

    /// Opening -> Opened. Fails with `Aborted` if an abort won the race.
    pub(crate) fn complete_open(&self) -> RpcResult<()> {
        self.transition(
            |s| s == CommunicationState::Opening,
            CommunicationState::Opened,
        )
        .map(|_| ())
        .map_err(|seen| match seen {
            CommunicationState::Aborted => RpcError::Aborted,
            other => unexpected(other, "Opening"),
        })
    }

    /// Any live state -> Faulted. Returns `false` if already terminal.
    pub(crate) fn fault(&self) -> bool {
        let faulted = self
            .transition(|s| !s.is_terminal(), CommunicationState::Faulted)
            .is_ok();
        if faulted {
            tracing::error!("[{}] faulted", self.label);
        }
        faulted
    }

    /// Begin an orderly close.
    ///
    /// Returns `Ok(true)` when `Opened -> Closing` happened and the caller
    /// must drain and call [`complete_close`](Self::complete_close).
    /// Returns `Ok(false)` when there is nothing to do: the object was never
    /// opened (it moves straight to `Closed`), is already being closed by
    /// another caller, or is already closed/aborted.
    pub(crate) fn begin_close(&self) -> RpcResult<bool> {
        match self.transition(
            |s| s == CommunicationState::Opened,
            CommunicationState::Closing,
        ) {
            Ok(_) => return Ok(true),
            Err(CommunicationState::Created) => {}
            Err(CommunicationState::Faulted) => return Err(RpcError::AlreadyClosed),
            Err(CommunicationState::Opening) => {
                return Err(unexpected(CommunicationState::Opening, "Opened"))
            }
            Err(_) => return Ok(false),
        }

        // Never opened: nothing to drain.
        match self.transition(
            |s| s == CommunicationState::Created,
            CommunicationState::Closed,
        ) {
            Ok(_) => Ok(false),
            Err(seen) => Err(unexpected(seen, "Opened")),
        }
    }

    /// Closing -> Closed. Returns `false` if an abort or fault won the race.
    pub(crate) fn complete_close(&self) -> bool {
        self.transition(
            |s| s == CommunicationState::Closing,
            CommunicationState::Closed,
        )
        .is_ok()
    }

    /// Any live state -> Aborted. Idempotent; terminal states are kept.
    pub(crate) fn abort(&self) -> bool {
        self.transition(|s| !s.is_terminal(), CommunicationState::Aborted)
            .is_ok()
    }

    /// Fail unless the object is `Opened`.
    pub(crate) fn ensure_opened(&self) -> RpcResult<()> {
        match self.current() {
            CommunicationState::Opened => Ok(()),
            state if state.is_shutting_down() => Err(RpcError::AlreadyClosed),
            state => Err(unexpected(state, "Opened")),
        }
    }

    /// Resolve once the state is terminal.
    pub(crate) async fn wait_terminal(&self) -> CommunicationState {
        self.wait_until(CommunicationState::is_terminal).await
    }

    /// Resolve once a close/abort started or the object faulted.
    pub(crate) async fn wait_shutting_down(&self) -> CommunicationState {
        self.wait_until(CommunicationState::is_shutting_down).await
    }

    pub(crate) async fn wait_until(
        &self,
        predicate: fn(CommunicationState) -> bool,
    ) -> CommunicationState {
        let mut rx = self.tx.subscribe();
        let state = match rx.wait_for(|s| predicate(*s)).await {
            Ok(state) => *state,
            // Unreachable while `self` holds the sender.
            Err(_) => self.current(),
        };
        state
    }

    /// Error to report to an operation interrupted by a state change.
    pub(crate) fn interruption_error(&self) -> RpcError {
        match self.current() {
            CommunicationState::Aborted => RpcError::Aborted,
            CommunicationState::Faulted => {
                RpcError::TransportFaulted(format!("{} faulted", self.label))
            }
            _ => RpcError::AlreadyClosed,
        }
    }
}

fn unexpected(actual: CommunicationState, expected: &'static str) -> RpcError {
    if actual.is_terminal() {
        RpcError::AlreadyClosed
    } else {
        RpcError::InvalidState { expected, actual }
    }
}
