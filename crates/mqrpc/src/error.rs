// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for mqrpc operations.
//!
//! The kinds follow the propagation rules of the transport:
//!
//! - [`RpcError::TimedOut`] is recoverable, the caller may retry.
//! - [`RpcError::Faulted`] carries a fault envelope from the remote side. The
//!   channel that produced it is still usable.
//! - [`RpcError::TransportFaulted`] means the broker connection failed. The
//!   channel or listener is now `Faulted` and must be reopened.
//! - [`RpcError::AlreadyClosed`] is returned for any operation on a terminal
//!   channel.
//! - [`RpcError::Aborted`] is a clean cancellation caused by a concurrent
//!   `abort()`. Accept/receive paths report it as `Ok(None)` instead.

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::fault::FaultRecord;
use crate::state::CommunicationState;
use std::time::Duration;
use thiserror::Error;

/// Result type for mqrpc operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors that can occur on channels, listeners and sessions.
#[derive(Debug, Error)]
pub enum RpcError {
    /// A blocking operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    /// The remote side failed to process the call and answered with a fault.
    #[error("remote fault: {0}")]
    Faulted(FaultRecord),

    /// Broker connectivity or protocol failure.
    #[error("transport faulted: {0}")]
    TransportFaulted(String),

    /// Operation attempted on a closed, faulted or aborted channel.
    #[error("channel is already closed")]
    AlreadyClosed,

    /// Operation unblocked by a concurrent abort.
    #[error("operation aborted")]
    Aborted,

    /// Operation not valid in the current lifecycle state.
    #[error("invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: CommunicationState,
    },

    /// Address fields are malformed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Envelope could not be encoded or decoded.
    #[error("envelope codec error: {0}")]
    Codec(String),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl RpcError {
    /// Whether retrying the same call on the same channel makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    /// Whether this error only reports a cancellation by `abort()`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Whether the error comes from the broker transport.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::TransportFaulted(_))
    }

    /// The fault record, if the remote side answered with a fault.
    pub fn fault(&self) -> Option<&FaultRecord> {
        match self {
            Self::Faulted(fault) => Some(fault),
            _ => None,
        }
    }
}

impl From<BrokerError> for RpcError {
    fn from(e: BrokerError) -> Self {
        Self::TransportFaulted(e.to_string())
    }
}

impl From<FaultRecord> for RpcError {
    fn from(fault: FaultRecord) -> Self {
        Self::Faulted(fault)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultCode;

    #[test]
    fn test_error_display() {
        let err = RpcError::TimedOut(Duration::from_secs(5));
        assert!(err.to_string().contains("timed out"));

        let err = RpcError::Faulted(FaultRecord::new(FaultCode::InternalError, "E1"));
        assert!(err.to_string().contains("E1"));

        let err = RpcError::InvalidState {
            expected: "Opened",
            actual: CommunicationState::Created,
        };
        assert!(err.to_string().contains("Created"));
    }

    #[test]
    fn test_error_predicates() {
        assert!(RpcError::TimedOut(Duration::ZERO).is_retryable());
        assert!(!RpcError::AlreadyClosed.is_retryable());
        assert!(RpcError::Aborted.is_cancellation());
        assert!(RpcError::from(BrokerError::ConnectionLost).is_transport());

        let err = RpcError::from(FaultRecord::new(FaultCode::InvalidArgument, "bad"));
        assert_eq!(err.fault().map(|f| f.code), Some(FaultCode::InvalidArgument));
        assert!(RpcError::Aborted.fault().is_none());
    }
}
