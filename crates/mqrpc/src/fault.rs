// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fault translation.
//!
//! A processing failure on the server side becomes a fault envelope with
//! the request's correlation id, published to the request's reply-to
//! exactly like a normal reply. Translating a fault never changes the
//! lifecycle state of the channel or listener that carried the request;
//! only broker failures fault a channel.

use crate::correlation::CorrelationId;
use crate::envelope::Envelope;
use crate::error::RpcError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fault codes carried in fault envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    /// Contract not served by the receiving endpoint
    UnsupportedService,
    /// Operation not found in the contract
    UnsupportedMethod,
    /// Invalid arguments
    InvalidArgument,
    /// Service is unavailable
    ServiceUnavailable,
    /// Processing exceeded a deadline
    Timeout,
    /// Processing failed
    InternalError,
    /// Unknown/custom error
    #[default]
    Unknown,
}

impl FaultCode {
    /// Convert from the numeric code used by non-JSON peers.
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::UnsupportedService,
            2 => Self::UnsupportedMethod,
            3 => Self::InvalidArgument,
            4 => Self::ServiceUnavailable,
            5 => Self::Timeout,
            6 => Self::InternalError,
            _ => Self::Unknown,
        }
    }

    /// Numeric code.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::UnsupportedService => 1,
            Self::UnsupportedMethod => 2,
            Self::InvalidArgument => 3,
            Self::ServiceUnavailable => 4,
            Self::Timeout => 5,
            Self::InternalError => 6,
            Self::Unknown => -1,
        }
    }
}

/// Structured error carried by a fault envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub code: FaultCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl FaultRecord {
    /// Create a fault with a code and message.
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    /// Attach a detail string (e.g. a cause chain).
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Translate an arbitrary processing error.
    ///
    /// The message is the error's display text, the detail is its source
    /// chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        let fault = Self::new(FaultCode::InternalError, err.to_string());
        if causes.is_empty() {
            fault
        } else {
            fault.with_detail(causes.join(": "))
        }
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

/// Nested calls that fail keep their original fault; other errors keep
/// their kind in the code.
impl From<RpcError> for FaultRecord {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Faulted(fault) => fault,
            RpcError::TimedOut(_) => Self::new(FaultCode::Timeout, err.to_string()),
            RpcError::InvalidAddress(_) | RpcError::Codec(_) => {
                Self::new(FaultCode::InvalidArgument, err.to_string())
            }
            RpcError::TransportFaulted(_) | RpcError::AlreadyClosed | RpcError::Aborted => {
                Self::new(FaultCode::ServiceUnavailable, err.to_string())
            }
            _ => Self::new(FaultCode::InternalError, err.to_string()),
        }
    }
}

/// Build the reply envelope for a processing outcome.
pub fn translate_outcome(
    correlation_id: CorrelationId,
    outcome: Result<Vec<u8>, FaultRecord>,
) -> Envelope {
    match outcome {
        Ok(payload) => Envelope::reply_for(correlation_id, payload),
        Err(fault) => {
            tracing::debug!(
                "Translating processing failure for {} into fault: {}",
                correlation_id,
                fault
            );
            Envelope::fault_for(correlation_id, fault)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Fail(\"E1\")")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_from_error_keeps_message_and_cause() {
        let err = Outer(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        let fault = FaultRecord::from_error(&err);

        assert_eq!(fault.code, FaultCode::InternalError);
        assert!(fault.message.contains("E1"));
        assert_eq!(fault.detail.as_deref(), Some("disk gone"));
        assert!(fault.to_string().contains("E1"));
    }

    #[test]
    fn test_translate_outcome() {
        let id = CorrelationId::new();

        let ok = translate_outcome(id, Ok(b"42".to_vec()));
        assert_eq!(ok.correlation_id, id);
        assert!(!ok.is_fault());
        assert_eq!(ok.payload, b"42");

        let failed = translate_outcome(id, Err(FaultRecord::new(FaultCode::InvalidArgument, "x")));
        assert_eq!(failed.correlation_id, id);
        assert!(failed.is_fault());
        assert!(failed.payload.is_empty());
        assert!(failed.validate().is_ok());
    }

    #[test]
    fn test_rpc_error_conversion() {
        let nested = FaultRecord::new(FaultCode::InvalidArgument, "inner");
        assert_eq!(FaultRecord::from(RpcError::Faulted(nested.clone())), nested);

        let timeout = FaultRecord::from(RpcError::TimedOut(Duration::from_secs(1)));
        assert_eq!(timeout.code, FaultCode::Timeout);

        let transport = FaultRecord::from(RpcError::TransportFaulted("gone".into()));
        assert_eq!(transport.code, FaultCode::ServiceUnavailable);
    }

    #[test]
    fn test_code_conversion() {
        assert_eq!(FaultCode::from_i32(3), FaultCode::InvalidArgument);
        assert_eq!(FaultCode::from_i32(999), FaultCode::Unknown);
        assert_eq!(FaultCode::InternalError.as_i32(), 6);
    }
}
