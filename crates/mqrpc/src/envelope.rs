// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message envelope exchanged over broker queues.
//!
//! # Wire Format
//!
//! JSON object, payload base64-encoded:
//!
//! ```text
//! {"v":1,"kind":"request","correlation_id":"...","one_way":false,
//!  "reply_to":{...},"payload":"cGluZw==","session_id":"..."}
//! ```
//!
//! # Invariants
//!
//! - A two-way request carries a private reply-to address: a fresh
//!   single-use queue for plain calls, the session endpoint for duplex calls.
//! - A one-way request carries no reply-to.
//! - A fault reply carries an empty payload.

use crate::address::{Address, AddressKind};
use crate::correlation::{CorrelationId, SessionId};
use crate::error::{RpcError, RpcResult};
use crate::fault::FaultRecord;
use serde::{Deserialize, Serialize};

/// Current envelope wire version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Role of an envelope in the exchange protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Call from a client (or from either side inside a session).
    Request,
    /// Reply (or fault) to a two-way request.
    Reply,
    /// Session initiation, carries the initiator's session endpoint.
    SessionOpen,
    /// Session acceptance, carries the acceptor's session endpoint.
    SessionAccept,
    /// Session termination signal.
    SessionClose,
}

/// Unit of data exchanged over a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "v")]
    pub version: u8,
    pub kind: EnvelopeKind,
    pub correlation_id: CorrelationId,
    #[serde(default)]
    pub one_way: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Address>,
    #[serde(default, with = "base64_payload")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl Envelope {
    fn base(kind: EnvelopeKind, correlation_id: CorrelationId) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            kind,
            correlation_id,
            one_way: false,
            reply_to: None,
            payload: Vec::new(),
            fault: None,
            session_id: None,
        }
    }

    /// Two-way request answered on `reply_to`.
    pub fn request(payload: Vec<u8>, reply_to: Address) -> Self {
        Self {
            reply_to: Some(reply_to),
            payload,
            ..Self::base(EnvelopeKind::Request, CorrelationId::new())
        }
    }

    /// Fire-and-forget request.
    pub fn one_way(payload: Vec<u8>) -> Self {
        Self {
            one_way: true,
            payload,
            ..Self::base(EnvelopeKind::Request, CorrelationId::new())
        }
    }

    /// Successful reply to the request identified by `correlation_id`.
    pub fn reply_for(correlation_id: CorrelationId, payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Self::base(EnvelopeKind::Reply, correlation_id)
        }
    }

    /// Fault reply to the request identified by `correlation_id`.
    pub fn fault_for(correlation_id: CorrelationId, fault: FaultRecord) -> Self {
        Self {
            fault: Some(fault),
            ..Self::base(EnvelopeKind::Reply, correlation_id)
        }
    }

    /// Session initiation from the client.
    pub fn session_open(session_id: SessionId, endpoint: Address) -> Self {
        Self {
            reply_to: Some(endpoint),
            session_id: Some(session_id),
            ..Self::base(EnvelopeKind::SessionOpen, CorrelationId::new())
        }
    }

    /// Session acceptance from the server, correlated with the open request.
    pub fn session_accept(open: &Envelope, endpoint: Address) -> Self {
        Self {
            reply_to: Some(endpoint),
            session_id: open.session_id,
            ..Self::base(EnvelopeKind::SessionAccept, open.correlation_id)
        }
    }

    /// Session termination signal.
    pub fn session_close(session_id: SessionId) -> Self {
        Self {
            one_way: true,
            session_id: Some(session_id),
            ..Self::base(EnvelopeKind::SessionClose, CorrelationId::new())
        }
    }

    /// Tag the envelope with a session id.
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Whether this envelope is a fault reply.
    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }

    /// Turn a reply into the caller-facing result.
    pub fn into_reply(self) -> Result<Vec<u8>, FaultRecord> {
        match self.fault {
            Some(fault) => Err(fault),
            None => Ok(self.payload),
        }
    }

    /// Check the addressing invariants.
    pub fn validate(&self) -> RpcResult<()> {
        if self.version != ENVELOPE_VERSION {
            return Err(RpcError::Codec(format!(
                "unsupported envelope version {}",
                self.version
            )));
        }

        match self.kind {
            EnvelopeKind::Request => {
                if self.fault.is_some() {
                    return Err(RpcError::Codec("request carries a fault".into()));
                }
                match (&self.reply_to, self.one_way) {
                    (Some(_), true) => {
                        return Err(RpcError::Codec("one-way request carries reply-to".into()))
                    }
                    (None, false) => {
                        return Err(RpcError::Codec("two-way request without reply-to".into()))
                    }
                    (Some(reply_to), false) => {
                        let expected = if self.session_id.is_some() {
                            AddressKind::SessionEndpoint
                        } else {
                            AddressKind::PrivateReply
                        };
                        if reply_to.kind() != expected {
                            return Err(RpcError::Codec(format!(
                                "reply-to must be a {:?} address, got {:?}",
                                expected,
                                reply_to.kind()
                            )));
                        }
                    }
                    (None, true) => {}
                }
            }
            EnvelopeKind::Reply => {
                if self.one_way {
                    return Err(RpcError::Codec("reply marked one-way".into()));
                }
                if self.fault.is_some() && !self.payload.is_empty() {
                    return Err(RpcError::Codec("fault reply carries a payload".into()));
                }
            }
            EnvelopeKind::SessionOpen | EnvelopeKind::SessionAccept => {
                if self.session_id.is_none() {
                    return Err(RpcError::Codec("session handshake without session id".into()));
                }
                match &self.reply_to {
                    Some(endpoint) if endpoint.kind() == AddressKind::SessionEndpoint => {}
                    _ => {
                        return Err(RpcError::Codec(
                            "session handshake without session endpoint".into(),
                        ))
                    }
                }
            }
            EnvelopeKind::SessionClose => {
                if self.session_id.is_none() {
                    return Err(RpcError::Codec("session close without session id".into()));
                }
            }
        }

        Ok(())
    }

    /// Validate and serialize for publishing.
    pub fn encode(&self) -> RpcResult<Vec<u8>> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize and validate a consumed message.
    pub fn decode(bytes: &[u8]) -> RpcResult<Self> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultCode;

    fn service() -> Address {
        Address::resolve("broker", 5672, "Echo", None).expect("address")
    }

    #[test]
    fn test_two_way_request_wire_format() {
        let reply_to = service().new_private_reply();
        let env = Envelope::request(b"ping".to_vec(), reply_to.clone());

        let bytes = env.encode().expect("encode");
        let text = std::str::from_utf8(&bytes).expect("utf8");
        assert!(text.contains(r#""v":1"#));
        assert!(text.contains(r#""kind":"request""#));
        assert!(text.contains(r#""payload":"cGluZw==""#));
        assert!(!text.contains("fault"));

        let decoded = Envelope::decode(&bytes).expect("decode");
        assert_eq!(decoded.reply_to, Some(reply_to));
        assert_eq!(decoded.payload, b"ping");
        assert!(!decoded.one_way);
    }

    #[test]
    fn test_fault_reply_keeps_correlation() {
        let request = Envelope::request(Vec::new(), service().new_private_reply());
        let fault = FaultRecord::new(FaultCode::InternalError, "E1");
        let reply = Envelope::fault_for(request.correlation_id, fault.clone());

        let decoded = Envelope::decode(&reply.encode().expect("encode")).expect("decode");
        assert_eq!(decoded.correlation_id, request.correlation_id);
        assert!(decoded.is_fault());
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.into_reply(), Err(fault));
    }

    #[test]
    fn test_two_way_request_needs_private_reply_to() {
        let mut env = Envelope::request(Vec::new(), service());
        assert!(env.validate().is_err());

        env.reply_to = None;
        assert!(env.validate().is_err());

        let env = Envelope::request(Vec::new(), service().new_session_endpoint());
        assert!(env.validate().is_err(), "session endpoint needs a session id");
        assert!(env.with_session(SessionId::new()).validate().is_ok());
    }

    #[test]
    fn test_one_way_request_has_no_reply_to() {
        let mut env = Envelope::one_way(b"ack".to_vec());
        assert!(env.validate().is_ok());

        env.reply_to = Some(service().new_private_reply());
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_fault_reply_rejects_payload() {
        let mut env = Envelope::fault_for(
            CorrelationId::new(),
            FaultRecord::new(FaultCode::Unknown, "boom"),
        );
        env.payload = b"oops".to_vec();
        assert!(env.encode().is_err());
    }

    #[test]
    fn test_session_handshake() {
        let session = SessionId::new();
        let open = Envelope::session_open(session, service().new_session_endpoint());
        assert!(open.validate().is_ok());

        let accept = Envelope::session_accept(&open, service().new_session_endpoint());
        assert_eq!(accept.correlation_id, open.correlation_id);
        assert_eq!(accept.session_id, Some(session));
        assert!(accept.validate().is_ok());

        let bad = Envelope::session_open(session, service().new_private_reply());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_decode_rejects_garbage_and_versions() {
        assert!(matches!(
            Envelope::decode(b"not json"),
            Err(RpcError::Codec(_))
        ));

        let mut env = Envelope::one_way(Vec::new());
        env.version = 9;
        let bytes = serde_json::to_vec(&env).expect("serialize");
        assert!(Envelope::decode(&bytes).is_err());
    }
}
