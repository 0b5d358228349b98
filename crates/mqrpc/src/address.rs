// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Address scheme: logical service identity <-> broker queue name.
//!
//! # Queue Naming
//!
//! For host `broker`, port `5672`, contract `Calculator`:
//! - Service queue: `svc.broker.5672.Calculator`
//! - Service queue with instance `a`: `svc.broker.5672.Calculator.a`
//! - Private reply queue: `reply.<uuid>`
//! - Session endpoint queue: `session.<uuid>`
//!
//! Each field is escaped (`%` -> `%25`, `.` -> `%2E`) before joining, so the
//! derivation is injective over `(host, port, contract, instance_id)`.
//! Private reply and session queues start with a different prefix and can
//! never collide with a service queue.

use crate::error::{RpcError, RpcResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const SERVICE_PREFIX: &str = "svc";
const REPLY_PREFIX: &str = "reply";
const SESSION_PREFIX: &str = "session";
const URI_SCHEME: &str = "mqrpc://";

/// What a queue behind an [`Address`] is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    /// Well-known service queue, shared by competing listeners.
    Service,
    /// Single-use queue receiving exactly one correlated reply.
    PrivateReply,
    /// Long-lived queue owned by one side of a duplex session.
    SessionEndpoint,
}

/// Immutable identity of a queue on a broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    host: String,
    port: u16,
    contract: String,
    instance_id: Option<String>,
    kind: AddressKind,
}

impl Address {
    /// Resolve a service address.
    ///
    /// `host` must not contain `/`, `:` or whitespace; `contract` and
    /// `instance_id` must not be empty.
    pub fn resolve(
        host: &str,
        port: u16,
        contract: &str,
        instance_id: Option<&str>,
    ) -> RpcResult<Self> {
        if host.is_empty() {
            return Err(RpcError::InvalidAddress("host is empty".into()));
        }
        if host
            .chars()
            .any(|c| c == '/' || c == ':' || c.is_whitespace())
        {
            return Err(RpcError::InvalidAddress(format!(
                "host '{}' contains a reserved character",
                host
            )));
        }
        if contract.is_empty() {
            return Err(RpcError::InvalidAddress("contract name is empty".into()));
        }
        if instance_id.is_some_and(str::is_empty) {
            return Err(RpcError::InvalidAddress("instance id is empty".into()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            contract: contract.to_string(),
            instance_id: instance_id.map(str::to_string),
            kind: AddressKind::Service,
        })
    }

    /// Fresh single-use reply address on the same broker.
    ///
    /// The instance id is a random UUID, so two calls never return equal
    /// addresses.
    pub fn new_private_reply(&self) -> Self {
        self.derive(AddressKind::PrivateReply)
    }

    /// Fresh session endpoint address on the same broker.
    pub fn new_session_endpoint(&self) -> Self {
        self.derive(AddressKind::SessionEndpoint)
    }

    fn derive(&self, kind: AddressKind) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port,
            contract: self.contract.clone(),
            instance_id: Some(Uuid::new_v4().simple().to_string()),
            kind,
        }
    }

    /// Broker queue name for this address.
    pub fn queue_name(&self) -> String {
        match self.kind {
            AddressKind::Service => {
                let mut name = format!(
                    "{}.{}.{}.{}",
                    SERVICE_PREFIX,
                    escape_segment(&self.host),
                    self.port,
                    escape_segment(&self.contract)
                );
                if let Some(instance) = &self.instance_id {
                    name.push('.');
                    name.push_str(&escape_segment(instance));
                }
                name
            }
            AddressKind::PrivateReply => format!(
                "{}.{}",
                REPLY_PREFIX,
                escape_segment(self.instance_id.as_deref().unwrap_or_default())
            ),
            AddressKind::SessionEndpoint => format!(
                "{}.{}",
                SESSION_PREFIX,
                escape_segment(self.instance_id.as_deref().unwrap_or_default())
            ),
        }
    }

    /// Inverse of [`queue_name`](Self::queue_name) for service queues.
    ///
    /// Returns `None` for private reply/session queues (their host and
    /// contract are not encoded) and for names this scheme did not produce.
    pub fn from_queue_name(name: &str) -> Option<Self> {
        let segments: Vec<&str> = name.split('.').collect();
        if segments.first() != Some(&SERVICE_PREFIX) {
            return None;
        }
        if segments.len() != 4 && segments.len() != 5 {
            return None;
        }

        let host = unescape_segment(segments[1])?;
        let port = segments[2].parse::<u16>().ok()?;
        let contract = unescape_segment(segments[3])?;
        let instance = match segments.get(4) {
            Some(raw) => Some(unescape_segment(raw)?),
            None => None,
        };

        Self::resolve(&host, port, &contract, instance.as_deref()).ok()
    }

    /// `host:port` of the broker this address lives on.
    pub fn connection_target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Broker host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Broker port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Contract (service) name.
    pub fn contract(&self) -> &str {
        &self.contract
    }

    /// Instance id, if any.
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Address kind.
    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    /// Whether this is a private reply or session queue address.
    pub fn is_private(&self) -> bool {
        self.kind != AddressKind::Service
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.kind {
            AddressKind::Service => "",
            AddressKind::PrivateReply => "reply+",
            AddressKind::SessionEndpoint => "session+",
        };
        write!(
            f,
            "{}{}{}:{}/{}",
            scheme,
            URI_SCHEME,
            self.host,
            self.port,
            escape_uri(&self.contract)
        )?;
        if let Some(instance) = &self.instance_id {
            write!(f, "/{}", escape_uri(instance))?;
        }
        Ok(())
    }
}

/// Parses `mqrpc://host:port/contract[/instance]` into a service address.
impl FromStr for Address {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| RpcError::InvalidAddress(format!("'{}' is not an mqrpc URI", s)))?;

        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| RpcError::InvalidAddress(format!("'{}' has no contract", s)))?;
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| RpcError::InvalidAddress(format!("'{}' has no port", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| RpcError::InvalidAddress(format!("invalid port '{}'", port)))?;

        let segments: Vec<&str> = path.split('/').collect();
        let unescape = |raw: &str| {
            unescape_segment(raw)
                .ok_or_else(|| RpcError::InvalidAddress(format!("bad escape in '{}'", raw)))
        };
        match segments.as_slice() {
            &[contract] => Self::resolve(host, port, &unescape(contract)?, None),
            &[contract, instance] => {
                let instance = unescape(instance)?;
                Self::resolve(host, port, &unescape(contract)?, Some(&instance))
            }
            _ => Err(RpcError::InvalidAddress(format!(
                "'{}' has too many path segments",
                s
            ))),
        }
    }
}

fn escape_segment(raw: &str) -> String {
    escape_with(raw, &['%', '.'])
}

fn escape_uri(raw: &str) -> String {
    escape_with(raw, &['%', '/'])
}

fn escape_with(raw: &str, reserved: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if reserved.contains(&c) {
            out.push_str(&format!("%{:02X}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

fn unescape_segment(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hi = chars.next()?.to_digit(16)?;
            let lo = chars.next()?.to_digit(16)?;
            out.push(char::from_u32(hi * 16 + lo)?);
        } else {
            out.push(c);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn addr(host: &str, port: u16, contract: &str, instance: Option<&str>) -> Address {
        Address::resolve(host, port, contract, instance).expect("valid address")
    }

    #[test]
    fn test_queue_name_is_deterministic() {
        let a = addr("broker", 5672, "Calculator", None);
        let b = addr("broker", 5672, "Calculator", None);
        assert_eq!(a, b);
        assert_eq!(a.queue_name(), b.queue_name());
        assert_eq!(a.queue_name(), "svc.broker.5672.Calculator");
    }

    #[test]
    fn test_queue_name_with_instance() {
        let a = addr("broker", 5672, "Calculator", Some("blue"));
        assert_eq!(a.queue_name(), "svc.broker.5672.Calculator.blue");
    }

    #[test]
    fn test_queue_name_is_injective() {
        // Tuples that would collide with naive '.' joining.
        let tuples = [
            ("a.b", 1, "c", None),
            ("a", 1, "b.c", None),
            ("a", 1, "b", Some("c")),
            ("a", 1, "b.c", Some("d")),
            ("a", 1, "b", Some("c.d")),
            ("a", 2, "b", Some("c.d")),
            ("a%2Eb", 1, "c", None),
            ("a", 1, "b%", None),
        ];

        let names: HashSet<String> = tuples
            .iter()
            .map(|(h, p, c, i)| addr(h, *p, c, *i).queue_name())
            .collect();
        assert_eq!(names.len(), tuples.len());
    }

    #[test]
    fn test_from_queue_name_inverts_service_names() {
        let a = addr("broker.local", 5672, "Ns.Calculator", Some("i%1"));
        let parsed = Address::from_queue_name(&a.queue_name()).expect("parse");
        assert_eq!(parsed, a);

        assert!(Address::from_queue_name("reply.abc").is_none());
        assert!(Address::from_queue_name("svc.host.notaport.c").is_none());
        assert!(Address::from_queue_name("random").is_none());
    }

    #[test]
    fn test_private_reply_addresses_are_unique() {
        let target = addr("broker", 5672, "Calculator", None);
        let r1 = target.new_private_reply();
        let r2 = target.new_private_reply();

        assert_ne!(r1, r2);
        assert_ne!(r1.queue_name(), r2.queue_name());
        assert!(r1.is_private());
        assert!(r1.queue_name().starts_with("reply."));
        assert_eq!(r1.connection_target(), target.connection_target());
    }

    #[test]
    fn test_session_endpoint_never_collides_with_service() {
        let target = addr("broker", 5672, "Calculator", None);
        let endpoint = target.new_session_endpoint();
        assert_eq!(endpoint.kind(), AddressKind::SessionEndpoint);
        assert!(endpoint.queue_name().starts_with("session."));
        assert!(Address::from_queue_name(&endpoint.queue_name()).is_none());
    }

    #[test]
    fn test_resolve_rejects_bad_fields() {
        assert!(Address::resolve("", 1, "c", None).is_err());
        assert!(Address::resolve("h:1", 1, "c", None).is_err());
        assert!(Address::resolve("h", 1, "", None).is_err());
        assert!(Address::resolve("h", 1, "c", Some("")).is_err());
    }

    #[test]
    fn test_uri_form() {
        let a = addr("localhost", 5672, "Echo/Service", Some("x"));
        let uri = a.to_string();
        assert_eq!(uri, "mqrpc://localhost:5672/Echo%2FService/x");

        let parsed: Address = uri.parse().expect("parse uri");
        assert_eq!(parsed, a);
        assert_eq!(a.connection_target(), "localhost:5672");

        assert!("http://localhost:1/c".parse::<Address>().is_err());
        assert!("mqrpc://localhost/c".parse::<Address>().is_err());
        assert!("mqrpc://localhost:1/a/b/c".parse::<Address>().is_err());
    }
}
