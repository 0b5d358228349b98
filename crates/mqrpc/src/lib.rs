// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mqrpc: RPC transport over message-broker queues
//!
//! Carries request/reply calls and duplex sessions between services that
//! only share a message broker.
//!
//! # Features
//!
//! - **Request/Reply**: two-way calls answered on a private, single-use
//!   reply queue; one-way calls that return once published
//! - **Listeners**: competing consumers on a shared service queue,
//!   `accept_channel` returns `None` on orderly shutdown
//! - **Duplex Sessions**: long-lived sessions with an endpoint queue on each
//!   side, one-way and two-way calls in both directions
//! - **Fault Translation**: processing failures travel back as fault
//!   envelopes and never fault the channel
//!
//! # Queue Naming
//!
//! For host `broker`, port `5672` and contract `Calculator`:
//! - Service queue: `svc.broker.5672.Calculator`
//! - Private reply queue: `reply.<uuid>`
//! - Session endpoint: `session.<uuid>`
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqrpc::{
//!     Address, FaultRecord, IncomingCall, MemoryBroker, RequestChannel, ServiceHost,
//!     TransportConfig,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! async fn echo(call: IncomingCall) -> Result<Vec<u8>, FaultRecord> {
//!     Ok(call.payload)
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(MemoryBroker::new());
//! let address = Address::resolve("broker", 5672, "Echo", None)?;
//! let config = TransportConfig::default();
//!
//! let host = ServiceHost::start(broker.clone(), address.clone(), config.clone(), echo).await?;
//!
//! let channel = RequestChannel::new(broker, address, config);
//! channel.open(Duration::from_secs(5)).await?;
//! assert_eq!(channel.send(b"hi".to_vec(), Duration::from_secs(5)).await?, b"hi");
//!
//! channel.close(Duration::from_secs(5)).await?;
//! host.shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod broker;
pub mod client;
pub mod config;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod fault;
pub mod host;
pub mod listener;
pub mod session;
pub mod state;

pub use address::{Address, AddressKind};
pub use broker::{Broker, BrokerError, BrokerRef, Consumer, MemoryBroker, QueueOptions};
pub use client::RequestChannel;
pub use config::{ConfigError, SessionConcurrency, TransportConfig};
pub use correlation::{CorrelationId, SessionId};
pub use envelope::{Envelope, EnvelopeKind};
pub use error::{RpcError, RpcResult};
pub use fault::{translate_outcome, FaultCode, FaultRecord};
pub use host::{HostStatsSnapshot, IncomingCall, RequestHandler, ServiceHost};
pub use listener::{AcceptedChannel, Listener, RequestContext};
pub use session::{DuplexChannel, SessionRequest};
pub use state::{CommunicationObject, CommunicationState};
