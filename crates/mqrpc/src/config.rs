// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport configuration.
//!
//! Supports both programmatic and file-based configuration.
//!
//! # Configuration File
//!
//! ```toml
//! open_timeout_ms = 30000
//! close_timeout_ms = 30000
//! send_timeout_ms = 60000
//! accept_timeout_ms = 60000
//!
//! [queues]
//! durable_service_queues = false
//! # Reclaim private reply/session queues idle for this long (omit = never).
//! idle_expiry_secs = 3600
//!
//! [session]
//! concurrency = "multiple"
//! max_concurrent_calls = 16
//! ```

use crate::broker::QueueOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How a session processes inbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionConcurrency {
    /// One call at a time; the next call is received once the current one
    /// is finished.
    #[default]
    Single,
    /// Up to `max_concurrent_calls` calls processed in parallel.
    Multiple,
}

/// Queue declaration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Declare service queues durable.
    #[serde(default)]
    pub durable_service_queues: bool,

    /// Idle expiry for private reply and session queues (seconds).
    /// `None` keeps them until their owner deletes them, which is what
    /// long-running one-way processing needs.
    #[serde(default)]
    pub idle_expiry_secs: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            durable_service_queues: false,
            idle_expiry_secs: None,
        }
    }
}

/// Session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub concurrency: SessionConcurrency,

    /// Parallel calls per session in `multiple` mode.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
}

fn default_max_concurrent_calls() -> usize {
    16
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            concurrency: SessionConcurrency::Single,
            max_concurrent_calls: default_max_concurrent_calls(),
        }
    }
}

impl SessionConfig {
    /// Number of calls a session may process at once.
    pub fn permits(&self) -> usize {
        match self.concurrency {
            SessionConcurrency::Single => 1,
            SessionConcurrency::Multiple => self.max_concurrent_calls,
        }
    }
}

/// Transport configuration shared by channels, listeners and sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Default `open()` timeout (milliseconds).
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Default `close()` timeout (milliseconds).
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    /// Default two-way call timeout (milliseconds).
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Accept timeout used by the service host loop (milliseconds).
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,

    #[serde(default)]
    pub queues: QueueConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

fn default_close_timeout_ms() -> u64 {
    30_000
}

fn default_send_timeout_ms() -> u64 {
    60_000
}

fn default_accept_timeout_ms() -> u64 {
    60_000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: default_open_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            accept_timeout_ms: default_accept_timeout_ms(),
            queues: QueueConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("open_timeout_ms", self.open_timeout_ms),
            ("close_timeout_ms", self.close_timeout_ms),
            ("send_timeout_ms", self.send_timeout_ms),
            ("accept_timeout_ms", self.accept_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
        }

        if self.queues.idle_expiry_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "queues.idle_expiry_secs must be > 0 (omit it to disable expiry)".into(),
            ));
        }

        if self.session.concurrency == SessionConcurrency::Multiple
            && self.session.max_concurrent_calls == 0
        {
            return Err(ConfigError::Invalid(
                "session.max_concurrent_calls must be > 0".into(),
            ));
        }

        Ok(())
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    /// Idle expiry applied to private reply and session queues.
    pub fn idle_expiry(&self) -> Option<Duration> {
        self.queues.idle_expiry_secs.map(Duration::from_secs)
    }

    /// Declaration options for service queues.
    pub fn service_queue_options(&self) -> QueueOptions {
        QueueOptions::service(self.queues.durable_service_queues)
    }

    /// Declaration options for private reply and session queues.
    pub fn private_queue_options(&self) -> QueueOptions {
        QueueOptions::private(self.idle_expiry())
    }

    /// Builder: set the two-way call timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = duration_ms(timeout);
        self
    }

    /// Builder: set the close timeout.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = duration_ms(timeout);
        self
    }

    /// Builder: set the accept timeout used by the service host.
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout_ms = duration_ms(timeout);
        self
    }

    /// Builder: set the private queue idle expiry.
    pub fn with_idle_expiry(mut self, expiry: Option<Duration>) -> Self {
        self.queues.idle_expiry_secs = expiry.map(|d| d.as_secs().max(1));
        self
    }

    /// Builder: process session calls in parallel.
    pub fn with_concurrent_sessions(mut self, max_concurrent_calls: usize) -> Self {
        self.session.concurrency = SessionConcurrency::Multiple;
        self.session.max_concurrent_calls = max_concurrent_calls;
        self
    }

    /// Builder: declare service queues durable.
    pub fn with_durable_service_queues(mut self) -> Self {
        self.queues.durable_service_queues = true;
        self
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}
