//! Engine configuration, loadable from JSON.
//!
//! Every field has a default, so a config only needs to name what differs:
//!
//! ```json
//! { "domain": "example.com", "stream_management": { "request_every": 5 } }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::logging::LogConfig;
use crate::reader::{FramingMode, DEFAULT_MAX_STANZA_SIZE};
use crate::sasl::AuthOptions;
use crate::sm::AckPolicy;

/// Default time allowed for each STARTTLS round trip.
pub const DEFAULT_STARTTLS_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamManagementConfig {
    pub enabled: bool,
    /// Ask the server for a resumable session.
    pub resume: bool,
    /// Piggy-back `<r/>` after every N-th stanza; `null` disables it.
    pub request_every: Option<u32>,
}

impl Default for StreamManagementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resume: false,
            request_every: AckPolicy::default().request_every,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// XMPP domain of the server (stream `to`, SASL realm fallback, TLS SNI).
    pub domain: String,
    /// Allow SASL PLAIN when DIGEST-MD5 is not offered.
    pub allow_plain: bool,
    pub framing: FramingMode,
    /// Upper bound on the raw size of one stanza, in bytes.
    pub max_stanza_size: usize,
    pub stream_management: StreamManagementConfig,
    pub starttls_timeout_secs: u64,
    /// Accept any server certificate. Only for local test servers.
    pub dangerous_insecure_tls: bool,
    pub logging: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            allow_plain: false,
            framing: FramingMode::StreamWrapped,
            max_stanza_size: DEFAULT_MAX_STANZA_SIZE,
            stream_management: StreamManagementConfig::default(),
            starttls_timeout_secs: DEFAULT_STARTTLS_TIMEOUT_SECS,
            dangerous_insecure_tls: false,
            logging: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Default::default()
        }
    }

    /// Parses and validates a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::Config(format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.domain.trim().is_empty() {
            return Err(EngineError::Config("domain must not be empty".into()));
        }
        if self.max_stanza_size == 0 {
            return Err(EngineError::Config("max_stanza_size must be positive".into()));
        }
        if self.starttls_timeout_secs == 0 {
            return Err(EngineError::Config("starttls_timeout_secs must be positive".into()));
        }
        if self.stream_management.request_every == Some(0) {
            return Err(EngineError::Config(
                "stream_management.request_every must be positive or null".into(),
            ));
        }
        Ok(())
    }

    pub fn starttls_timeout(&self) -> Duration {
        Duration::from_secs(self.starttls_timeout_secs)
    }

    pub fn ack_policy(&self) -> AckPolicy {
        AckPolicy {
            request_every: self.stream_management.request_every,
        }
    }

    /// SASL options for this server; `encrypted` reflects the current channel.
    pub fn auth_options(&self, encrypted: bool) -> AuthOptions {
        AuthOptions {
            server: self.domain.clone(),
            allow_plain: self.allow_plain,
            encrypted,
        }
    }
}
