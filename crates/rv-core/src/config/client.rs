//! Client configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;
use crate::traits::CompletionPolicy;

/// Default evaluation server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Namespace used when the program does not declare one
pub const DEFAULT_NAMESPACE: &str = "user";

/// Configuration for the evaluation client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host
    pub host: String,

    /// Server port (required, usually supplied by flag or environment)
    pub port: Option<u16>,

    /// Hard ceiling on waiting for a response
    #[serde(with = "duration_secs")]
    pub response_timeout: Duration,

    /// How long to wait for an interrupt acknowledgement
    #[serde(with = "duration_secs")]
    pub interrupt_timeout: Duration,

    /// Grace period for output pipes to drain after evaluation
    #[serde(with = "duration_secs")]
    pub drain_timeout: Duration,

    /// How the body evaluation decides it has seen every message
    pub completion: CompletionConfig,

    /// Baseline namespace for programs without an `ns` form
    pub namespace: String,

    /// Messages expected back from evaluating an `ns` form
    pub ns_expected_messages: usize,

    /// When to route standard streams through named pipes
    pub multiplex: MultiplexMode,

    /// Where per-run pipe directories are created (defaults to the temp dir)
    pub pipe_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: None,
            response_timeout: Duration::from_secs(30),
            interrupt_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(5),
            completion: CompletionConfig::default(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            ns_expected_messages: 2,
            multiplex: MultiplexMode::Auto,
            pipe_dir: None,
        }
    }
}

impl ClientConfig {
    /// Resolve the server address; a missing port is fatal
    pub fn address(&self) -> Result<ServerAddress, ConfigError> {
        let port = self
            .port
            .ok_or_else(|| ConfigError::MissingField("port".to_string()))?;
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        Ok(ServerAddress::new(self.host.clone(), port))
    }

    /// Directory under which pipe directories are created
    pub fn pipe_root(&self) -> PathBuf {
        self.pipe_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Completion strategy for evaluation responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionMode {
    /// Wait for a `done` status, bounded by the response timeout
    UntilDone,
    /// Adaptive quiet-period window, cut short by a `done` status
    ///
    /// Only for servers that never send `done`: a pause longer than the
    /// window after output ends the batch, and anything later is lost.
    Adaptive,
}

/// Tuning for the completion detector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub mode: CompletionMode,

    /// Smallest quiet window, used while output is streaming
    #[serde(rename = "floor_ms", with = "duration_millis")]
    pub floor: Duration,

    /// Largest quiet window
    #[serde(rename = "ceiling_ms", with = "duration_millis")]
    pub ceiling: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            mode: CompletionMode::UntilDone,
            floor: Duration::from_millis(5),
            ceiling: Duration::from_secs(2),
        }
    }
}

impl CompletionConfig {
    pub fn policy(&self) -> CompletionPolicy {
        match self.mode {
            CompletionMode::Adaptive => CompletionPolicy::Adaptive {
                floor: self.floor,
                ceiling: self.ceiling.max(self.floor),
            },
            CompletionMode::UntilDone => CompletionPolicy::UntilDone,
        }
    }
}

/// When the I/O multiplexer is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiplexMode {
    /// Only when a standard stream is redirected
    Auto,
    Always,
    Never,
}

impl std::str::FromStr for MultiplexMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(ConfigError::Invalid(format!(
                "unknown multiplex mode '{}'",
                other
            ))),
        }
    }
}

/// Host and port of the evaluation server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
