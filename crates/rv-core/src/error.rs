//! Core error types for reval

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use rv_protocol::ProtocolError;
use thiserror::Error;

use crate::forms::UnbalancedSource;

/// Terminal outcome of a run that did not succeed
///
/// Every variant is distinct so the CLI can map each to its own exit status.
#[derive(Error, Debug)]
pub enum RunError {
    /// Could not open a connection to the server
    #[error("Cannot reach evaluation server at {address}: {source}")]
    ServerUnreachable {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// No message arrived within the hard response ceiling
    #[error("No response from server within {0:?}")]
    ResponseTimeout(Duration),

    /// Wire decode failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The program could not be segmented; nothing was sent
    #[error("Unbalanced source: {0}")]
    UnbalancedSource(#[from] UnbalancedSource),

    /// The evaluated code threw
    #[error("{0}")]
    RemoteEvaluation(RemoteException),

    /// `clone` did not return a session token
    #[error("Server did not return a session token")]
    SessionCloneFailed,

    /// The run was cancelled by the user
    #[error("Evaluation cancelled")]
    Cancelled,

    /// Local I/O failure (pipe setup, console)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for RunError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ServerUnreachable { address, source } => {
                RunError::ServerUnreachable { address, source }
            }
            TransportError::ResponseTimeout(after) => RunError::ResponseTimeout(after),
            TransportError::Protocol(e) => RunError::Protocol(e),
        }
    }
}

/// Failures of a single request/response exchange
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection refused or host unreachable
    #[error("Cannot reach evaluation server at {address}: {source}")]
    ServerUnreachable {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Nothing received before the hard ceiling
    #[error("No response from server within {0:?}")]
    ResponseTimeout(Duration),

    /// Encoding, decoding or socket failure mid-exchange
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// One cause in a remote exception chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionCause {
    pub class: String,
    pub message: String,
    /// Rendered stack frames, innermost first
    pub frames: Vec<String>,
}

/// Exception raised by remotely evaluated code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteException {
    /// Exception class
    pub class: String,
    /// Exception message
    pub message: String,
    /// Causes fetched with a `stacktrace` request (may be empty)
    pub causes: Vec<ExceptionCause>,
}

impl RemoteException {
    /// Render the full cause chain, one frame per line
    pub fn trace(&self) -> String {
        let mut out = String::new();
        for (i, cause) in self.causes.iter().enumerate() {
            if i > 0 {
                out.push_str("Caused by: ");
            }
            out.push_str(&format!("{}: {}\n", cause.class, cause.message));
            for frame in &cause.frames {
                out.push_str(&format!("    at {}\n", frame));
            }
        }
        out
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.class)
        } else {
            write!(f, "{}: {}", self.class, self.message)
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
