//! rv-core: Core abstractions and configuration for reval
//!
//! This crate provides the configuration, error taxonomy, run context and
//! form segmenter shared by the session client and the CLI, plus the
//! `Transport` trait the orchestrator is written against.

pub mod config;
pub mod context;
pub mod error;
pub mod forms;
pub mod traits;

pub use context::RunContext;
pub use error::{ConfigError, ExceptionCause, RemoteException, RunError, TransportError};
pub use forms::{segment, string_literal, Form, UnbalancedSource};
pub use traits::{CompletionPolicy, Transport};
