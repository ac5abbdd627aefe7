//! rv-session: Evaluation sessions for reval
//!
//! This crate talks to the evaluation server. It provides the TCP transport
//! with its completion detector, the named-pipe multiplexer for standard
//! streams, and the orchestrator that runs a whole program in a session.

pub mod completion;
pub mod console;
pub mod multiplexer;
pub mod orchestrator;
pub mod transport;
pub mod wrap;

pub use completion::CompletionDetector;
pub use console::{CaptureBuffer, InputStream, LocalIo, Sink};
pub use multiplexer::{Channels, MarkerScanner, Multiplexer};
pub use orchestrator::Orchestrator;
pub use transport::TcpTransport;
