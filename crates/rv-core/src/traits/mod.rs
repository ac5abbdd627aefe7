//! Core trait definitions

mod transport;

pub use transport::{CompletionPolicy, Transport};
