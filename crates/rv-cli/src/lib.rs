//! reval: Command-line runner for remote evaluation
//!
//! Provides the `reval` binary's source loading, exit status mapping and
//! console output helpers.

pub mod exit;
pub mod output;
pub mod source;
