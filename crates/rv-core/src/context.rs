//! Per-run context
//!
//! Everything that would otherwise be process-wide state (start time, debug
//! flag, the argument vector handed to the evaluated program) travels in one
//! explicit value owned by the orchestrator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// State for a single evaluation run
#[derive(Debug)]
pub struct RunContext {
    started: Instant,
    run_id: String,
    debug: bool,
    args: Vec<String>,
    next_request: AtomicU64,
}

impl RunContext {
    /// Create a context stamped with the current time
    pub fn new(args: Vec<String>, debug: bool) -> Self {
        // A clock before the epoch only weakens uniqueness, the pid still differs
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        Self {
            started: Instant::now(),
            run_id: format!("{}-{}", std::process::id(), stamp),
            debug,
            args,
            next_request: AtomicU64::new(1),
        }
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Arguments exposed to the evaluated program
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Identifier unique to this process and start time, `<pid>-<millis>`
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Next request id, `<run id>-<n>`
    pub fn next_request_id(&self) -> String {
        let n = self.next_request.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.run_id, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_sequential() {
        let ctx = RunContext::new(vec!["a".to_string()], false);
        let first = ctx.next_request_id();
        let second = ctx.next_request_id();

        assert!(first.starts_with(ctx.run_id()));
        assert!(first.ends_with("-1"));
        assert!(second.ends_with("-2"));
        assert_eq!(ctx.args(), ["a".to_string()]);
        assert!(!ctx.debug());
    }

    #[test]
    fn test_run_id_starts_with_pid() {
        let ctx = RunContext::new(vec![], true);
        let pid = std::process::id().to_string();
        assert_eq!(ctx.run_id().split('-').next(), Some(pid.as_str()));
        assert!(ctx.debug());
    }
}
