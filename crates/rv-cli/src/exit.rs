//! Process exit statuses

use rv_core::RunError;

pub const SUCCESS: i32 = 0;

/// The evaluated program threw
pub const REMOTE_EXCEPTION: i32 = 1;

/// Bad flags, configuration or source selection
pub const USAGE: i32 = 2;

/// The program text is not balanced; nothing was sent
pub const UNBALANCED_SOURCE: i32 = 3;

/// The server could not be reached or misbehaved
pub const SERVER_FAILURE: i32 = 4;

/// Interrupted by Ctrl-C or SIGTERM (128 + SIGINT)
pub const CANCELLED: i32 = 130;

/// Exit status for a failed run
pub fn exit_code(err: &RunError) -> i32 {
    match err {
        RunError::RemoteEvaluation(_) => REMOTE_EXCEPTION,
        RunError::UnbalancedSource(_) => UNBALANCED_SOURCE,
        RunError::Cancelled => CANCELLED,
        RunError::ServerUnreachable { .. }
        | RunError::ResponseTimeout(_)
        | RunError::Protocol(_)
        | RunError::SessionCloneFailed
        | RunError::Io(_) => SERVER_FAILURE,
    }
}
