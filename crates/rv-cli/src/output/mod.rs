//! Console messages from the CLI itself
//!
//! Everything here goes to stderr; stdout belongs to the evaluated program.

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

use rv_core::RemoteException;

/// Print an error message in red with an X prefix
pub fn print_error(msg: &str) {
    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow with a warning symbol prefix
pub fn print_warning(msg: &str) {
    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan with an info symbol prefix
pub fn print_info(msg: &str) {
    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a remote exception as `class: message` followed by its trace
///
/// # Arguments
/// * `exception` - The exception reported by the server. When it carries no
///   causes (the `stacktrace` request failed), only the headline is printed.
pub fn print_exception(exception: &RemoteException) {
    print_error(&exception.to_string());

    let trace = exception.trace();
    if trace.is_empty() {
        return;
    }

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print(trace),
        ResetColor
    );
}
