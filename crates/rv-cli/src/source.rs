//! Program source selection

use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;

use thiserror::Error;

/// Reasons no program could be selected
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SourceError {
    #[error("Both --eval and a FILE were given; pass only one")]
    Conflicting,

    #[error("No program given: pass a FILE, use -e CODE, or pipe source on stdin")]
    Missing,
}

/// Where the program text comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Code passed with `-e`
    Inline(String),
    /// A file on disk
    File(PathBuf),
    /// Standard input (`-` or a pipe with no other source)
    Stdin,
}

impl Source {
    /// Pick the source from the command line
    ///
    /// `-e` wins over nothing, a FILE of `-` means stdin, and with neither
    /// given stdin is used only when it is not a terminal.
    pub fn resolve(
        eval: Option<String>,
        file: Option<PathBuf>,
        stdin_is_terminal: bool,
    ) -> Result<Self, SourceError> {
        match (eval, file) {
            (Some(_), Some(_)) => Err(SourceError::Conflicting),
            (Some(code), None) => Ok(Source::Inline(code)),
            (None, Some(path)) if path.as_os_str() == "-" => Ok(Source::Stdin),
            (None, Some(path)) => Ok(Source::File(path)),
            (None, None) if stdin_is_terminal => Err(SourceError::Missing),
            (None, None) => Ok(Source::Stdin),
        }
    }

    /// Read the program text
    pub fn load(&self) -> io::Result<String> {
        match self {
            Source::Inline(code) => Ok(code.clone()),
            Source::File(path) => std::fs::read_to_string(path),
            Source::Stdin => {
                let mut text = String::new();
                io::stdin().read_to_string(&mut text)?;
                Ok(text)
            }
        }
    }

    /// Whether loading consumes standard input
    pub fn reads_stdin(&self) -> bool {
        matches!(self, Source::Stdin)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Inline(_) => write!(f, "inline code"),
            Source::File(path) => write!(f, "{}", path.display()),
            Source::Stdin => write!(f, "standard input"),
        }
    }
}
