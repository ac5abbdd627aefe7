//! Configuration for reval
//!
//! Settings come from `<config dir>/reval/config.toml` (or `--config`), with
//! every field optional. Flags and environment variables are applied on top
//! by the CLI.

mod client;
pub mod serde_utils;

pub use client::{ClientConfig, CompletionConfig, CompletionMode, MultiplexMode, ServerAddress};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Default location of the config file
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("reval")
        .join("config.toml")
}

/// Parse the config file at `path`
pub fn load_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(path.to_path_buf()))
        }
        Err(e) => {
            return Err(ConfigError::Invalid(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    Ok(toml::from_str(&content)?)
}

/// Load the client configuration, falling back to defaults
///
/// An explicit path must exist; the default path is optional.
pub fn load_client_config(path: Option<&Path>) -> Result<ClientConfig, ConfigError> {
    if let Some(path) = path {
        return load_config(path);
    }

    let path = default_config_path();
    match load_config(&path) {
        Ok(config) => {
            tracing::debug!("Loaded config from {}", path.display());
            Ok(config)
        }
        Err(ConfigError::NotFound(_)) => Ok(ClientConfig::default()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "port = 7888\nnamespace = \"scratch\"\n\n[completion]\nceiling_ms = 500\n",
        )
        .unwrap();

        let config = load_client_config(Some(&path)).unwrap();
        assert_eq!(config.port, Some(7888));
        assert_eq!(config.namespace, "scratch");
        assert_eq!(config.completion.ceiling, Duration::from_millis(500));
        assert_eq!(config.completion.floor, Duration::from_millis(5));
        assert_eq!(config.response_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_explicit_missing_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_client_config(Some(&dir.path().join("missing.toml")));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();

        let result = load_client_config(Some(&path));
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
