//! Server configuration loaded from JSON.
//!
//! ```json
//! {
//!   "keep_alives": true,
//!   "max_request_size": 1048576,
//!   "tls": { "cert_path": "certs/site.crt", "key_path": "certs/site.key" }
//! }
//! ```
//!
//! Every field is optional; missing fields take the [`Default`] values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::server::engine::DEFAULT_MAX_REQUEST_SIZE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Paths to a PEM certificate chain and its private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Whether responses may keep connections open for further requests.
    pub keep_alives: bool,
    /// Largest request (head plus body) buffered before answering 413.
    pub max_request_size: usize,
    /// Serve HTTPS with this certificate when set.
    pub tls: Option<TlsFiles>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            keep_alives: true,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            tls: None,
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_default() {
        assert_eq!(ServerConfig::from_json_str("{}").unwrap(), ServerConfig::default());
    }

    #[test]
    fn parses_all_fields() {
        let config = ServerConfig::from_json_str(
            r#"{
                "keep_alives": false,
                "max_request_size": 1024,
                "tls": { "cert_path": "a.crt", "key_path": "a.key" }
            }"#,
        )
        .unwrap();
        assert!(!config.keep_alives);
        assert_eq!(config.max_request_size, 1024);
        assert_eq!(
            config.tls,
            Some(TlsFiles {
                cert_path: "a.crt".into(),
                key_path: "a.key".into(),
            })
        );
    }

    #[test]
    fn rejects_wrong_types() {
        let err = ServerConfig::from_json_str(r#"{ "keep_alives": "yes" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = ServerConfig::from_json_file("/nonexistent/server.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
