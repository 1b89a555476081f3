//! Serde configuration for the decorators.
//!
//! Every field has a default, so an empty document is a valid configuration:
//!
//! ```
//! use micro_middleware::config::MiddlewareConfig;
//!
//! let config: MiddlewareConfig = serde_json::from_str(r#"{"redirect": {"status": 303}}"#).unwrap();
//! assert_eq!(config.redirect.status, 303);
//! assert_eq!(config.redirect.header, "X-Location");
//! ```

use crate::cors::CorsConfig;
use crate::logger::BufferMode;
use crate::transformer::DEFAULT_MAX_BODY_SIZE;
use http::header::InvalidHeaderName;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid header name {name:?}: {source}")]
    InvalidHeader { name: String, source: InvalidHeaderName },

    #[error("status {status} is not a redirection")]
    InvalidStatus { status: u16 },
}

impl ConfigError {
    pub fn invalid_header(name: &str, source: InvalidHeaderName) -> Self {
        Self::InvalidHeader { name: name.to_owned(), source }
    }

    pub fn invalid_status(status: u16) -> Self {
        Self::InvalidStatus { status }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub redirect: RedirectConfig,
    pub logger: LoggerConfig,
    pub transform: TransformConfig,
    pub cors: Vec<CorsConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    /// Sentinel response header carrying the redirect location.
    pub header: String,
    pub status: u16,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self { header: "X-Location".to_owned(), status: 302 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub mode: BufferMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub max_body_size: usize,
    /// Reject form keys that match no message field.
    pub strict: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self { max_body_size: DEFAULT_MAX_BODY_SIZE, strict: false }
    }
}
