//! Domain-specific error types for attrgen

use thiserror::Error;

use crate::clients::ClientError;

/// Main error type for the attribute generation pipeline
#[derive(Error, Debug)]
pub enum AttrGenError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("API key error: {message}")]
    Keys { message: String },

    #[error("No usable API keys left ({disabled} disabled)")]
    NoUsableKeys { disabled: usize },

    #[error("LLM request failed: {0}")]
    Client(#[from] ClientError),

    #[error("Could not parse model reply: {message}")]
    Parse { message: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl AttrGenError {
    pub fn config(message: impl Into<String>) -> Self {
        AttrGenError::Config {
            message: message.into(),
        }
    }

    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        AttrGenError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Whether another attempt at the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AttrGenError::Client(err) => err.is_retryable(),
            AttrGenError::Parse { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for AttrGenError {
    fn from(err: serde_json::Error) -> Self {
        AttrGenError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for AttrGenError {
    fn from(err: serde_yaml::Error) -> Self {
        AttrGenError::Config {
            message: format!("invalid YAML: {}", err),
        }
    }
}

/// Result type alias for attrgen operations
pub type Result<T> = std::result::Result<T, AttrGenError>;
