//! Error types for the adapter pipeline

use thiserror::Error;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing fields in an example, invalid label values
    #[error("Data error: {0}")]
    Data(String),

    /// Insufficient device memory or other exhausted resources
    #[error("Resource error: {0}")]
    Resource(String),

    /// Missing or incompatible adapter/model artifact
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// Invalid configuration, rejected before any expensive work
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Tokenizer error
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// HuggingFace Hub error
    #[error("Hub error: {0}")]
    Hub(String),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a resource error
    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    /// Create an artifact error
    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::Artifact(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a tokenizer error
    pub fn tokenizer(msg: impl Into<String>) -> Self {
        Self::Tokenizer(msg.into())
    }
}

impl From<hf_hub::api::tokio::ApiError> for Error {
    fn from(err: hf_hub::api::tokio::ApiError) -> Self {
        Self::Hub(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("sparsity must be in [0, 1)");
        assert_eq!(err.to_string(), "Configuration error: sparsity must be in [0, 1)");
    }

    #[test]
    fn test_tensor_error_conversion() {
        let err: Error = candle_core::Error::Msg("shape mismatch".to_string()).into();
        assert!(matches!(err, Error::Tensor(_)));
    }
}
