//! Common error types for hwdh.

use thiserror::Error;

/// Result type alias using hwdh's common error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_keep_message() {
        let err = Error::config("HWDH_ENCLAVE: expected a boolean");
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(
            err.to_string(),
            "configuration error: HWDH_ENCLAVE: expected a boolean"
        );
        assert_eq!(
            Error::serialization("eof").to_string(),
            "serialization error: eof"
        );
    }
}
