//! Error types for the core library.

use thiserror::Error;

/// Core library error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A configuration-related error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A path resolution or validation error.
    #[error("path error: {0}")]
    Path(String),

    /// An I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The key/value storage could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// A request was rejected before any network call was made.
    ///
    /// Displays the bare message: these strings are shown to the user as-is.
    #[error("{0}")]
    Validation(String),

    /// An API or HTTP error.
    #[error("API error: {0}")]
    Api(String),

    /// A generic error for other cases.
    #[error("error: {0}")]
    Other(String),
}

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_displays_bare_message() {
        let err = CoreError::Validation("Please select files first".to_string());
        assert_eq!(err.to_string(), "Please select files first");
    }

    #[test]
    fn api_error_keeps_prefix() {
        let err = CoreError::Api("Failed to create object: Unauthorized".to_string());
        assert_eq!(
            err.to_string(),
            "API error: Failed to create object: Unauthorized"
        );
    }
}
