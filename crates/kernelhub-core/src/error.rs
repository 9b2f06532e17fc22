//! Error types for the kernelhub core library.

use thiserror::Error;

/// Result type alias using the core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for kernelhub operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Kernel protocol frame could not be understood
    #[error("Failed to parse kernel frame: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejection of malformed options at a public boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Expected an object but got {found}")]
    NotAnObject { found: String },

    #[error("Properties {} are not allowed", .names.join(","))]
    UnknownProperties { names: Vec<String> },

    #[error("Missing required property {name}")]
    MissingProperty { name: String },

    #[error("Invalid property {name}: expected {expected} but got {found}")]
    InvalidType {
        name: String,
        expected: String,
        found: String,
    },

    #[error("Property {name} must not be empty")]
    Empty { name: String },
}
