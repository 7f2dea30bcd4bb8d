//! Error types for caffe-optimizer
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Main error type for network transformation operations
#[derive(Error, Debug)]
pub enum TransformError {
    /// Duplicate names, empty names or references that never resolve
    #[error("Malformed graph: {0}")]
    MalformedGraph(String),

    /// Prototxt syntax error
    #[error("Text format error at line {line}, column {column}: {message}")]
    TextFormat {
        /// 1-based line
        line: usize,
        /// 1-based column
        column: usize,
        /// What went wrong
        message: String,
    },

    /// Parameter blob missing from the store
    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    /// Tensor shapes do not agree
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Layer type the reference interpreter cannot run
    #[error("Unsupported layer '{name}' of type '{layer_type}'")]
    UnsupportedLayer {
        /// Layer name
        name: String,
        /// Caffe type string
        layer_type: String,
    },

    /// Invalid layer configuration
    #[error("Invalid layer: {0}")]
    InvalidLayer(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protobuf decode error
    #[error("Protobuf decode error: {0}")]
    ProtoDecode(#[from] prost::DecodeError),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for network operations
pub type CaffeResult<T> = Result<T, TransformError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransformError::MalformedGraph("duplicate layer 'conv1'".to_string());
        assert!(err.to_string().contains("conv1"));
    }

    #[test]
    fn test_text_format_position() {
        let err = TransformError::TextFormat {
            line: 12,
            column: 4,
            message: "expected '}'".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("line 12"));
        assert!(msg.contains("column 4"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: TransformError = io.into();
        assert!(matches!(err, TransformError::Io(_)));
    }
}
