//! Error types for inference operations.
//!
//! This module provides the common `Error` type and `Result<T>` alias used
//! across all inference crates. Uses `thiserror` for derive macros.
//!
//! Most backing-call failures never reach a caller: the pipeline logs them
//! and treats the call as having produced no data. The variants here are what
//! the individual clients report before that recovery happens.

use std::time::Duration;

use thiserror::Error;

/// Boxed source error carried by the backing-call variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while serving an inference request.
#[derive(Error, Debug)]
pub enum Error {
    /// The request is missing required fields or is malformed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The request named a model type other than `recall` or `rank`.
    #[error("Unknown model type: {0}")]
    UnknownModelType(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tenant, resource or result not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Feature store read failed.
    #[error("Feature store error: {message}")]
    Store {
        /// Human-readable description.
        message: String,
        /// Underlying client error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Tensor prediction call failed.
    #[error("Inference error: {message}")]
    Inference {
        /// Human-readable description.
        message: String,
        /// Underlying client error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Vector index search failed.
    #[error("Vector search error: {message}")]
    Search {
        /// Human-readable description.
        message: String,
        /// Underlying client error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// No pooled connection became available in time.
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// An operation exceeded its time budget.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected internal fault.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a feature store error without a source.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a feature store error wrapping a client error.
    pub fn store_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an inference error without a source.
    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference {
            message: msg.into(),
            source: None,
        }
    }

    /// Create an inference error wrapping a client error.
    pub fn inference_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Inference {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a vector search error without a source.
    pub fn search(msg: impl Into<String>) -> Self {
        Self::Search {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a vector search error wrapping a client error.
    pub fn search_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Search {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a pool exhaustion error.
    pub fn pool_exhausted(msg: impl Into<String>) -> Self {
        Self::PoolExhausted(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error came from request validation.
    ///
    /// Validation errors are returned before any backing call is made.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::UnknownModelType(_))
    }
}

/// Result type alias using the inference Error type.
pub type Result<T> = std::result::Result<T, Error>;
