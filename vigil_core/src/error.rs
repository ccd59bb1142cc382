//! Error types for the monitoring core

use thiserror::Error;

/// Result type alias for monitoring core operations
pub type Result<T> = std::result::Result<T, VigilError>;

/// Error types surfaced by the monitoring core and its collaborators
#[derive(Error, Debug)]
pub enum VigilError {
    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    #[error("Invalid log category: {0}")]
    InvalidCategory(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Sink error: {collection} - {message}")]
    Sink { collection: String, message: String },

    #[error("Sink collection unavailable: {0}")]
    MissingCollection(String),

    #[error("Dispatch error: {channel} - {message}")]
    Dispatch { channel: String, message: String },

    #[error("Health check failed: {check} - {message}")]
    Check { check: String, message: String },

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VigilError {
    /// Create a new sink error
    pub fn sink<S: Into<String>>(collection: S, message: S) -> Self {
        Self::Sink {
            collection: collection.into(),
            message: message.into(),
        }
    }

    /// Create a new dispatch error
    pub fn dispatch<S: Into<String>>(channel: S, message: S) -> Self {
        Self::Dispatch {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Create a new health check error
    pub fn check<S: Into<String>>(check: S, message: S) -> Self {
        Self::Check {
            check: check.into(),
            message: message.into(),
        }
    }

    /// Create a new initialization error
    pub fn initialization<S: Into<String>>(message: S) -> Self {
        Self::Initialization(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            VigilError::Network(_) => true,
            VigilError::Database(_) => true,
            VigilError::Io(_) => true,
            VigilError::Sink { .. } => true,
            _ => false,
        }
    }

    /// Get the error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            VigilError::InvalidEnvironment(_) => "validation",
            VigilError::InvalidLevel(_) => "validation",
            VigilError::InvalidCategory(_) => "validation",
            VigilError::Config(_) => "config",
            VigilError::Serialization(_) => "serialization",
            VigilError::Io(_) => "io",
            VigilError::Database(_) => "database",
            VigilError::Network(_) => "network",
            VigilError::Sink { .. } => "sink",
            VigilError::MissingCollection(_) => "sink",
            VigilError::Dispatch { .. } => "dispatch",
            VigilError::Check { .. } => "health_check",
            VigilError::Initialization(_) => "initialization",
            VigilError::Internal(_) => "internal",
        }
    }
}
