//! Error handling for datafeed-rs
//!
//! This module defines custom error types and a Result alias for use
//! throughout the crate. Every failure here is recoverable: a failed
//! discovery or initialization leaves the synchronizer idle and retryable.

use thiserror::Error;

/// Main error type for datafeed-rs operations
#[derive(Error, Debug)]
pub enum DataFeedError {
    /// No catalog response arrived within the bounded wait
    #[error("Discovery timed out after {timeout_ms} ms: no response from source '{source_id}'")]
    DiscoveryTimeout { source_id: String, timeout_ms: u64 },

    /// A catalog response arrived but listed no variables
    #[error("Source '{0}' returned an empty variable catalog")]
    EmptyCatalog(String),

    /// `start` was called with no variables selected
    #[error("No variables selected")]
    EmptySelection,

    /// A selected variable is not part of the discovered catalog
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    /// The initial latest-value request was not answered in time
    #[error("Did not receive initial values within {timeout_ms} ms")]
    InitializationTimeout { timeout_ms: u64 },

    /// A bus message could not be decoded (never surfaced to the host)
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The bus collaborator could not deliver a message
    #[error("Connection unavailable: {0}")]
    ConnectionUnavailable(String),

    /// `start` was called while a session is already active
    #[error("A streaming session is already active")]
    AlreadyRunning,

    /// `discover` or `start` was called while a discovery is in flight
    #[error("Discovery is already in progress")]
    DiscoveryInProgress,

    /// A point was emitted for a series that was never created
    #[error("Series '{0}' was not registered before emission")]
    UnregisteredSeries(String),

    /// Errors reported by a batch source
    #[error("Source error: {0}")]
    Source(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<DataFeedError>,
    },
}

impl DataFeedError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        DataFeedError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, skipping any context layers
    pub fn root(&self) -> &DataFeedError {
        match self {
            DataFeedError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for failures of the discovery/initialization handshake,
    /// which leave the session idle and can simply be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            DataFeedError::DiscoveryTimeout { .. }
                | DataFeedError::EmptyCatalog(_)
                | DataFeedError::InitializationTimeout { .. }
                | DataFeedError::ConnectionUnavailable(_)
                | DataFeedError::DiscoveryInProgress
        )
    }
}

/// Result type alias for datafeed-rs operations
pub type Result<T> = std::result::Result<T, DataFeedError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| DataFeedError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| DataFeedError::Io(e).with_context(f()))
    }
}
