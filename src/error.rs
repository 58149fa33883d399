//! Error handling for the framelink pipeline core
//!
//! This module defines the error taxonomy used throughout the crate and a
//! Result alias. Fatal (programmer-error-class) conditions are distinct
//! variants so callers can tell them apart from recoverable, counted
//! conditions, which are reported through boolean returns on the hot paths
//! instead of errors.

use thiserror::Error;

/// Main error type for framelink operations
#[derive(Error, Debug)]
pub enum FramelinkError {
    /// The pipeline was initialized a second time
    #[error("Pipeline was already initialized")]
    AlreadyInitialized,

    /// A public operation was called before `initialize()`
    #[error("Pipeline was not initialized")]
    NotInitialized,

    /// A delivered correspondence id is smaller than the front of the
    /// pending-metadata queue. Ordering cannot be repaired.
    #[error("Correspondence id {id} is smaller than pending-queue front {front}")]
    CorrespondenceOrder { id: u64, front: u64 },

    /// The backend delivered a buffer but no ingress metadata was recorded
    #[error("Received backend output (id {id}) but pending-metadata queue is empty")]
    PendingQueueEmpty { id: u64 },

    /// The backend refused a running-state transition
    #[error("Backend state transition failed: {0}")]
    StateTransition(String),

    /// Buffer mapping or copy failure reported by the backend's memory
    /// primitives. Indicates a resource-lifecycle bug, never retried.
    #[error("Buffer error: {0}")]
    Buffer(String),

    /// Fatal error reported by the backend itself
    #[error("Backend error: {0}")]
    Backend(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<FramelinkError>,
    },
}

impl FramelinkError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        FramelinkError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for framelink operations
pub type Result<T> = std::result::Result<T, FramelinkError>;

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
