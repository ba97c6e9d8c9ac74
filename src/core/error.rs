//! Runner error types and the error report sent to the worker
//!
//! Every component has its own error enum; `RunnerError` aggregates them at the
//! lifecycle boundary where they are turned into an `errorMessage` report.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::algorithm::{AlgorithmError, LoadError};
use crate::broker::BrokerError;
use crate::cache::CacheError;
use crate::storage::StorageError;
use crate::streaming::StreamingError;
use crate::transport::TransportError;

/// Errors that can surface while the controller handles a lifecycle command
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("{0}")]
    Load(#[from] LoadError),

    #[error("{0}")]
    Algorithm(#[from] AlgorithmError),

    #[error("{0}")]
    Broker(#[from] BrokerError),

    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Cache(#[from] CacheError),

    #[error("{0}")]
    Streaming(#[from] StreamingError),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("invalid {command} payload: {reason}")]
    InvalidPayload { command: String, reason: String },

    #[error("task is not initialized")]
    NotInitialized,
}

impl RunnerError {
    /// Extra details attached to the report, when the source error carries any
    pub fn details(&self) -> Option<String> {
        match self {
            RunnerError::Algorithm(e) => e.details.clone(),
            _ => None,
        }
    }
}

/// Error payload of the outgoing `errorMessage` command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorReport {
    pub const FAILED: &'static str = "Failed";

    pub fn failed(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            code: Self::FAILED.to_string(),
            message: message.into(),
            details,
        }
    }
}

impl From<&RunnerError> for ErrorReport {
    fn from(error: &RunnerError) -> Self {
        ErrorReport::failed(error.to_string(), error.details())
    }
}
