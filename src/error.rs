//! Error types shared across the runner.
//!
//! Library code returns these typed errors; the binary wraps them in
//! `anyhow` with context before reporting.

use crate::recovery::ErrorCategory;
use std::time::Duration;
use thiserror::Error;

/// Failures while building, validating, loading or saving a macro.
#[derive(Debug, Error)]
pub enum MacroError {
    #[error("invalid macro: {}", .0.join("; "))]
    InvalidMacro(Vec<String>),

    #[error("macro file not found: {0}")]
    NotFound(String),

    #[error("malformed macro document: {0}")]
    Format(#[from] serde_json::Error),

    #[error("encryption error: {0}")]
    Crypto(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures raised by external collaborators (recognition, input, data source).
///
/// The message texts are part of the contract with the recovery heuristics,
/// which match on lowercase substrings.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("no such file: {0}")]
    FileNotFound(String),

    #[error("text recognition runtime not installed: {0}")]
    NotInstalled(String),

    #[error("invalid region: {0}")]
    InvalidRegion(String),

    #[error("coordinates out of bounds: {0}")]
    OutOfBounds(String),

    #[error("dpi scale anomaly: {0}")]
    DpiScale(String),

    #[error("operation timeout after {0:?}")]
    Timeout(Duration),

    #[error("file is locked, permission denied: {0}")]
    Locked(String),

    #[error("{0}")]
    Backend(String),
}

impl ProviderError {
    /// Category this error belongs to when it escapes a provider call made
    /// on behalf of a step of `default` category.
    pub fn category(&self, default: ErrorCategory) -> ErrorCategory {
        match self {
            ProviderError::OutOfBounds(_) | ProviderError::DpiScale(_) => ErrorCategory::Monitor,
            ProviderError::Timeout(_) => ErrorCategory::Execution,
            ProviderError::NotInstalled(_) => ErrorCategory::TextSearch,
            _ => default,
        }
    }
}

/// A classified step failure.
#[derive(Debug, Clone, Error)]
#[error("[{category}] {message}")]
pub struct StepError {
    pub category: ErrorCategory,
    pub message: String,
}

impl StepError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn from_provider(err: ProviderError, default: ErrorCategory) -> Self {
        Self::new(err.category(default), err.to_string())
    }
}

/// Lifecycle misuse and engine-level faults.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    InvalidMacro(#[from] MacroError),

    #[error("cannot {action} while engine is {state}")]
    InvalidState { action: &'static str, state: String },

    #[error("engine fault [{category}] at row {row:?}, step {step:?}: {message}")]
    Fault {
        category: ErrorCategory,
        message: String,
        row: Option<usize>,
        step: Option<String>,
    },

    #[error("execution thread did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error("failed to spawn execution thread: {0}")]
    Spawn(#[source] std::io::Error),
}
