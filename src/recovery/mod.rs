//! Failure classification, bounded error history and opt-in recovery.
//!
//! The [`RecoveryManager`] is owned by whoever drives a run and passed down
//! by reference. It never changes behaviour on its own: a remedy is only
//! returned when the failure matches a heuristic *and* the step's
//! [`RecoveryHints`] opted into that remedy.

mod heuristics;
pub mod retry;

use crate::error::StepError;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, PoisonError};

pub use retry::{FailedAttempt, RetryPolicy, with_recovery};

/// Default ring-buffer capacity of the error history.
pub const HISTORY_CAPACITY: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Excel,
    Monitor,
    ImageSearch,
    TextSearch,
    Execution,
    General,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Excel => "EXCEL",
            ErrorCategory::Monitor => "MONITOR",
            ErrorCategory::ImageSearch => "IMAGE_SEARCH",
            ErrorCategory::TextSearch => "TEXT_SEARCH",
            ErrorCategory::Execution => "EXECUTION",
            ErrorCategory::General => "GENERAL",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorSeverity::Info => "INFO",
            ErrorSeverity::Warning => "WARNING",
            ErrorSeverity::Error => "ERROR",
            ErrorSeverity::Critical => "CRITICAL",
        })
    }
}

/// Remedies a step has opted into. Everything is off by default.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryHints {
    pub retry_with_encoding: bool,
    pub suggest_close_file: bool,
    pub normalize_columns: bool,
    pub use_primary_monitor: bool,
    pub reset_dpi_scale: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<String>,
    pub lower_confidence: bool,
    pub check_installation: bool,
    pub use_full_screen: bool,
    pub enable_preprocessing: bool,
    pub increase_timeout: bool,
    pub clear_cache: bool,
}

impl RecoveryHints {
    pub fn is_empty(&self) -> bool {
        *self == RecoveryHints::default()
    }
}

/// A concrete recovery action the failing handler should apply before retrying.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Remedy {
    RetryWithAlternateEncoding,
    CloseAndRetry,
    NormalizeColumnNames,
    UsePrimaryMonitor,
    ResetDpiScale,
    TryAlternatePaths(Vec<String>),
    LowerConfidence,
    WidenToFullScreen,
    EnablePreprocessing,
    IncreaseTimeout,
    ClearCaches,
}

impl Remedy {
    pub fn name(&self) -> &'static str {
        match self {
            Remedy::RetryWithAlternateEncoding => "retry_with_encoding",
            Remedy::CloseAndRetry => "suggest_close_file",
            Remedy::NormalizeColumnNames => "normalize_columns",
            Remedy::UsePrimaryMonitor => "use_primary_monitor",
            Remedy::ResetDpiScale => "reset_dpi_scale",
            Remedy::TryAlternatePaths(_) => "search_paths",
            Remedy::LowerConfidence => "lower_confidence",
            Remedy::WidenToFullScreen => "use_full_screen",
            Remedy::EnablePreprocessing => "enable_preprocessing",
            Remedy::IncreaseTimeout => "increase_timeout",
            Remedy::ClearCaches => "clear_cache",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Local>,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    pub context: BTreeMap<String, String>,
    pub recovered: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ErrorStatistics {
    pub total: usize,
    pub recovered: usize,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub by_severity: BTreeMap<ErrorSeverity, usize>,
    /// Newest first, at most five.
    pub recent: Vec<ErrorRecord>,
}

pub struct RecoveryManager {
    history: Mutex<VecDeque<ErrorRecord>>,
    capacity: usize,
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryManager {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Records `error` and returns the remedy the caller should apply, if any.
    ///
    /// `context` is stored with the record for later inspection (step name, row, ...).
    pub fn handle(
        &self,
        error: &StepError,
        hints: &RecoveryHints,
        severity: ErrorSeverity,
        context: BTreeMap<String, String>,
    ) -> Option<Remedy> {
        let remedy = heuristics::diagnose(error.category, &error.message, hints);
        match &remedy {
            Some(r) => log::info!(
                "Recovery for [{}] '{}': applying {}",
                error.category,
                error.message,
                r.name()
            ),
            None => log::debug!("No recovery for [{}] '{}'", error.category, error.message),
        }
        self.record(ErrorRecord {
            timestamp: Local::now(),
            category: error.category,
            severity,
            message: error.message.clone(),
            context,
            recovered: remedy.is_some(),
        });
        remedy
    }

    fn record(&self, record: ErrorRecord) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_back(record);
        while history.len() > self.capacity {
            history.pop_front();
        }
    }

    /// Most recent records first, optionally filtered by category.
    pub fn recent(&self, category: Option<ErrorCategory>, limit: usize) -> Vec<ErrorRecord> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history
            .iter()
            .rev()
            .filter(|r| category.is_none_or(|c| r.category == c))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statistics(&self) -> ErrorStatistics {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats = ErrorStatistics {
            total: history.len(),
            ..Default::default()
        };
        for r in history.iter() {
            *stats.by_category.entry(r.category).or_default() += 1;
            *stats.by_severity.entry(r.severity).or_default() += 1;
            if r.recovered {
                stats.recovered += 1;
            }
        }
        stats.recent = history.iter().rev().take(5).cloned().collect();
        stats
    }

    /// One-line summary for end-of-run logging.
    pub fn summary(&self) -> String {
        let stats = self.statistics();
        if stats.total == 0 {
            return "no errors recorded".to_string();
        }
        let per_category: Vec<String> = stats
            .by_category
            .iter()
            .map(|(c, n)| format!("{}: {}", c, n))
            .collect();
        format!(
            "{} errors ({} recovered); {}",
            stats.total,
            stats.recovered,
            per_category.join(", ")
        )
    }

    pub fn clear_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
