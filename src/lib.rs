//! Row-driven desktop macro runner.
//!
//! A [`Macro`] is a tree of steps (input, waits, image and text search,
//! conditions, loops). The [`ExecutionEngine`] runs it once per row of a
//! [`providers::DataSource`], substituting row values into step fields,
//! routing failures through the [`recovery::RecoveryManager`] and recording
//! every step in an [`audit_log`] session.

pub mod audit_log;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hotkeys;
pub mod macro_def;
pub mod providers;
pub mod recovery;
pub mod step_types;
pub mod storage;
pub mod substitution;

pub use config::Settings;
pub use engine::{ExecutionEngine, ExecutionState, RunOptions, RunOutcome, RunSummary};
pub use error::{EngineError, MacroError, ProviderError, StepError};
pub use executor::{ExecutionContext, ExecutionEvent, RunResult, StepExecutor};
pub use macro_def::Macro;
pub use step_types::{MacroStep, StepKind};
