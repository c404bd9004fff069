//! Step executor.
//!
//! Walks a step tree against one row's [`ExecutionContext`], dispatching each
//! step kind to its handler and recursing into conditional and loop children.
//! Every leaf failure goes through the [`RecoveryManager`] before it becomes a
//! [`RunResult::Failed`].

mod conditions;
pub mod context;
pub mod events;
mod flow_control;
mod search;

pub use context::{ExecutionContext, RunControl};
pub use events::ExecutionEvent;

use crate::audit_log::{AuditHandle, StepRecord};
use crate::config::Settings;
use crate::error::{ProviderError, StepError};
use crate::providers::{InputProvider, RecognitionProvider};
use crate::recovery::{
    ErrorCategory, FailedAttempt, RecoveryManager, Remedy, RetryPolicy, with_recovery,
};
use crate::step_types::{ErrorHandling, MacroStep, ScreenshotStep, StepKind};
use chrono::Local;
use crossbeam_channel::Sender;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Set by image steps inside a `while_image` body when they find their target.
type HitFlag<'p> = Option<&'p Cell<bool>>;

const DOUBLE_CLICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct ExecutorOptions {
    pub retry_delay: Duration,
    pub wait_poll: Duration,
    pub while_image_max_iterations: u32,
    pub screenshot_dir: PathBuf,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ExecutorOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            retry_delay: settings.retry_delay(),
            wait_poll: settings.wait_poll(),
            while_image_max_iterations: settings.execution.while_image_max_iterations,
            screenshot_dir: settings.screenshot_dir(),
        }
    }
}

/// Why a step walk stopped early.
#[derive(Clone, Debug, PartialEq)]
pub struct StepFailure {
    pub step_id: String,
    pub step_name: String,
    pub category: ErrorCategory,
    pub message: String,
    pub policy: ErrorHandling,
    pub retry_count: u32,
}

impl StepFailure {
    fn new(step: &MacroStep, err: StepError) -> Self {
        Self {
            step_id: step.step_id.clone(),
            step_name: step.name.clone(),
            category: err.category,
            message: err.message,
            policy: step.error_handling,
            retry_count: step.retry_count,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunResult {
    Success,
    Failed(StepFailure),
    Cancelled,
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Last coordinate covered by a span starting at `origin`.
fn last_pixel(origin: i32, len: u32) -> i32 {
    let len = i32::try_from(len).unwrap_or(i32::MAX);
    origin.saturating_add(len - 1)
}

fn input_err(e: ProviderError) -> StepError {
    StepError::from_provider(e, ErrorCategory::Execution)
}

pub struct StepExecutor<'a> {
    input: &'a dyn InputProvider,
    recognizer: &'a dyn RecognitionProvider,
    recovery: &'a RecoveryManager,
    audit: Option<AuditHandle>,
    events: Option<Sender<ExecutionEvent>>,
    options: ExecutorOptions,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        input: &'a dyn InputProvider,
        recognizer: &'a dyn RecognitionProvider,
        recovery: &'a RecoveryManager,
    ) -> Self {
        Self {
            input,
            recognizer,
            recovery,
            audit: None,
            events: None,
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_events(mut self, events: Sender<ExecutionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Runs `steps` in order. Stops at the first failure or cancellation.
    pub fn run(&self, steps: &[MacroStep], ctx: &ExecutionContext) -> RunResult {
        self.run_steps(steps, ctx, None)
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn run_steps(
        &self,
        steps: &[MacroStep],
        ctx: &ExecutionContext,
        hit_flag: HitFlag<'_>,
    ) -> RunResult {
        for (index, step) in steps.iter().enumerate() {
            if !ctx.control.checkpoint() {
                return RunResult::Cancelled;
            }
            if !step.enabled {
                log::debug!("Skipping disabled step '{}'", step.name);
                continue;
            }
            match self.run_step(index, step, ctx, hit_flag) {
                RunResult::Success => {}
                other => return other,
            }
        }
        RunResult::Success
    }

    fn run_step(
        &self,
        index: usize,
        step: &MacroStep,
        ctx: &ExecutionContext,
        hit_flag: HitFlag<'_>,
    ) -> RunResult {
        self.emit(ExecutionEvent::StepStarted {
            step_id: step.step_id.clone(),
            name: step.name.clone(),
        });
        log::info!("Step {} '{}' ({})", index + 1, step.name, step.step_type());
        let started = Instant::now();

        let (result, details) = match &step.kind {
            StepKind::IfCondition(s) => self.run_if(index, step, s, ctx, hit_flag),
            StepKind::Loop(s) => self.run_loop(step, s, ctx, hit_flag),
            _ => (self.run_leaf(index, step, ctx, hit_flag), describe(step)),
        };

        let error = match &result {
            RunResult::Success => None,
            RunResult::Failed(f) => Some(f.message.as_str()),
            RunResult::Cancelled => Some("cancelled"),
        };
        if let Some(audit) = &self.audit {
            audit.log_step_execution(StepRecord {
                row_index: ctx.row_index,
                step_index: index,
                step_name: &step.name,
                step_type: step.step_type(),
                success: error.is_none(),
                error,
                duration: started.elapsed(),
                details,
            });
        }
        self.emit(ExecutionEvent::StepFinished {
            step_id: step.step_id.clone(),
            success: error.is_none(),
        });
        result
    }

    fn record_context(&self, step: &MacroStep, ctx: &ExecutionContext) -> BTreeMap<String, String> {
        let mut context = BTreeMap::from([
            ("step_id".to_string(), step.step_id.clone()),
            ("step_name".to_string(), step.name.clone()),
            ("step_type".to_string(), step.step_type().to_string()),
        ]);
        if let Some(row) = ctx.row_index {
            context.insert("row".to_string(), row.to_string());
        }
        context
    }

    /// Writes a `FAILED` audit row for one attempt that did not end the step.
    fn audit_attempt(
        &self,
        index: usize,
        step: &MacroStep,
        ctx: &ExecutionContext,
        error: &StepError,
        details: String,
        duration: Duration,
    ) {
        let Some(audit) = &self.audit else {
            return;
        };
        let details = match describe(step) {
            Some(what) => format!("{}; {}", details, what),
            None => details,
        };
        audit.log_step_execution(StepRecord {
            row_index: ctx.row_index,
            step_index: index,
            step_name: &step.name,
            step_type: step.step_type(),
            success: false,
            error: Some(&error.message),
            duration,
            details: Some(details),
        });
    }

    /// Reports a step failure that ends the walk.
    fn fail(&self, step: &MacroStep, ctx: &ExecutionContext, err: StepError) -> RunResult {
        log::error!("Step '{}' failed: {}", step.name, err);
        self.emit(ExecutionEvent::Error {
            category: err.category,
            message: err.message.clone(),
            row: ctx.row_index,
            step: Some(step.step_id.clone()),
        });
        RunResult::Failed(StepFailure::new(step, err))
    }

    fn run_leaf(
        &self,
        index: usize,
        step: &MacroStep,
        ctx: &ExecutionContext,
        hit_flag: HitFlag<'_>,
    ) -> RunResult {
        let retries = match step.error_handling {
            ErrorHandling::Retry => step.retry_count,
            _ => 0,
        };
        let policy = RetryPolicy {
            retries,
            delay: self.options.retry_delay,
        };
        let control = ctx.control.clone();
        let sleep = move |d: Duration| control.sleep(d);
        let attempt_started = Cell::new(Instant::now());
        let report = |failed: FailedAttempt<'_>| {
            let duration = attempt_started.replace(Instant::now()).elapsed();
            self.audit_attempt(index, step, ctx, failed.error, failed.describe(), duration);
        };
        let outcome = with_recovery(
            self.recovery,
            &step.recovery,
            policy,
            &self.record_context(step, ctx),
            &sleep,
            &report,
            |remedies| self.exec_leaf(step, ctx, remedies, hit_flag),
        );
        match outcome {
            Ok(()) => RunResult::Success,
            Err(_) if ctx.control.is_cancelled() => RunResult::Cancelled,
            Err(err) => self.fail(step, ctx, err),
        }
    }

    fn exec_leaf(
        &self,
        step: &MacroStep,
        ctx: &ExecutionContext,
        remedies: &[Remedy],
        hit_flag: HitFlag<'_>,
    ) -> Result<(), StepError> {
        if remedies.contains(&Remedy::ResetDpiScale) {
            self.recognizer.reset_scale();
        }
        if remedies.contains(&Remedy::ClearCaches) {
            self.recognizer.clear_cache();
        }
        match &step.kind {
            StepKind::MouseClick(s) => {
                let (x, y) = self.clamp_point(s.x, s.y, remedies);
                self.input
                    .click(x, y, s.button, s.clicks, secs(s.interval))
                    .map_err(input_err)
            }
            StepKind::MouseMove(s) => {
                let (x, y) = self.clamp_point(s.x, s.y, remedies);
                self.input.move_to(x, y, secs(s.duration)).map_err(input_err)
            }
            StepKind::MouseDrag(s) => {
                let (x, y) = self.clamp_point(s.x, s.y, remedies);
                self.input
                    .drag(x, y, s.button, secs(s.duration))
                    .map_err(input_err)
            }
            StepKind::MouseScroll(s) => {
                if let (Some(x), Some(y)) = (s.x, s.y) {
                    let (x, y) = self.clamp_point(x, y, remedies);
                    self.input.move_to(x, y, Duration::ZERO).map_err(input_err)?;
                }
                self.input.scroll(s.clicks).map_err(input_err)
            }
            StepKind::KeyboardType(s) => {
                let text = if s.use_variables {
                    ctx.substitute(&s.text)
                } else {
                    s.text.clone()
                };
                self.input.type_text(&text, secs(s.interval)).map_err(input_err)
            }
            StepKind::KeyboardHotkey(s) => {
                let keys: Vec<String> = s.keys.iter().map(|k| ctx.substitute(k)).collect();
                self.input.hotkey(&keys).map_err(input_err)
            }
            StepKind::WaitTime(s) => self.wait(ctx, s.seconds),
            StepKind::WaitImage(s) => self.wait_image(s, ctx, remedies, hit_flag),
            StepKind::Screenshot(s) => self.screenshot(s, ctx),
            StepKind::ImageSearch(s) => self.image_search(s, ctx, remedies, hit_flag),
            StepKind::TextSearch(s) => self.text_search(s, ctx, remedies, hit_flag),
            StepKind::DynamicTextSearch(s) => self.dynamic_text_search(s, ctx, remedies, hit_flag),
            StepKind::IfCondition(_) | StepKind::Loop(_) => Err(StepError::new(
                ErrorCategory::General,
                format!("'{}' is not a leaf step", step.name),
            )),
        }
    }

    fn wait(&self, ctx: &ExecutionContext, seconds: f64) -> Result<(), StepError> {
        if ctx.control.sleep(secs(seconds)) {
            Ok(())
        } else {
            Err(StepError::new(
                ErrorCategory::Execution,
                "wait interrupted by stop request",
            ))
        }
    }

    /// Keeps a point on the primary display once `use_primary_monitor` applies.
    fn clamp_point(&self, x: i32, y: i32, remedies: &[Remedy]) -> (i32, i32) {
        if !remedies.contains(&Remedy::UsePrimaryMonitor) {
            return (x, y);
        }
        match self.input.primary_bounds() {
            Some(b) if b.width > 0 && b.height > 0 => (
                x.clamp(b.x, last_pixel(b.x, b.width)),
                y.clamp(b.y, last_pixel(b.y, b.height)),
            ),
            _ => (x, y),
        }
    }

    fn screenshot(&self, s: &ScreenshotStep, ctx: &ExecutionContext) -> Result<(), StepError> {
        let path = match &s.save_path {
            Some(p) => PathBuf::from(ctx.substitute(p)),
            None => self.options.screenshot_dir.join(format!(
                "screenshot_{}.png",
                Local::now().format("%Y%m%d_%H%M%S_%3f")
            )),
        };
        self.recognizer
            .capture(s.region, &path)
            .map_err(|e| StepError::from_provider(e, ErrorCategory::Execution))?;
        log::info!("Screenshot saved to {}", path.display());
        Ok(())
    }
}

/// Audit details for a leaf step, from its unsubstituted parameters.
fn describe(step: &MacroStep) -> Option<String> {
    match &step.kind {
        StepKind::ImageSearch(s) => Some(format!("image: {}", s.image_path)),
        StepKind::WaitImage(s) => Some(format!("image: {}", s.image_path)),
        StepKind::TextSearch(s) => Some(match &s.excel_column {
            Some(col) if s.search_text.is_empty() => format!("column: {}", col),
            _ => format!("text: {}", s.search_text),
        }),
        StepKind::DynamicTextSearch(s) if s.mask_in_logs => Some("text: [MASKED]".to_string()),
        StepKind::DynamicTextSearch(s) => Some(format!("text: {}", s.search_text)),
        _ => None,
    }
}
