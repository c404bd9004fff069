//! Conditional branches and loops.
//!
//! Children are walked through the same `run_steps` as top-level steps, so
//! checkpoints and auditing apply at every depth.

use super::conditions;
use super::{HitFlag, RunResult, StepExecutor};
use crate::error::StepError;
use crate::executor::ExecutionContext;
use crate::providers::TextOptions;
use crate::recovery::{ErrorCategory, ErrorSeverity, FailedAttempt, RetryPolicy, with_recovery};
use crate::step_types::{
    ConditionType, ErrorHandling, IfConditionStep, LoopStep, LoopType, MacroStep,
};
use std::cell::Cell;
use std::path::Path;
use std::time::Duration;

impl StepExecutor<'_> {
    pub(super) fn run_if(
        &self,
        index: usize,
        step: &MacroStep,
        s: &IfConditionStep,
        ctx: &ExecutionContext,
        hit_flag: HitFlag<'_>,
    ) -> (RunResult, Option<String>) {
        let branch = match self.evaluate_condition(s, ctx) {
            Ok(b) => b,
            Err(err) => {
                // An unevaluable condition takes the false branch.
                log::warn!("Condition '{}' could not be evaluated: {}", step.name, err);
                self.recovery.handle(
                    &err,
                    &step.recovery,
                    ErrorSeverity::Warning,
                    self.record_context(step, ctx),
                );
                let details = format!("condition error ({}); taking false branch", err.category);
                self.audit_attempt(index, step, ctx, &err, details, Duration::ZERO);
                false
            }
        };
        log::info!("Condition '{}' -> {}", step.name, branch);
        let children = if branch { &s.true_steps } else { &s.false_steps };
        (
            self.run_steps(children, ctx, hit_flag),
            Some(format!("condition: {}", branch)),
        )
    }

    fn evaluate_condition(
        &self,
        s: &IfConditionStep,
        ctx: &ExecutionContext,
    ) -> Result<bool, StepError> {
        let v = &s.condition_value;
        match s.condition_type {
            ConditionType::ImageExists => {
                let path = ctx.substitute(&v.image_path);
                self.recognizer
                    .find_image(Path::new(&path), v.confidence.unwrap_or(0.9), v.region)
                    .map(|m| m.is_some())
                    .map_err(|e| StepError::from_provider(e, ErrorCategory::ImageSearch))
            }
            ConditionType::TextExists => {
                let text = ctx.substitute(&v.text);
                let options = TextOptions {
                    exact_match: v.exact_match,
                    preprocess: false,
                };
                self.recognizer
                    .find_text(&text, v.region, v.confidence.unwrap_or(0.5), &options)
                    .map(|m| m.is_some())
                    .map_err(|e| StepError::from_provider(e, ErrorCategory::TextSearch))
            }
            kind => {
                let left = variable_value(&v.variable, ctx);
                let right = ctx.substitute(&v.compare_value);
                Ok(conditions::compare(kind, &left, &right))
            }
        }
    }

    pub(super) fn run_loop(
        &self,
        step: &MacroStep,
        s: &LoopStep,
        ctx: &ExecutionContext,
        hit_flag: HitFlag<'_>,
    ) -> (RunResult, Option<String>) {
        match s.loop_type {
            LoopType::Count => {
                for i in 0..s.loop_count {
                    if !ctx.control.checkpoint() {
                        return (RunResult::Cancelled, Some(format!("iteration {}", i + 1)));
                    }
                    log::debug!("Loop '{}' iteration {}/{}", step.name, i + 1, s.loop_count);
                    match self.run_steps(&s.steps, ctx, hit_flag) {
                        RunResult::Success => {}
                        other => return (other, Some(format!("iteration {}", i + 1))),
                    }
                }
                (
                    RunResult::Success,
                    Some(format!("{} iterations", s.loop_count)),
                )
            }
            // Rows are iterated by the engine; the body runs once per row.
            LoopType::ForEachRow => (
                self.run_steps(&s.steps, ctx, hit_flag),
                Some("per-row body".to_string()),
            ),
            LoopType::WhileImage => self.run_while_image(step, s, ctx),
        }
    }

    /// Repeats the body until an image step in it finds its target.
    ///
    /// Running out of iterations is a failure of this step and goes through
    /// the same retry and recovery path as a leaf step.
    fn run_while_image(
        &self,
        step: &MacroStep,
        s: &LoopStep,
        ctx: &ExecutionContext,
    ) -> (RunResult, Option<String>) {
        let max = s
            .max_iterations
            .unwrap_or(self.options.while_image_max_iterations)
            .max(1);
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
        // The loop is audited as a whole by `run_step`.
        let report = |failed: FailedAttempt<'_>| {
            log::warn!("Loop '{}' {}: {}", step.name, failed.describe(), failed.error);
        };
        let outcome = with_recovery(
            self.recovery,
            &step.recovery,
            policy,
            &self.record_context(step, ctx),
            &sleep,
            &report,
            |_| {
                for i in 0..max {
                    if !ctx.control.checkpoint() {
                        return Ok((RunResult::Cancelled, Some(format!("iteration {}", i + 1))));
                    }
                    let found = Cell::new(false);
                    match self.run_steps(&s.steps, ctx, Some(&found)) {
                        RunResult::Success => {}
                        other => return Ok((other, Some(format!("iteration {}", i + 1)))),
                    }
                    if found.get() {
                        let details = format!("image found on iteration {}", i + 1);
                        return Ok((RunResult::Success, Some(details)));
                    }
                }
                Err(StepError::new(
                    ErrorCategory::Execution,
                    format!(
                        "while_image loop '{}' reached {} iterations without finding its image",
                        step.name, max
                    ),
                ))
            },
        );
        match outcome {
            Ok(done) => done,
            Err(_) if ctx.control.is_cancelled() => (RunResult::Cancelled, None),
            Err(err) => {
                let details = format!("{} iterations", max);
                (self.fail(step, ctx, err), Some(details))
            }
        }
    }
}

/// Value of the condition's variable. A name containing tokens is
/// substituted as a whole; unknown names read as empty.
fn variable_value(name: &str, ctx: &ExecutionContext) -> String {
    if name.contains("{{") || name.contains("${") {
        ctx.substitute(name)
    } else {
        ctx.variables.get(name.trim()).cloned().unwrap_or_default()
    }
}
