//! Bounded retry around a fallible step operation.

use super::{ErrorSeverity, RecoveryHints, RecoveryManager, Remedy};
use crate::error::StepError;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: u32,
    /// Pause before a retry that has no remedy to apply.
    pub delay: Duration,
}

/// One failed attempt, as seen by the `report` hook of [`with_recovery`].
#[derive(Clone, Copy, Debug)]
pub struct FailedAttempt<'e> {
    /// 1-based; the remedial attempt is numbered after the last regular one.
    pub attempt: u32,
    pub attempts: u32,
    pub error: &'e StepError,
    /// Remedy chosen for the next attempt, if any.
    pub remedy: Option<&'e Remedy>,
}

impl FailedAttempt<'_> {
    pub fn describe(&self) -> String {
        let base = if self.attempt > self.attempts {
            "remedial attempt".to_string()
        } else {
            format!("attempt {}/{}", self.attempt, self.attempts)
        };
        match self.remedy {
            Some(r) => format!("{}; remedy: {}", base, r.name()),
            None => base,
        }
    }
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
        }
    }
}

/// Runs `op` up to `policy.retries + 1` times, offering every failure to `manager`.
///
/// `op` receives the remedies applied so far. A failure that yields a remedy
/// is retried immediately; one without waits `policy.delay` through `sleep`,
/// which returns `false` when the run was cancelled. If the final attempt
/// fails with a remedy that was not applied yet, one extra remedial attempt
/// is made. The last error is returned otherwise.
///
/// `report` sees every failed attempt, including the remedial one.
pub fn with_recovery<T>(
    manager: &RecoveryManager,
    hints: &RecoveryHints,
    policy: RetryPolicy,
    context: &BTreeMap<String, String>,
    sleep: &dyn Fn(Duration) -> bool,
    report: &dyn Fn(FailedAttempt<'_>),
    mut op: impl FnMut(&[Remedy]) -> Result<T, StepError>,
) -> Result<T, StepError> {
    let attempts = policy.retries.saturating_add(1);
    let mut applied: Vec<Remedy> = Vec::new();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match op(&applied) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let mut ctx = context.clone();
        ctx.insert("attempt".to_string(), attempt.to_string());
        let remedy = manager
            .handle(&err, hints, ErrorSeverity::Error, ctx)
            .filter(|r| !applied.contains(r));
        report(FailedAttempt {
            attempt,
            attempts,
            error: &err,
            remedy: remedy.as_ref(),
        });

        if attempt >= attempts {
            let Some(remedy) = remedy else {
                return Err(err);
            };
            log::info!("Final attempt failed; one remedial attempt with {}", remedy.name());
            applied.push(remedy);
            return op(&applied).inspect_err(|e| {
                let mut ctx = context.clone();
                ctx.insert("attempt".to_string(), "remedial".to_string());
                manager.handle(e, &RecoveryHints::default(), ErrorSeverity::Error, ctx);
                report(FailedAttempt {
                    attempt: attempts + 1,
                    attempts,
                    error: e,
                    remedy: None,
                });
            });
        }

        match remedy {
            Some(remedy) => applied.push(remedy),
            None => {
                log::warn!(
                    "Attempt {}/{} failed: {}; retrying in {:?}",
                    attempt,
                    attempts,
                    err,
                    policy.delay
                );
                if !sleep(policy.delay) {
                    return Err(err);
                }
            }
        }
    }
}
