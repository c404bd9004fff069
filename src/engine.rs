//! Execution engine: the row loop and its lifecycle state machine.
//!
//! `start` validates the macro and hands it, with the data source, to a
//! dedicated execution thread. The controller talks to that thread only
//! through [`RunControl`] (pause/cancel) and the event channel.

use crate::audit_log::{AuditHandle, AuditLog, AuditSession};
use crate::config::Settings;
use crate::error::{EngineError, StepError};
use crate::executor::{
    ExecutionContext, ExecutionEvent, ExecutorOptions, RunControl, RunResult, StepExecutor,
};
use crate::macro_def::Macro;
use crate::providers::{DataSource, InputProvider, RecognitionProvider};
use crate::recovery::{ErrorCategory, ErrorSeverity, RecoveryHints, RecoveryManager};
use crate::step_types::ErrorHandling;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Preparing,
    Running,
    Paused,
    Stopping,
    Error,
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Preparing => "preparing",
            ExecutionState::Running => "running",
            ExecutionState::Paused => "paused",
            ExecutionState::Stopping => "stopping",
            ExecutionState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every targeted row was processed, including rows failed under `continue`.
    Completed,
    StoppedByPolicy,
    Cancelled,
    Fault,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outcome: RunOutcome,
    pub fault: Option<String>,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Completed => 0,
            RunOutcome::StoppedByPolicy | RunOutcome::Cancelled => 2,
            RunOutcome::Fault => 3,
        }
    }
}

/// Per-run choices made by the caller.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Explicit 0-based rows. `None` means every row still pending.
    pub target_rows: Option<Vec<usize>>,
    /// Opt-ins applied when reading a row fails.
    pub data_recovery: RecoveryHints,
}

struct Worker {
    handle: JoinHandle<RunSummary>,
    done: Receiver<()>,
}

pub struct ExecutionEngine {
    input: Arc<dyn InputProvider>,
    recognizer: Arc<dyn RecognitionProvider>,
    recovery: Arc<RecoveryManager>,
    audit: Option<AuditLog>,
    settings: Settings,
    state: Arc<Mutex<ExecutionState>>,
    control: Arc<RunControl>,
    worker: Option<Worker>,
    events_tx: Sender<ExecutionEvent>,
    events_rx: Receiver<ExecutionEvent>,
}

impl ExecutionEngine {
    pub fn new(
        input: Arc<dyn InputProvider>,
        recognizer: Arc<dyn RecognitionProvider>,
        settings: Settings,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            input,
            recognizer,
            recovery: Arc::new(RecoveryManager::new()),
            audit: None,
            settings,
            state: Arc::new(Mutex::new(ExecutionState::Idle)),
            control: Arc::new(RunControl::new()),
            worker: None,
            events_tx,
            events_rx,
        }
    }

    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_recovery(mut self, recovery: Arc<RecoveryManager>) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn state(&self) -> ExecutionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Progress and error notifications from the execution thread.
    pub fn events(&self) -> Receiver<ExecutionEvent> {
        self.events_rx.clone()
    }

    pub fn start(
        &mut self,
        macro_def: Macro,
        data: Box<dyn DataSource>,
        options: RunOptions,
    ) -> Result<(), EngineError> {
        let state = self.state();
        if state != ExecutionState::Idle {
            return Err(EngineError::InvalidState {
                action: "start",
                state: state.to_string(),
            });
        }
        // A finished run that was never waited on.
        if let Some(worker) = self.worker.take() {
            let _ = worker.handle.join();
        }

        self.set_state(ExecutionState::Preparing);
        if let Err(e) = macro_def.validate() {
            log::error!("Macro '{}' rejected: {}", macro_def.name, e);
            self.set_state(ExecutionState::Idle);
            return Err(e.into());
        }

        self.control = Arc::new(RunControl::new());
        let (done_tx, done_rx) = bounded::<()>(1);
        let run = RowLoop {
            macro_def,
            data,
            options,
            input: Arc::clone(&self.input),
            recognizer: Arc::clone(&self.recognizer),
            recovery: Arc::clone(&self.recovery),
            audit: self.audit.clone(),
            executor_options: ExecutorOptions::from(&self.settings),
            row_delay: self.settings.row_delay(),
            retry_delay: self.settings.retry_delay(),
            control: Arc::clone(&self.control),
            state: Arc::clone(&self.state),
            events: self.events_tx.clone(),
        };

        // Running before the thread exists so an early pause() is accepted.
        self.set_state(ExecutionState::Running);
        let spawned = thread::Builder::new()
            .name("macro-exec".to_string())
            .spawn(move || {
                let summary = run.execute();
                let _ = done_tx.send(());
                summary
            });
        match spawned {
            Ok(handle) => {
                self.worker = Some(Worker {
                    handle,
                    done: done_rx,
                });
                Ok(())
            }
            Err(e) => {
                self.set_state(ExecutionState::Idle);
                Err(EngineError::Spawn(e))
            }
        }
    }

    pub fn pause(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            ExecutionState::Running => {
                self.control.pause();
                *state = ExecutionState::Paused;
                let _ = self.events_tx.send(ExecutionEvent::StateChanged(*state));
                log::info!("Pause requested");
                Ok(())
            }
            ExecutionState::Paused => Ok(()),
            other => Err(EngineError::InvalidState {
                action: "pause",
                state: other.to_string(),
            }),
        }
    }

    pub fn resume(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            ExecutionState::Paused => {
                *state = ExecutionState::Running;
                self.control.resume();
                let _ = self.events_tx.send(ExecutionEvent::StateChanged(*state));
                log::info!("Resumed");
                Ok(())
            }
            ExecutionState::Running => Ok(()),
            other => Err(EngineError::InvalidState {
                action: "resume",
                state: other.to_string(),
            }),
        }
    }

    /// Cancels the run and waits up to the stop grace period for the
    /// execution thread to reach a checkpoint.
    pub fn stop(&mut self) -> Result<Option<RunSummary>, EngineError> {
        let Some(worker) = self.worker.take() else {
            log::debug!("Stop requested with no run in progress");
            return Ok(None);
        };
        self.set_state(ExecutionState::Stopping);
        self.control.cancel();

        let grace = self.settings.stop_grace();
        match worker.done.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let summary = self.join(worker)?;
                self.set_state(ExecutionState::Idle);
                log::info!("Execution stopped");
                Ok(Some(summary))
            }
            Err(RecvTimeoutError::Timeout) => {
                log::error!("Execution thread still busy after {:?}", grace);
                self.worker = Some(worker);
                Err(EngineError::StopTimeout(grace))
            }
        }
    }

    /// Blocks until the current run ends and returns its summary.
    ///
    /// A run that ended in a fault leaves the engine in `Error`; waiting
    /// surfaces the fault and returns the engine to `Idle`.
    pub fn wait(&mut self) -> Result<RunSummary, EngineError> {
        let Some(worker) = self.worker.take() else {
            return Err(EngineError::InvalidState {
                action: "wait",
                state: self.state().to_string(),
            });
        };
        let summary = self.join(worker)?;
        if let Some(fault) = &summary.fault {
            log::error!("Run ended with a fault: {}", fault);
        }
        self.set_state(ExecutionState::Idle);
        Ok(summary)
    }

    fn join(&self, worker: Worker) -> Result<RunSummary, EngineError> {
        worker.handle.join().map_err(|_| {
            self.set_state(ExecutionState::Error);
            EngineError::Fault {
                category: ErrorCategory::General,
                message: "execution thread panicked".to_string(),
                row: None,
                step: None,
            }
        })
    }

    fn set_state(&self, next: ExecutionState) {
        set_state(&self.state, &self.events_tx, next);
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.control.cancel();
        }
    }
}

fn set_state(state: &Mutex<ExecutionState>, events: &Sender<ExecutionEvent>, next: ExecutionState) {
    let mut current = state.lock().unwrap_or_else(PoisonError::into_inner);
    if *current != next {
        log::debug!("Engine state {} -> {}", *current, next);
        *current = next;
        let _ = events.send(ExecutionEvent::StateChanged(next));
    }
}

/// Everything the execution thread owns for one run.
struct RowLoop {
    macro_def: Macro,
    data: Box<dyn DataSource>,
    options: RunOptions,
    input: Arc<dyn InputProvider>,
    recognizer: Arc<dyn RecognitionProvider>,
    recovery: Arc<RecoveryManager>,
    audit: Option<AuditLog>,
    executor_options: ExecutorOptions,
    row_delay: Duration,
    retry_delay: Duration,
    control: Arc<RunControl>,
    state: Arc<Mutex<ExecutionState>>,
    events: Sender<ExecutionEvent>,
}

/// An engine-level failure that ends the run.
struct Fault {
    category: ErrorCategory,
    message: String,
    row: Option<usize>,
}

impl RowLoop {
    fn execute(mut self) -> RunSummary {
        let source_id = self.data.source_id();
        let mut session: Option<AuditSession> = match &self.audit {
            Some(log) => match log.start_session(&self.macro_def.name, &source_id) {
                Ok(s) => Some(s),
                Err(e) => {
                    log::warn!("Audit log unavailable, continuing without it: {}", e);
                    None
                }
            },
            None => None,
        };
        let audit = session.as_ref().map(AuditSession::handle);

        let rows = self.target_rows();
        let total = rows.len();
        log::info!(
            "Running macro '{}' over {} row(s) from {}",
            self.macro_def.name,
            total,
            source_id
        );

        let input = Arc::clone(&self.input);
        let recognizer = Arc::clone(&self.recognizer);
        let recovery = Arc::clone(&self.recovery);
        let mut executor = StepExecutor::new(&*input, &*recognizer, &recovery)
            .with_options(self.executor_options.clone())
            .with_events(self.events.clone());
        if let Some(handle) = &audit {
            executor = executor.with_audit(handle.clone());
        }

        let session_start = Instant::now();
        let mut succeeded = 0;
        let mut failed = 0;
        let mut outcome = RunOutcome::Completed;
        let mut fault: Option<Fault> = None;

        for (position, &row) in rows.iter().enumerate() {
            if !self.control.checkpoint() {
                outcome = RunOutcome::Cancelled;
                break;
            }
            let values = match self.fetch_row(row) {
                Ok(v) => v,
                Err(f) => {
                    fault = Some(f);
                    outcome = RunOutcome::Fault;
                    break;
                }
            };
            if let Some(a) = &audit {
                a.log_row_start(row, &values);
            }
            self.set_status(row, "processing");
            let row_started = Instant::now();

            let result = self.run_row(&executor, row, &values, session_start);
            match result {
                RunResult::Success => {
                    succeeded += 1;
                    self.set_status(row, "completed");
                    self.finish_row(audit.as_ref(), row, true, row_started, None);
                }
                RunResult::Failed(failure) => {
                    failed += 1;
                    let message = format!("{}: {}", failure.step_name, failure.message);
                    self.set_status(row, &format!("failed: {}", message));
                    self.finish_row(audit.as_ref(), row, false, row_started, Some(&message));
                    if failure.policy == ErrorHandling::Continue {
                        log::warn!("Row {} failed, continuing: {}", row + 1, message);
                    } else {
                        log::error!("Row {} failed, stopping run: {}", row + 1, message);
                        outcome = RunOutcome::StoppedByPolicy;
                        break;
                    }
                }
                RunResult::Cancelled => {
                    // Interrupted rows stay pending.
                    self.set_status(row, "");
                    self.finish_row(audit.as_ref(), row, false, row_started, Some("cancelled"));
                    outcome = RunOutcome::Cancelled;
                    break;
                }
            }
            let _ = self.events.send(ExecutionEvent::Progress {
                current: position + 1,
                total,
            });
            if position + 1 < total && !self.control.sleep(self.row_delay) {
                outcome = RunOutcome::Cancelled;
                break;
            }
        }

        if let Some(f) = &fault {
            let _ = self.events.send(ExecutionEvent::Error {
                category: f.category,
                message: f.message.clone(),
                row: f.row,
                step: None,
            });
            if let Some(a) = &audit {
                a.log_error("ENGINE_FAULT", &f.message, f.row.map(|r| format!("row {}", r)));
            }
        }
        if let Err(e) = self.data.save() {
            log::error!("Saving row statuses failed: {}", e);
            if let Some(a) = &audit {
                a.log_error("DATA_SOURCE", &e.to_string(), None);
            }
        }
        if let Some(a) = &audit {
            a.log_session_end(total, succeeded, failed);
            if a.dropped() > 0 {
                log::warn!("{} audit entries were dropped on a full queue", a.dropped());
            }
        }
        if let Some(s) = session.as_mut() {
            if !s.close() {
                log::warn!("Audit writer did not finish in time");
            }
        }

        let summary = RunSummary {
            total,
            succeeded,
            failed,
            outcome,
            fault: fault.map(|f| f.message),
        };
        log::info!(
            "Run finished: {:?}, {} succeeded, {} failed of {}",
            summary.outcome,
            summary.succeeded,
            summary.failed,
            summary.total
        );
        let _ = self.events.send(ExecutionEvent::Finished(summary.clone()));
        let end_state = match summary.outcome {
            RunOutcome::Fault => ExecutionState::Error,
            _ => ExecutionState::Idle,
        };
        set_state(&self.state, &self.events, end_state);
        summary
    }

    fn target_rows(&self) -> Vec<usize> {
        let total = self.data.total_rows();
        match &self.options.target_rows {
            Some(rows) => rows
                .iter()
                .copied()
                .filter(|&r| {
                    let ok = r < total;
                    if !ok {
                        log::warn!("Skipping row {}: data source has {} rows", r + 1, total);
                    }
                    ok
                })
                .collect(),
            None => self.data.pending_rows(),
        }
    }

    /// Reads a row. A failure goes through EXCEL recovery once before it
    /// becomes a fault.
    fn fetch_row(&mut self, row: usize) -> Result<HashMap<String, String>, Fault> {
        let err = match self.data.get_row(row) {
            Ok(values) => return Ok(values),
            Err(e) => StepError::from_provider(e, ErrorCategory::Excel),
        };
        let context = BTreeMap::from([
            ("row".to_string(), row.to_string()),
            ("source".to_string(), self.data.source_id()),
        ]);
        let remedy = self.recovery.handle(
            &err,
            &self.options.data_recovery,
            ErrorSeverity::Critical,
            context,
        );
        let fault = |message: String| Fault {
            category: err.category,
            message,
            row: Some(row),
        };
        let Some(remedy) = remedy else {
            return Err(fault(err.message.clone()));
        };
        self.data
            .recover(&remedy)
            .and_then(|()| self.data.get_row(row))
            .map_err(|e| fault(format!("{} (after {}: {})", err.message, remedy.name(), e)))
    }

    /// Runs the macro for one row, re-running the whole row while the
    /// failing step's `retry` policy allows.
    fn run_row(
        &self,
        executor: &StepExecutor<'_>,
        row: usize,
        values: &HashMap<String, String>,
        session_start: Instant,
    ) -> RunResult {
        let mut reruns = 0;
        loop {
            let ctx = ExecutionContext::for_row(
                row,
                self.macro_def.variables.clone(),
                values.clone(),
                session_start,
                Arc::clone(&self.control),
            );
            let result = executor.run(&self.macro_def.steps, &ctx);
            match &result {
                RunResult::Failed(f)
                    if f.policy == ErrorHandling::Retry && reruns < f.retry_count =>
                {
                    reruns += 1;
                    log::warn!(
                        "Row {} failed at '{}', re-running row ({}/{})",
                        row + 1,
                        f.step_name,
                        reruns,
                        f.retry_count
                    );
                    if !self.control.sleep(self.retry_delay) {
                        return RunResult::Cancelled;
                    }
                }
                _ => return result,
            }
        }
    }

    fn set_status(&mut self, row: usize, status: &str) {
        if let Err(e) = self.data.update_row_status(row, status) {
            log::warn!("Could not update status of row {}: {}", row + 1, e);
        }
    }

    fn finish_row(
        &self,
        audit: Option<&AuditHandle>,
        row: usize,
        success: bool,
        started: Instant,
        error: Option<&str>,
    ) {
        if let Some(a) = audit {
            a.log_row_complete(row, success, started.elapsed(), error);
        }
        let _ = self.events.send(ExecutionEvent::RowCompleted { row, success });
    }
}
