//! Per-row execution state and the cross-thread run control.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep inside a wait.
pub const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cancellation flag and pause gate shared between the controller and the
/// execution thread. Both are only observed at checkpoints.
#[derive(Default)]
pub struct RunControl {
    cancelled: AtomicBool,
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Wake a paused execution thread so it can observe the cancel.
        let _guard = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        self.resumed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    pub fn resume(&self) {
        let mut paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        *paused = false;
        self.resumed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks while paused. Returns `false` once the run is cancelled.
    pub fn checkpoint(&self) -> bool {
        let mut paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        while *paused && !self.is_cancelled() {
            paused = self
                .resumed
                .wait(paused)
                .unwrap_or_else(PoisonError::into_inner);
        }
        !self.is_cancelled()
    }

    /// Sleeps for `duration` in short slices. Returns `false` if cancelled meanwhile.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// State for one row's walk of the step tree.
pub struct ExecutionContext {
    pub row_index: Option<usize>,
    /// Row values merged over macro variables; the row wins.
    pub variables: HashMap<String, String>,
    pub session_start: Instant,
    pub control: std::sync::Arc<RunControl>,
}

impl ExecutionContext {
    pub fn new(control: std::sync::Arc<RunControl>) -> Self {
        Self {
            row_index: None,
            variables: HashMap::new(),
            session_start: Instant::now(),
            control,
        }
    }

    pub fn for_row(
        row_index: usize,
        defaults: impl IntoIterator<Item = (String, String)>,
        row: HashMap<String, String>,
        session_start: Instant,
        control: std::sync::Arc<RunControl>,
    ) -> Self {
        let mut variables: HashMap<String, String> = defaults.into_iter().collect();
        variables.extend(row);
        Self {
            row_index: Some(row_index),
            variables,
            session_start,
            control,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.session_start.elapsed()
    }

    pub fn substitute(&self, text: &str) -> String {
        crate::substitution::substitute(text, &self.variables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn row_values_override_macro_defaults() {
        let ctx = ExecutionContext::for_row(
            2,
            [("a".to_string(), "macro".to_string()), ("b".to_string(), "keep".to_string())],
            HashMap::from([("a".to_string(), "row".to_string())]),
            Instant::now(),
            Arc::new(RunControl::new()),
        );
        assert_eq!(ctx.variables["a"], "row");
        assert_eq!(ctx.variables["b"], "keep");
        assert_eq!(ctx.substitute("{{a}}-{{b}}"), "row-keep");
    }

    #[test]
    fn cancelled_sleep_returns_early() {
        let control = Arc::new(RunControl::new());
        let c = control.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            c.cancel();
        });
        let start = Instant::now();
        assert!(!control.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn checkpoint_blocks_until_resume() {
        let control = Arc::new(RunControl::new());
        control.pause();
        let c = control.clone();
        let handle = std::thread::spawn(move || c.checkpoint());
        std::thread::sleep(Duration::from_millis(100));
        assert!(!handle.is_finished());
        control.resume();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn cancel_releases_paused_checkpoint() {
        let control = Arc::new(RunControl::new());
        control.pause();
        let c = control.clone();
        let handle = std::thread::spawn(move || c.checkpoint());
        std::thread::sleep(Duration::from_millis(50));
        control.cancel();
        assert!(!handle.join().unwrap());
    }
}
