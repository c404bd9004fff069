use macro_runner::audit_log::{AuditLog, SESSION_END, SESSION_START};
use macro_runner::config::Settings;
use macro_runner::error::{EngineError, ProviderError};
use macro_runner::executor::{ExecutionContext, ExecutionEvent, RunControl, RunResult, StepExecutor};
use macro_runner::providers::{
    DataSource, InputProvider, Match, RecognitionProvider, TextOptions, VecDataSource,
};
use macro_runner::recovery::{ErrorCategory, RecoveryHints, RecoveryManager, Remedy};
use macro_runner::step_types::*;
use macro_runner::{ExecutionEngine, ExecutionState, Macro, RunOptions, RunOutcome};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Default)]
struct RecordingInput {
    calls: Mutex<Vec<String>>,
    fail_on: Option<String>,
    delay: Duration,
}

impl RecordingInput {
    fn failing_on(text: &str) -> Self {
        Self {
            fail_on: Some(text.to_string()),
            ..Default::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn typed(&self) -> usize {
        self.calls().iter().filter(|c| c.starts_with("type ")).count()
    }
}

impl InputProvider for RecordingInput {
    fn move_to(&self, x: i32, y: i32, _: Duration) -> Result<(), ProviderError> {
        self.calls.lock().unwrap().push(format!("move {},{}", x, y));
        Ok(())
    }

    fn click(
        &self,
        x: i32,
        y: i32,
        _: MouseButton,
        n: u32,
        _: Duration,
    ) -> Result<(), ProviderError> {
        self.calls.lock().unwrap().push(format!("click {},{} x{}", x, y, n));
        Ok(())
    }

    fn drag(&self, x: i32, y: i32, _: MouseButton, _: Duration) -> Result<(), ProviderError> {
        self.calls.lock().unwrap().push(format!("drag {},{}", x, y));
        Ok(())
    }

    fn scroll(&self, clicks: i32) -> Result<(), ProviderError> {
        self.calls.lock().unwrap().push(format!("scroll {}", clicks));
        Ok(())
    }

    fn type_text(&self, text: &str, _: Duration) -> Result<(), ProviderError> {
        thread::sleep(self.delay);
        self.calls.lock().unwrap().push(format!("type {}", text));
        if self.fail_on.as_deref() == Some(text) {
            return Err(ProviderError::Backend(format!("input refused for '{}'", text)));
        }
        Ok(())
    }

    fn hotkey(&self, keys: &[String]) -> Result<(), ProviderError> {
        self.calls.lock().unwrap().push(format!("hotkey {}", keys.join("+")));
        Ok(())
    }
}

/// Text lookups pop scripted results and then fall back to `text_default`.
#[derive(Default)]
struct ScriptedRecognizer {
    text_results: Mutex<VecDeque<bool>>,
    text_default: bool,
    image_default: bool,
    text_calls: Mutex<Vec<(String, Option<Region>)>>,
}

impl ScriptedRecognizer {
    fn always_finding() -> Self {
        Self {
            text_default: true,
            image_default: true,
            ..Default::default()
        }
    }

    fn text_calls(&self) -> Vec<(String, Option<Region>)> {
        self.text_calls.lock().unwrap().clone()
    }
}

fn hit() -> Match {
    Match::from_bbox(Region::new(90, 40, 20, 20), 0.97)
}

impl RecognitionProvider for ScriptedRecognizer {
    fn find_image(
        &self,
        _: &Path,
        _: f64,
        _: Option<Region>,
    ) -> Result<Option<Match>, ProviderError> {
        Ok(self.image_default.then(hit))
    }

    fn find_text(
        &self,
        text: &str,
        region: Option<Region>,
        _: f64,
        _: &TextOptions,
    ) -> Result<Option<Match>, ProviderError> {
        self.text_calls.lock().unwrap().push((text.to_string(), region));
        let found = self
            .text_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.text_default);
        Ok(found.then(hit))
    }

    fn capture(&self, _: Option<Region>, _: &Path) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Lets the test read row statuses after the engine consumed the source.
#[derive(Clone)]
struct SharedSource(Arc<Mutex<VecDataSource>>);

impl SharedSource {
    fn new(source: VecDataSource) -> Self {
        Self(Arc::new(Mutex::new(source)))
    }

    fn statuses(&self) -> Vec<String> {
        self.0.lock().unwrap().statuses().to_vec()
    }

    fn save_count(&self) -> usize {
        self.0.lock().unwrap().save_count()
    }
}

impl DataSource for SharedSource {
    fn source_id(&self) -> String {
        self.0.lock().unwrap().source_id()
    }

    fn total_rows(&self) -> usize {
        self.0.lock().unwrap().total_rows()
    }

    fn get_row(&self, index: usize) -> Result<HashMap<String, String>, ProviderError> {
        self.0.lock().unwrap().get_row(index)
    }

    fn update_row_status(&mut self, index: usize, status: &str) -> Result<(), ProviderError> {
        self.0.lock().unwrap().update_row_status(index, status)
    }

    fn pending_rows(&self) -> Vec<usize> {
        self.0.lock().unwrap().pending_rows()
    }

    fn save(&mut self) -> Result<(), ProviderError> {
        self.0.lock().unwrap().save()
    }
}

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.execution.row_delay_ms = 0;
    settings.execution.retry_delay_ms = 0;
    settings.execution.wait_poll_ms = 1;
    settings.execution.stop_grace_ms = 2000;
    settings
}

fn engine(input: &Arc<RecordingInput>, recognizer: &Arc<ScriptedRecognizer>) -> ExecutionEngine {
    ExecutionEngine::new(input.clone(), recognizer.clone(), fast_settings())
}

fn typing(text: &str) -> MacroStep {
    MacroStep::new(
        format!("type {}", text),
        StepKind::KeyboardType(KeyboardTypeStep {
            text: text.into(),
            interval: 0.0,
            use_variables: true,
        }),
    )
}

fn wait(seconds: f64) -> MacroStep {
    MacroStep::new("pause", StepKind::WaitTime(WaitTimeStep { seconds }))
}

fn per_row(steps: Vec<MacroStep>) -> MacroStep {
    MacroStep::new(
        "each row",
        StepKind::Loop(LoopStep {
            loop_type: LoopType::ForEachRow,
            loop_count: 1,
            max_iterations: None,
            steps,
        }),
    )
}

fn audited(dir: &Path) -> AuditLog {
    AuditLog::new(dir, 16, Duration::from_secs(5))
}

/// Rows of the only audit file written into `dir`.
fn audit_rows(dir: &Path) -> Vec<csv::StringRecord> {
    let files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1);
    let mut reader = csv::Reader::from_path(&files[0]).unwrap();
    reader.records().map(|r| r.unwrap()).collect()
}

fn text_search(text: &str, region: Option<Region>) -> TextSearchStep {
    TextSearchStep {
        search_text: text.into(),
        excel_column: None,
        region,
        exact_match: false,
        confidence: 0.5,
        click_on_found: false,
        click_offset: (0, 0),
        double_click: false,
        on_found: None,
        on_not_found: None,
    }
}

#[test]
fn row_values_reach_text_search_in_row_order() {
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer::always_finding());
    let mut engine = engine(&input, &recognizer);

    let m = Macro::new("lookup").with_steps(vec![per_row(vec![MacroStep::new(
        "find target",
        StepKind::TextSearch(text_search("${target}", None)),
    )])]);
    let source = SharedSource::new(VecDataSource::from_column("target", &["A", "B", "C"]));
    engine
        .start(m, Box::new(source.clone()), RunOptions::default())
        .unwrap();
    let summary = engine.wait().unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.exit_code(), 0);
    let texts: Vec<String> = recognizer.text_calls().into_iter().map(|(t, _)| t).collect();
    assert_eq!(texts, vec!["A", "B", "C"]);
    assert_eq!(source.statuses(), vec!["completed"; 3]);
    assert_eq!(source.save_count(), 1);
}

#[test]
fn structured_on_found_replaces_legacy_click() {
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer::always_finding());
    let mut engine = engine(&input, &recognizer);

    let step = MacroStep::new(
        "find field",
        StepKind::ImageSearch(ImageSearchStep {
            image_path: "field.png".into(),
            confidence: 0.9,
            region: None,
            click_on_found: true,
            click_offset: (0, 0),
            double_click: false,
            on_found: Some(MatchAction::Type(TypeParams {
                text: "x".into(),
                interval: 0.0,
            })),
            on_not_found: None,
        }),
    );
    let source = VecDataSource::from_column("id", &["1"]);
    engine
        .start(Macro::new("b").with_steps(vec![step]), Box::new(source), RunOptions::default())
        .unwrap();
    engine.wait().unwrap();

    assert_eq!(input.calls(), vec!["type x"]);
}

#[test]
fn full_screen_opt_in_retries_text_search_without_region() {
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let recovery = Arc::new(RecoveryManager::new());
    let mut engine = engine(&input, &recognizer).with_recovery(Arc::clone(&recovery));

    let region = Region::new(100, 100, 300, 200);
    let step = MacroStep::new("confirm", StepKind::TextSearch(text_search("확인", Some(region))))
        .with_recovery(RecoveryHints {
            use_full_screen: true,
            ..Default::default()
        });
    let source = VecDataSource::from_column("id", &["1"]);
    engine
        .start(Macro::new("c").with_steps(vec![step]), Box::new(source), RunOptions::default())
        .unwrap();
    let summary = engine.wait().unwrap();

    assert_eq!(
        recognizer.text_calls(),
        vec![("확인".to_string(), Some(region)), ("확인".to_string(), None)]
    );
    assert_eq!(summary.outcome, RunOutcome::StoppedByPolicy);
    assert_eq!(summary.exit_code(), 2);
    let records = recovery.recent(Some(ErrorCategory::TextSearch), 10);
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| r.category == ErrorCategory::TextSearch));
}

#[test]
fn stop_mid_run_returns_to_idle_without_starting_new_steps() {
    let input = Arc::new(RecordingInput::slow(Duration::from_millis(20)));
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut engine = engine(&input, &recognizer);

    let m = Macro::new("d").with_steps(vec![typing("x"), wait(0.2)]);
    let values: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    let refs: Vec<&str> = values.iter().map(String::as_str).collect();
    let source = SharedSource::new(VecDataSource::from_column("n", &refs));
    engine
        .start(m, Box::new(source.clone()), RunOptions::default())
        .unwrap();
    thread::sleep(Duration::from_millis(150));

    let requested = Instant::now();
    let summary = engine.stop().unwrap().expect("run was in progress");
    assert!(requested.elapsed() < Duration::from_secs(2));
    assert_eq!(engine.state(), ExecutionState::Idle);
    assert_eq!(summary.outcome, RunOutcome::Cancelled);

    let typed = input.typed();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(input.typed(), typed);
    assert!(typed < 20);
    // The interrupted row is left pending.
    assert!(source.statuses().iter().any(String::is_empty));
}

#[test]
fn pause_holds_next_step_until_resume() {
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut engine = engine(&input, &recognizer);

    let m = Macro::new("p").with_steps(vec![typing("{{n}}"), wait(0.05)]);
    let source = VecDataSource::from_column("n", &["1", "2", "3", "4", "5", "6", "7", "8"]);
    engine.start(m, Box::new(source), RunOptions::default()).unwrap();
    thread::sleep(Duration::from_millis(80));

    engine.pause().unwrap();
    assert_eq!(engine.state(), ExecutionState::Paused);
    thread::sleep(Duration::from_millis(150));
    let typed = input.typed();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(input.typed(), typed);
    assert!(typed < 8);

    engine.resume().unwrap();
    let summary = engine.wait().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(input.typed(), 8);
}

#[test]
fn per_row_body_runs_once_per_row() {
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut engine = engine(&input, &recognizer);

    let m = Macro::new("fan out").with_steps(vec![per_row(vec![
        typing("a"),
        typing("b"),
        typing("c"),
    ])]);
    let source = VecDataSource::from_column("n", &["1", "2", "3", "4"]);
    engine.start(m, Box::new(source), RunOptions::default()).unwrap();
    let summary = engine.wait().unwrap();

    assert_eq!(summary.succeeded, 4);
    assert_eq!(input.typed(), 4 * 3);
}

#[test]
fn step_retry_attempts_are_bounded() {
    let input = RecordingInput::failing_on("x");
    let recognizer = ScriptedRecognizer::default();
    let recovery = RecoveryManager::new();
    let exec = StepExecutor::new(&input, &recognizer, &recovery);

    let mut ctx = ExecutionContext::new(Arc::new(RunControl::new()));
    ctx.row_index = Some(0);
    let mut settings = fast_settings();
    settings.execution.retry_delay_ms = 1;
    let exec = exec.with_options((&settings).into());

    let step = typing("x").with_policy(ErrorHandling::Retry, 3);
    let result = exec.run(&[step], &ctx);
    assert!(matches!(result, RunResult::Failed(ref f) if f.retry_count == 3));
    assert_eq!(input.typed(), 4);
    assert_eq!(recovery.len(), 4);
}

#[test]
fn retry_policy_reruns_row_then_stops() {
    let input = Arc::new(RecordingInput::failing_on("x"));
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut engine = engine(&input, &recognizer);

    let m = Macro::new("r").with_steps(vec![typing("x").with_policy(ErrorHandling::Retry, 1)]);
    let source = SharedSource::new(VecDataSource::from_column("n", &["1", "2"]));
    engine
        .start(m, Box::new(source.clone()), RunOptions::default())
        .unwrap();
    let summary = engine.wait().unwrap();

    // Two step attempts per row pass, two row passes.
    assert_eq!(input.typed(), 4);
    assert_eq!(summary.outcome, RunOutcome::StoppedByPolicy);
    assert!(source.statuses()[0].starts_with("failed: "));
    assert_eq!(source.statuses()[1], "");
}

#[test]
fn continue_policy_marks_row_and_moves_on() {
    let input = Arc::new(RecordingInput::failing_on("bad"));
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut engine = engine(&input, &recognizer);

    let m = Macro::new("c").with_steps(vec![
        typing("{{value}}").with_policy(ErrorHandling::Continue, 0),
    ]);
    let source = SharedSource::new(VecDataSource::from_column("value", &["ok", "bad", "fine"]));
    engine
        .start(m, Box::new(source.clone()), RunOptions::default())
        .unwrap();
    let summary = engine.wait().unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!((summary.succeeded, summary.failed), (2, 1));
    let statuses = source.statuses();
    assert_eq!(statuses[0], "completed");
    assert!(statuses[1].starts_with("failed: ") && statuses[1].contains("input refused"));
    assert_eq!(statuses[2], "completed");
}

#[test]
fn stop_policy_ends_the_run() {
    let input = Arc::new(RecordingInput::failing_on("bad"));
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut engine = engine(&input, &recognizer);

    let m = Macro::new("s").with_steps(vec![typing("{{value}}")]);
    let source = SharedSource::new(VecDataSource::from_column("value", &["ok", "bad", "fine"]));
    engine
        .start(m, Box::new(source.clone()), RunOptions::default())
        .unwrap();
    let summary = engine.wait().unwrap();

    assert_eq!(summary.outcome, RunOutcome::StoppedByPolicy);
    assert_eq!(input.typed(), 2);
    assert_eq!(source.statuses()[2], "");
}

#[test]
fn target_rows_run_in_given_order() {
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut engine = engine(&input, &recognizer);

    let m = Macro::new("t").with_steps(vec![typing("{{v}}")]);
    let source = VecDataSource::from_column("v", &["A", "B", "C"]);
    let options = RunOptions {
        target_rows: Some(vec![2, 0, 9]),
        ..Default::default()
    };
    engine.start(m, Box::new(source), options).unwrap();
    let summary = engine.wait().unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(input.calls(), vec!["type C", "type A"]);
}

#[test]
fn macro_variables_fill_in_for_missing_columns() {
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut engine = engine(&input, &recognizer);

    let m = Macro::new("v")
        .with_variable("greeting", "hello")
        .with_variable("name", "nobody")
        .with_steps(vec![typing("{{greeting}} {{name}}")]);
    let source = VecDataSource::from_column("name", &["Kim"]);
    engine.start(m, Box::new(source), RunOptions::default()).unwrap();
    engine.wait().unwrap();

    assert_eq!(input.calls(), vec!["type hello Kim"]);
}

#[test]
fn invalid_macro_is_rejected_before_running() {
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut engine = engine(&input, &recognizer);

    let m = Macro::new("dup").with_steps(vec![
        typing("a").with_id("same"),
        typing("b").with_id("same"),
    ]);
    let err = engine
        .start(m, Box::new(VecDataSource::from_column("n", &["1"])), RunOptions::default())
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidMacro(_)));
    assert!(err.to_string().contains("duplicate step_id 'same'"));
    assert_eq!(engine.state(), ExecutionState::Idle);
    assert!(input.calls().is_empty());
}

#[test]
fn lifecycle_calls_are_checked_against_state() {
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut engine = engine(&input, &recognizer);

    assert!(matches!(engine.pause(), Err(EngineError::InvalidState { action: "pause", .. })));
    assert!(matches!(engine.resume(), Err(EngineError::InvalidState { .. })));
    assert!(matches!(engine.wait(), Err(EngineError::InvalidState { .. })));
    assert_eq!(engine.stop().unwrap(), None);
}

#[test]
fn unreadable_row_is_an_engine_fault() {
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut engine = engine(&input, &recognizer);
    let events = engine.events();

    let source = VecDataSource::from_column("n", &["1", "2", "3"])
        .with_failing_row(1, ProviderError::Backend("sheet vanished".into()));
    let m = Macro::new("f").with_steps(vec![typing("{{n}}")]);
    engine.start(m, Box::new(source), RunOptions::default()).unwrap();
    let summary = engine.wait().unwrap();

    assert_eq!(summary.outcome, RunOutcome::Fault);
    assert_eq!(summary.exit_code(), 3);
    assert!(summary.fault.as_deref().unwrap().contains("sheet vanished"));
    assert_eq!(input.calls(), vec!["type 1"]);
    assert_eq!(engine.state(), ExecutionState::Idle);

    let seen: Vec<ExecutionEvent> = events.try_iter().collect();
    assert!(seen.iter().any(|e| matches!(
        e,
        ExecutionEvent::Error { category: ErrorCategory::Excel, row: Some(1), .. }
    )));
    assert!(seen.iter().any(|e| matches!(e, ExecutionEvent::StateChanged(ExecutionState::Error))));
}

#[test]
fn lossy_recovery_is_attempted_for_unreadable_rows() {
    struct FlakySource {
        recovered: bool,
    }

    impl DataSource for FlakySource {
        fn source_id(&self) -> String {
            "flaky".into()
        }
        fn total_rows(&self) -> usize {
            1
        }
        fn get_row(&self, _: usize) -> Result<HashMap<String, String>, ProviderError> {
            if self.recovered {
                Ok(HashMap::from([("v".to_string(), "ok".to_string())]))
            } else {
                Err(ProviderError::Backend("cannot decode cell (encoding)".into()))
            }
        }
        fn update_row_status(&mut self, _: usize, _: &str) -> Result<(), ProviderError> {
            Ok(())
        }
        fn recover(&mut self, remedy: &Remedy) -> Result<(), ProviderError> {
            self.recovered = *remedy == Remedy::RetryWithAlternateEncoding;
            Ok(())
        }
    }

    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut engine = engine(&input, &recognizer);
    let options = RunOptions {
        data_recovery: RecoveryHints {
            retry_with_encoding: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let m = Macro::new("l").with_steps(vec![typing("{{v}}")]);
    engine
        .start(m, Box::new(FlakySource { recovered: false }), options)
        .unwrap();
    let summary = engine.wait().unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(input.calls(), vec!["type ok"]);
}

#[test]
fn events_report_progress_and_finish() {
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut engine = engine(&input, &recognizer);
    let events = engine.events();

    let m = Macro::new("e").with_steps(vec![typing("x")]);
    engine
        .start(m, Box::new(VecDataSource::from_column("n", &["1", "2"])), RunOptions::default())
        .unwrap();
    let summary = engine.wait().unwrap();

    let seen: Vec<ExecutionEvent> = events.try_iter().collect();
    let progress: Vec<(usize, usize)> = seen
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::Progress { current, total } => Some((*current, *total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(1, 2), (2, 2)]);
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, ExecutionEvent::StepStarted { .. }))
            .count(),
        2
    );
    assert!(matches!(seen.last(), Some(ExecutionEvent::StateChanged(ExecutionState::Idle))));
    assert!(seen.iter().any(|e| matches!(e, ExecutionEvent::Finished(s) if *s == summary)));
}

#[test]
fn audit_session_brackets_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut engine = engine(&input, &recognizer).with_audit_log(AuditLog::new(
        dir.path(),
        16,
        Duration::from_secs(5),
    ));

    let m = Macro::new("audited").with_steps(vec![typing("{{n}}"), typing("done")]);
    engine
        .start(m, Box::new(VecDataSource::from_column("n", &["1", "2"])), RunOptions::default())
        .unwrap();
    engine.wait().unwrap();

    let files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1);
    let mut reader = csv::Reader::from_path(&files[0]).unwrap();
    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();

    assert_eq!(&rows[0][5], SESSION_START);
    assert_eq!(&rows[rows.len() - 1][5], SESSION_END);
    // start + per row (start, 2 steps, complete) + end
    assert_eq!(rows.len(), 1 + 2 * 4 + 1);
    let step_rows: Vec<_> = rows.iter().filter(|r| &r[6] == "keyboard_type").collect();
    assert_eq!(step_rows.len(), 4);
    assert!(step_rows.iter().all(|r| &r[7] == "SUCCESS"));
}

#[test]
fn recovered_attempt_leaves_a_failed_audit_row() {
    let dir = tempfile::tempdir().unwrap();
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer {
        text_results: Mutex::new(VecDeque::from([false, true])),
        ..Default::default()
    });
    let mut engine = engine(&input, &recognizer).with_audit_log(audited(dir.path()));

    let region = Region::new(100, 100, 300, 200);
    let step = MacroStep::new("confirm", StepKind::TextSearch(text_search("OK", Some(region))))
        .with_recovery(RecoveryHints {
            use_full_screen: true,
            ..Default::default()
        });
    engine
        .start(
            Macro::new("recovering").with_steps(vec![step]),
            Box::new(VecDataSource::from_column("id", &["1"])),
            RunOptions::default(),
        )
        .unwrap();
    assert_eq!(engine.wait().unwrap().outcome, RunOutcome::Completed);

    let rows = audit_rows(dir.path());
    let confirm: Vec<_> = rows.iter().filter(|r| &r[5] == "confirm").collect();
    assert_eq!(confirm.len(), 2);
    assert_eq!(&confirm[0][7], "FAILED");
    assert_eq!(&confirm[0][6], "text_search");
    assert!(confirm[0][8].contains("search region"));
    assert!(confirm[0][10].contains("attempt 1/1; remedy: use_full_screen"));
    assert_eq!(&confirm[1][7], "SUCCESS");
}

#[test]
fn masked_search_text_stays_out_of_audit_details() {
    let dir = tempfile::tempdir().unwrap();
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer {
        text_results: Mutex::new(VecDeque::from([false])),
        text_default: true,
        ..Default::default()
    });
    let mut engine = engine(&input, &recognizer).with_audit_log(audited(dir.path()));

    let step = MacroStep::new(
        "find account",
        StepKind::DynamicTextSearch(DynamicTextSearchStep {
            search_text: "${account}".into(),
            search_region: None,
            confidence_threshold: 0.7,
            click_on_found: false,
            click_offset: (0, 0),
            double_click: false,
            fail_if_not_found: true,
            mask_in_logs: true,
            on_found: None,
            on_not_found: None,
        }),
    )
    .with_policy(ErrorHandling::Retry, 1);
    engine
        .start(
            Macro::new("masked").with_steps(vec![step]),
            Box::new(VecDataSource::from_column("account", &["SECRET-123"])),
            RunOptions::default(),
        )
        .unwrap();
    assert_eq!(engine.wait().unwrap().outcome, RunOutcome::Completed);
    assert_eq!(recognizer.text_calls()[0].0, "SECRET-123");

    let rows = audit_rows(dir.path());
    let step_rows: Vec<_> = rows.iter().filter(|r| &r[5] == "find account").collect();
    assert_eq!(step_rows.len(), 2);
    assert!(step_rows.iter().all(|r| r[10].contains("text: [MASKED]")));
    assert!(step_rows[0][8].contains("[MASKED]"));
    for row in &rows {
        assert!(!row[8].contains("SECRET-123"));
        assert!(!row[10].contains("SECRET-123"));
    }
}

#[test]
fn pause_holds_count_loop_between_iterations() {
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut engine = engine(&input, &recognizer);

    let repeat = MacroStep::new(
        "repeat",
        StepKind::Loop(LoopStep {
            loop_type: LoopType::Count,
            loop_count: 10,
            max_iterations: None,
            steps: vec![typing("tick"), wait(0.03)],
        }),
    );
    engine
        .start(
            Macro::new("ticks").with_steps(vec![repeat]),
            Box::new(VecDataSource::from_column("id", &["1"])),
            RunOptions::default(),
        )
        .unwrap();
    thread::sleep(Duration::from_millis(80));

    engine.pause().unwrap();
    thread::sleep(Duration::from_millis(100));
    let typed = input.typed();
    thread::sleep(Duration::from_millis(250));
    assert_eq!(input.typed(), typed);
    assert!(typed < 10);

    engine.resume().unwrap();
    assert_eq!(engine.wait().unwrap().outcome, RunOutcome::Completed);
    assert_eq!(input.typed(), 10);
}

#[test]
fn wait_image_timeout_is_doubled_once_when_opted_in() {
    let dir = tempfile::tempdir().unwrap();
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let recovery = Arc::new(RecoveryManager::new());
    let mut engine = engine(&input, &recognizer)
        .with_audit_log(audited(dir.path()))
        .with_recovery(Arc::clone(&recovery));

    let step = MacroStep::new(
        "dialog",
        StepKind::WaitImage(WaitImageStep {
            image_path: "dialog.png".into(),
            timeout: 0.1,
            confidence: 0.9,
            region: None,
        }),
    )
    .with_recovery(RecoveryHints {
        increase_timeout: true,
        ..Default::default()
    });
    let started = Instant::now();
    engine
        .start(
            Macro::new("waiting").with_steps(vec![step]),
            Box::new(VecDataSource::from_column("id", &["1"])),
            RunOptions::default(),
        )
        .unwrap();
    let summary = engine.wait().unwrap();
    let elapsed = started.elapsed();

    assert_eq!(summary.outcome, RunOutcome::StoppedByPolicy);
    // 0.1s, then one remedial attempt at 0.2s.
    assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "{:?}", elapsed);

    let rows = audit_rows(dir.path());
    let attempts: Vec<_> = rows.iter().filter(|r| &r[5] == "dialog").collect();
    assert_eq!(attempts.len(), 3);
    assert!(attempts[0][8].contains("after 0.1s"));
    assert!(attempts[0][10].contains("remedy: increase_timeout"));
    assert!(attempts[1][8].contains("after 0.2s"));
    assert!(attempts[1][10].contains("remedial attempt"));
    assert!(attempts.iter().all(|r| &r[7] == "FAILED"));
    assert!(recovery.recent(Some(ErrorCategory::Execution), 10).len() >= 2);
}

#[test]
fn drag_and_scroll_steps_run_in_order() {
    let input = Arc::new(RecordingInput::default());
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let mut engine = engine(&input, &recognizer);

    let m = Macro::new("gestures").with_steps(vec![
        MacroStep::new(
            "drag",
            StepKind::MouseDrag(MouseDragStep {
                x: 40,
                y: 50,
                button: MouseButton::Left,
                duration: 0.0,
            }),
        ),
        MacroStep::new(
            "wheel",
            StepKind::MouseScroll(MouseScrollStep {
                clicks: -5,
                x: None,
                y: None,
            }),
        ),
    ]);
    engine
        .start(m, Box::new(VecDataSource::from_column("id", &["1", "2"])), RunOptions::default())
        .unwrap();
    assert_eq!(engine.wait().unwrap().outcome, RunOutcome::Completed);
    assert_eq!(
        input.calls(),
        vec!["drag 40,50", "scroll -5", "drag 40,50", "scroll -5"]
    );
}
