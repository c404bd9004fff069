use anyhow::{Context, Result};
use clap::Parser;
use clap::builder::RangedU64ValueParser;
use crossbeam_channel::{Receiver, never, select};
use macro_runner::audit_log::AuditLog;
use macro_runner::error::{EngineError, StepError};
use macro_runner::executor::ExecutionEvent;
use macro_runner::hotkeys::{self, ControlCommand, HotkeyBindings};
use macro_runner::providers::{CsvDataSource, DataSource, EnigoInput, ScreenRecognizer};
use macro_runner::recovery::{
    ErrorCategory, ErrorSeverity, RecoveryHints, RecoveryManager, Remedy,
};
use macro_runner::{ExecutionEngine, ExecutionState, RunOptions, RunSummary, Settings, storage};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

/// Runs a recorded desktop macro once per row of a CSV file.
#[derive(Parser, Debug)]
#[command(name = "macro-runner", version)]
struct Cli {
    /// Macro file (.json, or .emf/.emacro when encrypted)
    macro_path: PathBuf,

    /// CSV file whose rows feed the macro variables
    data_source_path: PathBuf,

    /// Settings file to use instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,

    /// 1-based rows to run, e.g. "1,3,5"
    #[arg(
        long,
        value_delimiter = ',',
        conflicts_with = "all_rows",
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    rows: Option<Vec<usize>>,

    /// Run every row, including ones that already have a status
    #[arg(long)]
    all_rows: bool,

    /// Do not install the global pause/stop hotkeys
    #[arg(long)]
    no_hotkeys: bool,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    let settings = Settings::load(cli.config.as_deref())?;
    let macro_def = storage::load_macro(&cli.macro_path, &settings.key_file())
        .with_context(|| format!("failed to load macro {}", cli.macro_path.display()))?;

    let recovery = Arc::new(RecoveryManager::new());
    let data = match open_data_source(&cli.data_source_path, &settings, &recovery) {
        Ok(data) => data,
        Err(e) => {
            log::error!("{:#}", e);
            return Ok(3);
        }
    };
    let target_rows = if cli.all_rows {
        Some((0..data.total_rows()).collect())
    } else {
        cli.rows.map(|rows| rows.into_iter().map(|r| r - 1).collect())
    };

    let commands = if cli.no_hotkeys {
        never()
    } else {
        let bindings = HotkeyBindings::from_settings(&settings.hotkeys)?;
        log::info!(
            "Hotkeys: {:?} pause/resume, {:?} stop",
            bindings.pause,
            bindings.stop
        );
        hotkeys::spawn_listener(bindings).context("failed to start hotkey listener")?
    };

    let audit = AuditLog::new(
        settings.log_dir(),
        settings.audit.queue_capacity,
        settings.audit_close_timeout(),
    );
    let mut engine = ExecutionEngine::new(
        Arc::new(EnigoInput::new()),
        Arc::new(ScreenRecognizer::new()),
        settings,
    )
    .with_audit_log(audit)
    .with_recovery(Arc::clone(&recovery));

    let options = RunOptions {
        target_rows,
        ..Default::default()
    };
    match engine.start(macro_def, Box::new(data), options) {
        Ok(()) => {}
        Err(EngineError::InvalidMacro(e)) => {
            log::error!("{}", e);
            return Ok(1);
        }
        Err(e) => {
            log::error!("{}", e);
            return Ok(3);
        }
    }

    let summary = drive(&mut engine, commands);
    log::info!("Errors: {}", recovery.summary());
    Ok(match summary {
        Some(s) => report(&s),
        None => 3,
    })
}

/// Opens the CSV, falling back to a lossy decode when the file is not UTF-8.
fn open_data_source(
    path: &Path,
    settings: &Settings,
    recovery: &RecoveryManager,
) -> Result<CsvDataSource> {
    let err = match CsvDataSource::open(path, &settings.data_source) {
        Ok(source) => return Ok(source),
        Err(e) => e,
    };
    let hints = RecoveryHints {
        retry_with_encoding: true,
        ..Default::default()
    };
    let context = BTreeMap::from([("path".to_string(), path.display().to_string())]);
    let classified = StepError::from_provider(err.clone(), ErrorCategory::Excel);
    match recovery.handle(&classified, &hints, ErrorSeverity::Error, context) {
        Some(Remedy::RetryWithAlternateEncoding) => {
            log::warn!("{}; reading with replacement characters", err);
            CsvDataSource::open_lossy(path, &settings.data_source)
                .with_context(|| format!("failed to open data source {}", path.display()))
        }
        _ => Err(err).with_context(|| format!("failed to open data source {}", path.display())),
    }
}

/// Forwards hotkey commands to the engine until the run finishes.
fn drive(
    engine: &mut ExecutionEngine,
    mut commands: Receiver<ControlCommand>,
) -> Option<RunSummary> {
    let events = engine.events();
    loop {
        let listener = commands.clone();
        select! {
            recv(listener) -> command => match command {
                Ok(ControlCommand::TogglePause) => {
                    let toggled = if engine.state() == ExecutionState::Paused {
                        engine.resume()
                    } else {
                        engine.pause()
                    };
                    if let Err(e) = toggled {
                        log::warn!("{}", e);
                    }
                }
                Ok(ControlCommand::Stop) => match engine.stop() {
                    Ok(Some(summary)) => return Some(summary),
                    Ok(None) => {}
                    Err(e) => {
                        log::error!("{}", e);
                        return None;
                    }
                },
                Err(_) => commands = never(),
            },
            recv(events) -> event => match event {
                Ok(ExecutionEvent::Progress { current, total }) => {
                    log::info!("Progress: {}/{}", current, total);
                }
                Ok(ExecutionEvent::Error { category, message, row, .. }) => {
                    log::warn!("[{}] row {:?}: {}", category, row.map(|r| r + 1), message);
                }
                Ok(ExecutionEvent::Finished(_)) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }
    match engine.wait() {
        Ok(summary) => Some(summary),
        Err(e) => {
            log::error!("{}", e);
            None
        }
    }
}

fn report(summary: &RunSummary) -> u8 {
    log::info!(
        "{:?}: {} of {} rows succeeded, {} failed",
        summary.outcome,
        summary.succeeded,
        summary.total,
        summary.failed
    );
    if let Some(fault) = &summary.fault {
        log::error!("{}", fault);
    }
    u8::try_from(summary.exit_code()).unwrap_or(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_one_based_and_positive() {
        let parse = |extra: &[&str]| {
            let mut args = vec!["macro-runner", "m.json", "d.csv"];
            args.extend_from_slice(extra);
            Cli::try_parse_from(args)
        };
        assert_eq!(parse(&["--rows", "1,3"]).unwrap().rows, Some(vec![1, 3]));
        assert!(parse(&["--rows", "0"]).is_err());
        assert!(parse(&["--rows", "2", "--all-rows"]).is_err());
    }

    #[test]
    fn unreadable_data_source_exits_with_runtime_code() {
        let dir = tempfile::tempdir().unwrap();
        let macro_path = dir.path().join("m.json");
        storage::save_plain(&macro_runner::Macro::new("m"), &macro_path).unwrap();
        let config = dir.path().join("settings.json");
        let mut settings = Settings::default();
        settings.paths.data_dir = Some(dir.path().to_path_buf());
        settings.save(&config).unwrap();

        let args: Vec<std::ffi::OsString> = vec![
            "macro-runner".into(),
            macro_path.into(),
            dir.path().join("missing.csv").into(),
            "--no-hotkeys".into(),
            "--config".into(),
            config.into(),
        ];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(run(cli).unwrap(), 3);
    }
}

