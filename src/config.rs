//! Runner settings, read from `settings.json`.
//!
//! Every field has a default, so a missing or partial file is fine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "MACRO_RUNNER_CONFIG";
const DATA_DIR_NAME: &str = ".excel_macro_automation";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub execution: ExecutionSettings,
    pub hotkeys: HotkeySettings,
    pub paths: PathSettings,
    pub audit: AuditSettings,
    pub data_source: DataSourceSettings,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutionSettings {
    pub row_delay_ms: u64,
    pub retry_delay_ms: u64,
    pub stop_grace_ms: u64,
    pub while_image_max_iterations: u32,
    pub wait_poll_ms: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            row_delay_ms: 100,
            retry_delay_ms: 1000,
            stop_grace_ms: 5000,
            while_image_max_iterations: 100,
            wait_poll_ms: 500,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HotkeySettings {
    pub pause: String,
    pub stop: String,
}

impl Default for HotkeySettings {
    fn default() -> Self {
        Self {
            pause: "F9".to_string(),
            stop: "Escape".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct PathSettings {
    pub data_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub screenshot_dir: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AuditSettings {
    pub queue_capacity: usize,
    pub close_timeout_ms: u64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            close_timeout_ms: 5000,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DataSourceSettings {
    pub status_column: String,
    pub delimiter: char,
}

impl Default for DataSourceSettings {
    fn default() -> Self {
        Self {
            status_column: "status".to_string(),
            delimiter: ',',
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIR_NAME)
}

impl Settings {
    /// Resolves the settings file: explicit path, then `$MACRO_RUNNER_CONFIG`,
    /// then `<data_dir>/settings.json`. Falls back to defaults when none exists.
    pub fn load(explicit: Option<&Path>) -> Result<Settings> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }
        let default_path = default_data_dir().join("settings.json");
        if default_path.exists() {
            return Self::from_file(&default_path);
        }
        log::debug!("No settings file found; using defaults");
        Ok(Settings::default())
    }

    pub fn from_file(path: &Path) -> Result<Settings> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&json)
            .with_context(|| format!("failed to parse settings file {}", path.display()))?;
        log::info!("Settings loaded from {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
            .with_context(|| format!("failed to write settings file {}", path.display()))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.paths.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.paths
            .log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("execution_logs"))
    }

    /// Where saved macros are listed from.
    pub fn macro_dir(&self) -> PathBuf {
        self.data_dir().join("macros")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.macro_dir().join("backups")
    }

    pub fn screenshot_dir(&self) -> PathBuf {
        self.paths
            .screenshot_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("screenshots"))
    }

    pub fn key_file(&self) -> PathBuf {
        self.paths
            .key_file
            .clone()
            .unwrap_or_else(|| self.data_dir().join(".key"))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.execution.retry_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.execution.stop_grace_ms)
    }

    pub fn row_delay(&self) -> Duration {
        Duration::from_millis(self.execution.row_delay_ms)
    }

    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.execution.wait_poll_ms.max(1))
    }

    pub fn audit_close_timeout(&self) -> Duration {
        Duration::from_millis(self.audit.close_timeout_ms)
    }
}
