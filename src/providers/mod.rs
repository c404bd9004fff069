//! Collaborator contracts consumed by the executor and engine, plus the
//! desktop and tabular implementations shipped with the runner.
//!
//! Providers return [`ProviderError`]; the executor classifies those into
//! step failures.

pub mod automation;
pub mod data;
pub mod desktop;
pub mod image_matching;

use crate::error::ProviderError;
use crate::recovery::Remedy;
use crate::step_types::{MouseButton, Region};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub use data::{CsvDataSource, VecDataSource};
pub use desktop::EnigoInput;
pub use image_matching::{ScreenRecognizer, TextEngine};

/// A located target on screen, in logical pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Match {
    pub bbox: Region,
    pub center: (i32, i32),
    pub confidence: f64,
}

impl Match {
    pub fn from_bbox(bbox: Region, confidence: f64) -> Self {
        let center = (
            bbox.x.saturating_add((bbox.width / 2) as i32),
            bbox.y.saturating_add((bbox.height / 2) as i32),
        );
        Self {
            bbox,
            center,
            confidence,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextOptions {
    pub exact_match: bool,
    /// Set once the `enable_preprocessing` remedy has been applied.
    pub preprocess: bool,
}

pub trait InputProvider: Send + Sync {
    fn move_to(&self, x: i32, y: i32, duration: Duration) -> Result<(), ProviderError>;

    fn click(
        &self,
        x: i32,
        y: i32,
        button: MouseButton,
        count: u32,
        interval: Duration,
    ) -> Result<(), ProviderError>;

    /// Holds `button` from the current position to `(x, y)`.
    fn drag(
        &self,
        x: i32,
        y: i32,
        button: MouseButton,
        duration: Duration,
    ) -> Result<(), ProviderError>;

    /// Turns the vertical wheel by `clicks` notches; positive is up.
    fn scroll(&self, clicks: i32) -> Result<(), ProviderError>;

    fn type_text(&self, text: &str, interval: Duration) -> Result<(), ProviderError>;

    fn hotkey(&self, keys: &[String]) -> Result<(), ProviderError>;

    /// Bounds of the primary display, used by the `use_primary_monitor` remedy.
    fn primary_bounds(&self) -> Option<Region> {
        None
    }
}

/// Image and text matching against the live screen. Calls block until a
/// result is available and must return within a finite time.
pub trait RecognitionProvider: Send + Sync {
    fn find_image(
        &self,
        path: &Path,
        confidence: f64,
        region: Option<Region>,
    ) -> Result<Option<Match>, ProviderError>;

    fn find_text(
        &self,
        text: &str,
        region: Option<Region>,
        confidence: f64,
        options: &TextOptions,
    ) -> Result<Option<Match>, ProviderError>;

    fn capture(&self, region: Option<Region>, path: &Path) -> Result<(), ProviderError>;

    fn clear_cache(&self) {}

    /// Forces the DPI scale back to 1.0.
    fn reset_scale(&self) {}
}

/// Rows of tabular input. Row indices are zero-based.
pub trait DataSource: Send {
    /// Identifies the source in the audit log, usually its path.
    fn source_id(&self) -> String;

    fn total_rows(&self) -> usize;

    fn get_row(&self, index: usize) -> Result<HashMap<String, String>, ProviderError>;

    fn update_row_status(&mut self, index: usize, status: &str) -> Result<(), ProviderError>;

    /// Rows still to process; all rows unless the source tracks status.
    fn pending_rows(&self) -> Vec<usize> {
        (0..self.total_rows()).collect()
    }

    /// Applies a data-source remedy before the failed read is retried.
    fn recover(&mut self, _remedy: &Remedy) -> Result<(), ProviderError> {
        Ok(())
    }

    fn save(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_center_is_middle_of_bbox() {
        let m = Match::from_bbox(Region::new(-100, 20, 40, 10), 0.93);
        assert_eq!(m.center, (-80, 25));
    }
}
