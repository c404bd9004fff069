//! Screen capture and recognition on the primary monitor.
//!
//! ## DPI scaling
//! - Regions and results are in logical pixels
//! - Captures are in physical pixels
//! - The scale factor is physical capture width / logical monitor width
//!
//! Image search uses NCC template matching. Text search delegates to a
//! pluggable [`TextEngine`].

use super::{Match, RecognitionProvider, TextOptions};
use crate::error::ProviderError;
use crate::step_types::Region;
use image::{GrayImage, RgbaImage};
use imageproc::template_matching::{MatchTemplateMethod, find_extremes, match_template_parallel};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use xcap::Monitor;

const SCALE_RANGE: std::ops::RangeInclusive<f32> = 0.5..=4.0;

/// A piece of text found in an image, with its box in that image's pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognizedText {
    pub bbox: Region,
    pub text: String,
    pub confidence: f64,
}

/// Optical text recognition backend.
pub trait TextEngine: Send + Sync {
    fn recognize(&self, image: &RgbaImage, preprocess: bool)
    -> Result<Vec<RecognizedText>, ProviderError>;
}

/// Physical-pixel crop rectangle inside a capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Crop {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Crop {
    pub fn full(image: &RgbaImage) -> Self {
        Self {
            x: 0,
            y: 0,
            width: image.width(),
            height: image.height(),
        }
    }
}

/// Best NCC match of `template` inside `area` of `screen`.
///
/// Returns the top-left corner (physical pixels, relative to `screen`) and
/// the score when the score reaches `confidence`.
pub fn locate_template(
    screen: &RgbaImage,
    template: &RgbaImage,
    confidence: f64,
    area: Crop,
) -> Option<(u32, u32, f64)> {
    let (tpl_w, tpl_h) = template.dimensions();
    if tpl_w == 0 || tpl_h == 0 {
        return None;
    }
    let x = area.x.min(screen.width().saturating_sub(1));
    let y = area.y.min(screen.height().saturating_sub(1));
    let w = area.width.min(screen.width().saturating_sub(x));
    let h = area.height.min(screen.height().saturating_sub(y));
    if w < tpl_w || h < tpl_h {
        return None;
    }

    let cropped = image::imageops::crop_imm(screen, x, y, w, h).to_image();
    let screen_gray: GrayImage = image::imageops::grayscale(&cropped);
    let template_gray: GrayImage = image::imageops::grayscale(template);

    let result = match_template_parallel(
        &screen_gray,
        &template_gray,
        MatchTemplateMethod::CrossCorrelationNormalized,
    );
    let extremes = find_extremes(&result);
    let score = extremes.max_value as f64;
    if score.is_finite() && score >= confidence {
        let (bx, by) = extremes.max_value_location;
        Some((x + bx, y + by, score))
    } else {
        None
    }
}

struct Screen {
    image: RgbaImage,
    origin: (i32, i32),
    scale: f32,
}

impl Screen {
    /// Logical region to a physical crop of this capture.
    fn crop_for(&self, region: Option<Region>) -> Result<Crop, ProviderError> {
        let Some(r) = region else {
            return Ok(Crop::full(&self.image));
        };
        if r.width == 0 || r.height == 0 {
            return Err(ProviderError::InvalidRegion(r.to_string()));
        }
        let rel_x = r.x - self.origin.0;
        let rel_y = r.y - self.origin.1;
        let phys_x = (rel_x as f32 * self.scale) as i64;
        let phys_y = (rel_y as f32 * self.scale) as i64;
        if phys_x < 0
            || phys_y < 0
            || phys_x >= self.image.width() as i64
            || phys_y >= self.image.height() as i64
        {
            return Err(ProviderError::OutOfBounds(format!(
                "region {} lies outside the primary display",
                r
            )));
        }
        Ok(Crop {
            x: phys_x as u32,
            y: phys_y as u32,
            width: (r.width as f32 * self.scale) as u32,
            height: (r.height as f32 * self.scale) as u32,
        })
    }

    fn to_logical(&self, x: u32, y: u32, w: u32, h: u32) -> Region {
        Region::new(
            self.origin.0 + (x as f32 / self.scale) as i32,
            self.origin.1 + (y as f32 / self.scale) as i32,
            (w as f32 / self.scale) as u32,
            (h as f32 / self.scale) as u32,
        )
    }
}

/// xcap/imageproc-backed recognizer.
pub struct ScreenRecognizer {
    text_engine: Option<Box<dyn TextEngine>>,
    scale_override: Mutex<Option<f32>>,
    templates: Mutex<HashMap<PathBuf, RgbaImage>>,
}

impl Default for ScreenRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScreenRecognizer {
    pub fn new() -> Self {
        Self {
            text_engine: None,
            scale_override: Mutex::new(None),
            templates: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_text_engine(mut self, engine: Box<dyn TextEngine>) -> Self {
        self.text_engine = Some(engine);
        self
    }

    fn capture_screen(&self) -> Result<Screen, ProviderError> {
        let monitors = Monitor::all()
            .map_err(|e| ProviderError::Backend(format!("monitor enumeration failed: {}", e)))?;
        let monitor = monitors
            .first()
            .ok_or_else(|| ProviderError::Backend("no monitor found".to_string()))?;
        let image = monitor
            .capture_image()
            .map_err(|e| ProviderError::Backend(format!("screen capture failed: {}", e)))?;
        let origin = (monitor.x().unwrap_or(0), monitor.y().unwrap_or(0));
        let logical_width = monitor.width().unwrap_or(image.width()).max(1);

        let forced = *self
            .scale_override
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let scale = match forced {
            Some(s) => s,
            None => {
                let detected = image.width() as f32 / logical_width as f32;
                if !SCALE_RANGE.contains(&detected) {
                    return Err(ProviderError::DpiScale(format!(
                        "detected scale {:.2} is outside {:?}",
                        detected, SCALE_RANGE
                    )));
                }
                detected
            }
        };
        Ok(Screen {
            image,
            origin,
            scale,
        })
    }

    fn template(&self, path: &Path) -> Result<RgbaImage, ProviderError> {
        let mut cache = self.templates.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(t) = cache.get(path) {
            return Ok(t.clone());
        }
        if !path.exists() {
            return Err(ProviderError::FileNotFound(path.display().to_string()));
        }
        let template = image::open(path)
            .map_err(|e| {
                ProviderError::Backend(format!("cannot decode {}: {}", path.display(), e))
            })?
            .to_rgba8();
        cache.insert(path.to_path_buf(), template.clone());
        Ok(template)
    }
}

impl RecognitionProvider for ScreenRecognizer {
    fn find_image(
        &self,
        path: &Path,
        confidence: f64,
        region: Option<Region>,
    ) -> Result<Option<Match>, ProviderError> {
        let template = self.template(path)?;
        let screen = self.capture_screen()?;
        let area = screen.crop_for(region)?;
        let found = locate_template(&screen.image, &template, confidence, area);
        log::debug!(
            "find_image {} in {:?}: {:?}",
            path.display(),
            region,
            found.map(|(_, _, s)| s)
        );
        Ok(found.map(|(x, y, score)| {
            Match::from_bbox(
                screen.to_logical(x, y, template.width(), template.height()),
                score,
            )
        }))
    }

    fn find_text(
        &self,
        text: &str,
        region: Option<Region>,
        confidence: f64,
        options: &TextOptions,
    ) -> Result<Option<Match>, ProviderError> {
        let engine = self.text_engine.as_ref().ok_or_else(|| {
            ProviderError::NotInstalled("no text recognition engine configured".to_string())
        })?;
        let screen = self.capture_screen()?;
        let area = screen.crop_for(region)?;
        let cropped =
            image::imageops::crop_imm(&screen.image, area.x, area.y, area.width, area.height)
                .to_image();
        let results = engine.recognize(&cropped, options.preprocess)?;
        let wanted = text.trim().to_lowercase();
        let best = results
            .into_iter()
            .filter(|r| r.confidence >= confidence)
            .filter(|r| {
                let seen = r.text.trim().to_lowercase();
                if options.exact_match {
                    seen == wanted
                } else {
                    seen.contains(&wanted)
                }
            })
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
        Ok(best.map(|r| {
            let bbox = screen.to_logical(
                area.x + r.bbox.x.max(0) as u32,
                area.y + r.bbox.y.max(0) as u32,
                r.bbox.width,
                r.bbox.height,
            );
            Match::from_bbox(bbox, r.confidence)
        }))
    }

    fn capture(&self, region: Option<Region>, path: &Path) -> Result<(), ProviderError> {
        let screen = self.capture_screen()?;
        let area = screen.crop_for(region)?;
        let shot =
            image::imageops::crop_imm(&screen.image, area.x, area.y, area.width, area.height)
                .to_image();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ProviderError::Backend(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        shot.save(path)
            .map_err(|e| ProviderError::Backend(format!("cannot save screenshot: {}", e)))
    }

    fn clear_cache(&self) {
        self.templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn reset_scale(&self) {
        *self
            .scale_override
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(1.0);
        log::info!("DPI scale pinned to 1.0");
    }
}
