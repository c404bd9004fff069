//! Image and text search handlers and their match follow-up actions.

use super::{DOUBLE_CLICK_INTERVAL, HitFlag, StepExecutor, input_err, secs};
use crate::error::StepError;
use crate::executor::ExecutionContext;
use crate::providers::{Match, TextOptions};
use crate::recovery::{ErrorCategory, Remedy};
use crate::step_types::{
    DynamicTextSearchStep, ImageSearchStep, MatchAction, MouseButton, PointerParams, Region,
    TextSearchStep, WaitImageStep,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const MASK: &str = "[MASKED]";

/// What to do with a search result.
struct Followup<'s> {
    category: ErrorCategory,
    click_on_found: bool,
    click_offset: (i32, i32),
    double_click: bool,
    on_found: Option<&'s MatchAction>,
    on_not_found: Option<&'s MatchAction>,
    fail_if_not_found: bool,
}

fn not_found_message(shown: &str, region: Option<Region>) -> String {
    match region {
        Some(r) => format!("no text matching '{}' found in search region {}", shown, r),
        None => format!("no text matching '{}' found", shown),
    }
}

fn lowered_confidence(base: f64, remedies: &[Remedy]) -> f64 {
    if remedies.contains(&Remedy::LowerConfidence) {
        (base - 0.1).max(0.5).min(base)
    } else {
        base
    }
}

impl StepExecutor<'_> {
    /// Image path after substitution, or a same-named file from the
    /// alternate search paths once that remedy applies.
    fn image_target(&self, raw: &str, ctx: &ExecutionContext, remedies: &[Remedy]) -> PathBuf {
        let path = PathBuf::from(ctx.substitute(raw));
        if path.exists() {
            return path;
        }
        let Some(name) = path.file_name() else {
            return path;
        };
        for remedy in remedies {
            if let Remedy::TryAlternatePaths(dirs) = remedy {
                if let Some(found) = dirs
                    .iter()
                    .map(|d| Path::new(d).join(name))
                    .find(|c| c.exists())
                {
                    log::info!("Using alternate image path {}", found.display());
                    return found;
                }
            }
        }
        path
    }

    fn search_region(&self, region: Option<Region>, remedies: &[Remedy]) -> Option<Region> {
        if remedies.contains(&Remedy::WidenToFullScreen) {
            return None;
        }
        if remedies.contains(&Remedy::UsePrimaryMonitor) {
            return self.input.primary_bounds().or(region);
        }
        region
    }

    pub(super) fn image_search(
        &self,
        s: &ImageSearchStep,
        ctx: &ExecutionContext,
        remedies: &[Remedy],
        hit_flag: HitFlag<'_>,
    ) -> Result<(), StepError> {
        let path = self.image_target(&s.image_path, ctx, remedies);
        let confidence = lowered_confidence(s.confidence, remedies);
        let region = self.search_region(s.region, remedies);
        let found = self
            .recognizer
            .find_image(&path, confidence, region)
            .map_err(|e| StepError::from_provider(e, ErrorCategory::ImageSearch))?;
        let followup = Followup {
            category: ErrorCategory::ImageSearch,
            click_on_found: s.click_on_found,
            click_offset: s.click_offset,
            double_click: s.double_click,
            on_found: s.on_found.as_ref(),
            on_not_found: s.on_not_found.as_ref(),
            fail_if_not_found: true,
        };
        match found {
            Some(m) => {
                log::info!(
                    "Image {} found at {:?} ({:.2})",
                    path.display(),
                    m.center,
                    m.confidence
                );
                if let Some(p) = hit_flag {
                    p.set(true);
                }
                self.found(&m, &followup, ctx)
            }
            None => self.missed(
                &followup,
                ctx,
                format!(
                    "image '{}' not found on screen (confidence {:.2})",
                    path.display(),
                    confidence
                ),
                hit_flag,
            ),
        }
    }

    pub(super) fn wait_image(
        &self,
        s: &WaitImageStep,
        ctx: &ExecutionContext,
        remedies: &[Remedy],
        hit_flag: HitFlag<'_>,
    ) -> Result<(), StepError> {
        let path = self.image_target(&s.image_path, ctx, remedies);
        let confidence = lowered_confidence(s.confidence, remedies);
        let region = self.search_region(s.region, remedies);
        let mut timeout = secs(s.timeout);
        if remedies.contains(&Remedy::IncreaseTimeout) {
            timeout = timeout.saturating_mul(2);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let found = self
                .recognizer
                .find_image(&path, confidence, region)
                .map_err(|e| StepError::from_provider(e, ErrorCategory::ImageSearch))?;
            if found.is_some() {
                if let Some(p) = hit_flag {
                    p.set(true);
                }
                log::info!("Image {} appeared", path.display());
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let pause = self.options.wait_poll.min(deadline - now);
            if !ctx.control.sleep(pause) {
                return Err(StepError::new(
                    ErrorCategory::Execution,
                    "wait interrupted by stop request",
                ));
            }
        }
        if hit_flag.is_some() {
            log::debug!("Image {} did not appear; loop continues", path.display());
            return Ok(());
        }
        Err(StepError::new(
            ErrorCategory::Execution,
            format!(
                "timeout waiting for image '{}' after {:.1}s",
                path.display(),
                timeout.as_secs_f64()
            ),
        ))
    }

    fn text_target(&self, s: &TextSearchStep, ctx: &ExecutionContext) -> Result<String, StepError> {
        let target = if !s.search_text.trim().is_empty() {
            ctx.substitute(&s.search_text)
        } else if let Some(column) = &s.excel_column {
            match ctx.variables.get(column) {
                Some(value) => value.clone(),
                None => {
                    let mut available: Vec<&str> =
                        ctx.variables.keys().map(String::as_str).collect();
                    available.sort_unstable();
                    return Err(StepError::new(
                        ErrorCategory::TextSearch,
                        format!(
                            "column '{}' not found in row data; available columns: {}",
                            column,
                            available.join(", ")
                        ),
                    ));
                }
            }
        } else {
            String::new()
        };
        if target.trim().is_empty() {
            return Err(StepError::new(
                ErrorCategory::TextSearch,
                "search text resolved to an empty string",
            ));
        }
        Ok(target)
    }

    pub(super) fn text_search(
        &self,
        s: &TextSearchStep,
        ctx: &ExecutionContext,
        remedies: &[Remedy],
        hit_flag: HitFlag<'_>,
    ) -> Result<(), StepError> {
        let target = self.text_target(s, ctx)?;
        let region = self.search_region(s.region, remedies);
        let options = TextOptions {
            exact_match: s.exact_match,
            preprocess: remedies.contains(&Remedy::EnablePreprocessing),
        };
        log::info!("Searching text '{}' in {:?}", target, region);
        let found = self
            .recognizer
            .find_text(&target, region, s.confidence, &options)
            .map_err(|e| StepError::from_provider(e, ErrorCategory::TextSearch))?;
        let followup = Followup {
            category: ErrorCategory::TextSearch,
            click_on_found: s.click_on_found,
            click_offset: s.click_offset,
            double_click: s.double_click,
            on_found: s.on_found.as_ref(),
            on_not_found: s.on_not_found.as_ref(),
            fail_if_not_found: true,
        };
        match found {
            Some(m) => self.found(&m, &followup, ctx),
            None => self.missed(&followup, ctx, not_found_message(&target, region), hit_flag),
        }
    }

    pub(super) fn dynamic_text_search(
        &self,
        s: &DynamicTextSearchStep,
        ctx: &ExecutionContext,
        remedies: &[Remedy],
        hit_flag: HitFlag<'_>,
    ) -> Result<(), StepError> {
        let target = ctx.substitute(&s.search_text);
        let shown = if s.mask_in_logs { MASK } else { target.as_str() };
        if target.trim().is_empty() {
            return Err(StepError::new(
                ErrorCategory::TextSearch,
                "search text resolved to an empty string",
            ));
        }
        let region = self.search_region(s.search_region, remedies);
        let options = TextOptions {
            exact_match: false,
            preprocess: remedies.contains(&Remedy::EnablePreprocessing),
        };
        log::info!("Searching dynamic text '{}' in {:?}", shown, region);
        let found = self
            .recognizer
            .find_text(&target, region, s.confidence_threshold, &options)
            .map_err(|e| StepError::from_provider(e, ErrorCategory::TextSearch))?;
        let followup = Followup {
            category: ErrorCategory::TextSearch,
            click_on_found: s.click_on_found,
            click_offset: s.click_offset,
            double_click: s.double_click,
            on_found: s.on_found.as_ref(),
            on_not_found: s.on_not_found.as_ref(),
            fail_if_not_found: s.fail_if_not_found,
        };
        match found {
            Some(m) => self.found(&m, &followup, ctx),
            None => self.missed(&followup, ctx, not_found_message(shown, region), hit_flag),
        }
    }

    fn found(&self, m: &Match, f: &Followup<'_>, ctx: &ExecutionContext) -> Result<(), StepError> {
        if let Some(action) = f.on_found {
            return self.perform_action(action, Some(m), ctx, f.category);
        }
        if f.click_on_found {
            let (x, y) = (
                m.center.0.saturating_add(f.click_offset.0),
                m.center.1.saturating_add(f.click_offset.1),
            );
            let count = if f.double_click { 2 } else { 1 };
            self.input
                .click(x, y, MouseButton::Left, count, DOUBLE_CLICK_INTERVAL)
                .map_err(input_err)?;
        }
        Ok(())
    }

    fn missed(
        &self,
        f: &Followup<'_>,
        ctx: &ExecutionContext,
        message: String,
        hit_flag: HitFlag<'_>,
    ) -> Result<(), StepError> {
        if let Some(action) = f.on_not_found {
            log::info!("{}; running on_not_found action", message);
            return self.perform_action(action, None, ctx, f.category);
        }
        if hit_flag.is_some() {
            log::debug!("{}; loop continues", message);
            return Ok(());
        }
        if f.fail_if_not_found {
            Err(StepError::new(f.category, message))
        } else {
            log::warn!("{}; continuing", message);
            Ok(())
        }
    }

    fn perform_action(
        &self,
        action: &MatchAction,
        m: Option<&Match>,
        ctx: &ExecutionContext,
        category: ErrorCategory,
    ) -> Result<(), StepError> {
        match action {
            MatchAction::Click(p) => {
                let (x, y) = target_point(p, m, category)?;
                self.input
                    .click(x, y, MouseButton::Left, 1, Duration::ZERO)
                    .map_err(input_err)
            }
            MatchAction::DoubleClick(p) => {
                let (x, y) = target_point(p, m, category)?;
                self.input
                    .click(x, y, MouseButton::Left, 2, DOUBLE_CLICK_INTERVAL)
                    .map_err(input_err)
            }
            MatchAction::RightClick(p) => {
                let (x, y) = target_point(p, m, category)?;
                self.input
                    .click(x, y, MouseButton::Right, 1, Duration::ZERO)
                    .map_err(input_err)
            }
            MatchAction::Move(p) => {
                let (x, y) = target_point(p, m, category)?;
                self.input.move_to(x, y, Duration::ZERO).map_err(input_err)
            }
            MatchAction::Type(t) => self
                .input
                .type_text(&ctx.substitute(&t.text), secs(t.interval))
                .map_err(input_err),
            MatchAction::Hotkey(h) => {
                let keys: Vec<String> = h.keys.iter().map(|k| ctx.substitute(k)).collect();
                self.input.hotkey(&keys).map_err(input_err)
            }
            MatchAction::Wait(w) => self.wait(ctx, w.seconds),
            MatchAction::Continue => Ok(()),
            MatchAction::Fail(f) => {
                let message = if f.message.is_empty() {
                    "match action requested failure".to_string()
                } else {
                    ctx.substitute(&f.message)
                };
                Err(StepError::new(category, message))
            }
        }
    }
}

/// Explicit coordinates win over the match centre; offsets apply to both.
fn target_point(
    p: &PointerParams,
    m: Option<&Match>,
    category: ErrorCategory,
) -> Result<(i32, i32), StepError> {
    let x = p.x.or(m.map(|m| m.center.0));
    let y = p.y.or(m.map(|m| m.center.1));
    match (x, y) {
        (Some(x), Some(y)) => Ok((
            x.saturating_add(p.offset_x),
            y.saturating_add(p.offset_y),
        )),
        _ => Err(StepError::new(
            category,
            "pointer action needs x and y when there is no match",
        )),
    }
}
