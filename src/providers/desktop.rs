//! Input injection through enigo.

use super::InputProvider;
use super::automation::parse_chord;
use crate::error::ProviderError;
use crate::step_types::{MouseButton, Region};
use enigo::{Axis, Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};
use std::thread;
use std::time::Duration;

const MOVE_STEP: Duration = Duration::from_millis(10);

fn backend<E: std::fmt::Display>(what: &str) -> impl FnOnce(E) -> ProviderError + '_ {
    move |e| ProviderError::Backend(format!("{}: {}", what, e))
}

/// Opens a fresh enigo connection per call, so the provider itself is `Sync`.
#[derive(Default)]
pub struct EnigoInput;

impl EnigoInput {
    pub fn new() -> Self {
        Self
    }

    fn connect(&self) -> Result<Enigo, ProviderError> {
        Enigo::new(&Settings::default()).map_err(backend("input backend unavailable"))
    }
}

/// Point `i/steps` of the way from `from` to `to`.
fn lerp(from: i32, to: i32, i: u64, steps: u64) -> i32 {
    let delta = i128::from(to) - i128::from(from);
    let point = i128::from(from) + delta * i128::from(i) / i128::from(steps.max(1));
    point.clamp(i128::from(i32::MIN), i128::from(i32::MAX)) as i32
}

/// Glides the cursor to `(x, y)` over `duration`, ending exactly on the target.
fn glide(enigo: &mut Enigo, x: i32, y: i32, duration: Duration) -> Result<(), ProviderError> {
    let steps = u64::try_from(duration.as_millis() / MOVE_STEP.as_millis()).unwrap_or(u64::MAX);
    if steps > 1 {
        let (sx, sy) = enigo.location().map_err(backend("cursor location"))?;
        for i in 1..steps {
            enigo
                .move_mouse(lerp(sx, x, i, steps), lerp(sy, y, i, steps), Coordinate::Abs)
                .map_err(backend("mouse move"))?;
            thread::sleep(MOVE_STEP);
        }
    }
    enigo
        .move_mouse(x, y, Coordinate::Abs)
        .map_err(backend("mouse move"))
}

fn to_button(button: MouseButton) -> Button {
    match button {
        MouseButton::Left => Button::Left,
        MouseButton::Right => Button::Right,
        MouseButton::Middle => Button::Middle,
    }
}

impl InputProvider for EnigoInput {
    fn move_to(&self, x: i32, y: i32, duration: Duration) -> Result<(), ProviderError> {
        let mut enigo = self.connect()?;
        glide(&mut enigo, x, y, duration)
    }

    fn drag(
        &self,
        x: i32,
        y: i32,
        button: MouseButton,
        duration: Duration,
    ) -> Result<(), ProviderError> {
        let mut enigo = self.connect()?;
        enigo
            .button(to_button(button), Direction::Press)
            .map_err(backend("mouse press"))?;
        let moved = glide(&mut enigo, x, y, duration);
        // Release even if the move failed.
        let released = enigo.button(to_button(button), Direction::Release);
        moved?;
        released.map_err(backend("mouse release"))?;
        log::debug!("Dragged {:?} to ({}, {})", button, x, y);
        Ok(())
    }

    fn scroll(&self, clicks: i32) -> Result<(), ProviderError> {
        let mut enigo = self.connect()?;
        // enigo counts positive lengths downwards.
        enigo
            .scroll(clicks.saturating_neg(), Axis::Vertical)
            .map_err(backend("mouse scroll"))
    }

    fn click(
        &self,
        x: i32,
        y: i32,
        button: MouseButton,
        count: u32,
        interval: Duration,
    ) -> Result<(), ProviderError> {
        let mut enigo = self.connect()?;
        enigo
            .move_mouse(x, y, Coordinate::Abs)
            .map_err(backend("mouse move"))?;
        for i in 0..count.max(1) {
            if i > 0 && !interval.is_zero() {
                thread::sleep(interval);
            }
            enigo
                .button(to_button(button), Direction::Click)
                .map_err(backend("mouse click"))?;
        }
        log::debug!("Clicked {:?} x{} at ({}, {})", button, count, x, y);
        Ok(())
    }

    fn type_text(&self, text: &str, interval: Duration) -> Result<(), ProviderError> {
        let mut enigo = self.connect()?;
        if interval.is_zero() {
            return enigo.text(text).map_err(backend("typing"));
        }
        for c in text.chars() {
            enigo
                .key(Key::Unicode(c), Direction::Click)
                .map_err(backend("typing"))?;
            thread::sleep(interval);
        }
        Ok(())
    }

    fn hotkey(&self, keys: &[String]) -> Result<(), ProviderError> {
        let (modifiers, taps) = parse_chord(keys)?;
        let mut enigo = self.connect()?;
        for m in &modifiers {
            enigo.key(*m, Direction::Press).map_err(backend("hotkey"))?;
        }
        let tapped = taps
            .iter()
            .try_for_each(|k| enigo.key(*k, Direction::Click));
        // Release modifiers even if a tap failed.
        for m in modifiers.iter().rev() {
            let _ = enigo.key(*m, Direction::Release);
        }
        tapped.map_err(backend("hotkey"))
    }

    fn primary_bounds(&self) -> Option<Region> {
        let enigo = self.connect().ok()?;
        let (w, h) = enigo.main_display().ok()?;
        Some(Region::new(0, 0, w.max(0) as u32, h.max(0) as u32))
    }
}
