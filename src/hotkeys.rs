//! Global pause/stop hotkeys.
//!
//! The listener only forwards [`ControlCommand`]s; the driver decides what
//! to do with them.

use crate::config::HotkeySettings;
use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, unbounded};
use rdev::{EventType, Key};
use std::thread;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    TogglePause,
    Stop,
}

/// Maps a key name from settings ("F9", "Escape", "Pause", "Q") to a key.
pub fn parse_hotkey(name: &str) -> Option<Key> {
    let lower = name.trim().to_lowercase();
    let key = match lower.as_str() {
        "esc" | "escape" => Key::Escape,
        "pause" | "break" => Key::Pause,
        "scrolllock" | "scroll_lock" => Key::ScrollLock,
        "printscreen" | "print_screen" => Key::PrintScreen,
        "home" => Key::Home,
        "end" => Key::End,
        "insert" => Key::Insert,
        "delete" => Key::Delete,
        "pageup" => Key::PageUp,
        "pagedown" => Key::PageDown,
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,
        _ => return letter_key(&lower),
    };
    Some(key)
}

fn letter_key(name: &str) -> Option<Key> {
    let mut chars = name.chars();
    let c = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    Some(match c {
        'a' => Key::KeyA,
        'b' => Key::KeyB,
        'c' => Key::KeyC,
        'd' => Key::KeyD,
        'e' => Key::KeyE,
        'f' => Key::KeyF,
        'g' => Key::KeyG,
        'h' => Key::KeyH,
        'i' => Key::KeyI,
        'j' => Key::KeyJ,
        'k' => Key::KeyK,
        'l' => Key::KeyL,
        'm' => Key::KeyM,
        'n' => Key::KeyN,
        'o' => Key::KeyO,
        'p' => Key::KeyP,
        'q' => Key::KeyQ,
        'r' => Key::KeyR,
        's' => Key::KeyS,
        't' => Key::KeyT,
        'u' => Key::KeyU,
        'v' => Key::KeyV,
        'w' => Key::KeyW,
        'x' => Key::KeyX,
        'y' => Key::KeyY,
        'z' => Key::KeyZ,
        _ => return None,
    })
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HotkeyBindings {
    pub pause: Key,
    pub stop: Key,
}

impl HotkeyBindings {
    pub fn from_settings(settings: &HotkeySettings) -> Result<Self> {
        let pause = parse_hotkey(&settings.pause)
            .ok_or_else(|| anyhow!("unknown pause hotkey '{}'", settings.pause))?;
        let stop = parse_hotkey(&settings.stop)
            .ok_or_else(|| anyhow!("unknown stop hotkey '{}'", settings.stop))?;
        if pause == stop {
            return Err(anyhow!("pause and stop hotkeys must differ"));
        }
        Ok(Self { pause, stop })
    }

    pub fn command_for(&self, key: Key) -> Option<ControlCommand> {
        if key == self.stop {
            Some(ControlCommand::Stop)
        } else if key == self.pause {
            Some(ControlCommand::TogglePause)
        } else {
            None
        }
    }
}

/// Starts the global key listener on its own thread.
///
/// The channel simply goes quiet if the platform refuses the hook.
pub fn spawn_listener(bindings: HotkeyBindings) -> std::io::Result<Receiver<ControlCommand>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("hotkeys".to_string())
        .spawn(move || {
            let result = rdev::listen(move |event| {
                if let EventType::KeyPress(key) = event.event_type {
                    if let Some(command) = bindings.command_for(key) {
                        log::info!("Hotkey {:?} -> {:?}", key, command);
                        let _ = tx.send(command);
                    }
                }
            });
            if let Err(error) = result {
                log::error!("Global hotkey listener failed: {:?}", error);
            }
        })?;
    Ok(rx)
}
