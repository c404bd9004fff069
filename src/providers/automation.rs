//! Key-name parsing for hotkey steps.

use crate::error::ProviderError;
use enigo::Key;

/// Converts a key name (`"ctrl"`, `"F5"`, `"a"`, ...) to an enigo key.
pub fn string_to_key(key_str: &str) -> Option<Key> {
    let lowered = key_str.trim().to_lowercase();
    match lowered.as_str() {
        // Modifiers
        "shift" | "lshift" | "rshift" => Some(Key::Shift),
        "control" | "ctrl" | "lcontrol" | "rcontrol" => Some(Key::Control),
        "alt" | "option" | "lalt" | "ralt" => Some(Key::Alt),
        "meta" | "command" | "cmd" | "win" | "windows" | "super" => Some(Key::Meta),

        "f1" => Some(Key::F1),
        "f2" => Some(Key::F2),
        "f3" => Some(Key::F3),
        "f4" => Some(Key::F4),
        "f5" => Some(Key::F5),
        "f6" => Some(Key::F6),
        "f7" => Some(Key::F7),
        "f8" => Some(Key::F8),
        "f9" => Some(Key::F9),
        "f10" => Some(Key::F10),
        "f11" => Some(Key::F11),
        "f12" => Some(Key::F12),

        // Navigation
        "up" | "uparrow" => Some(Key::UpArrow),
        "down" | "downarrow" => Some(Key::DownArrow),
        "left" | "leftarrow" => Some(Key::LeftArrow),
        "right" | "rightarrow" => Some(Key::RightArrow),
        "home" => Some(Key::Home),
        "end" => Some(Key::End),
        "pageup" | "pgup" => Some(Key::PageUp),
        "pagedown" | "pgdn" => Some(Key::PageDown),

        "return" | "enter" => Some(Key::Return),
        "escape" | "esc" => Some(Key::Escape),
        "tab" => Some(Key::Tab),
        "backspace" | "back" => Some(Key::Backspace),
        "delete" | "del" => Some(Key::Delete),
        "space" => Some(Key::Space),
        "capslock" | "caps" => Some(Key::CapsLock),

        _ => {
            let mut chars = key_str.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c == ' ' => Some(Key::Space),
                (Some(c), None) => Some(Key::Unicode(c.to_ascii_lowercase())),
                _ => None,
            }
        }
    }
}

pub fn is_modifier(key: &Key) -> bool {
    matches!(key, Key::Shift | Key::Control | Key::Alt | Key::Meta)
}

/// Splits a chord into held modifiers and the keys tapped while they are held.
///
/// Entries may also be `+`-joined combos such as `"ctrl+shift+s"`.
pub fn parse_chord(keys: &[String]) -> Result<(Vec<Key>, Vec<Key>), ProviderError> {
    let mut modifiers = Vec::new();
    let mut taps = Vec::new();
    for name in keys.iter().flat_map(|k| split_combo(k)) {
        let key = string_to_key(name)
            .ok_or_else(|| ProviderError::Backend(format!("unknown key name '{}'", name)))?;
        if is_modifier(&key) {
            modifiers.push(key);
        } else {
            taps.push(key);
        }
    }
    if modifiers.is_empty() && taps.is_empty() {
        return Err(ProviderError::Backend("hotkey has no keys".to_string()));
    }
    Ok((modifiers, taps))
}

fn split_combo(entry: &str) -> Vec<&str> {
    if entry.len() > 1 && entry.contains('+') {
        entry.split('+').filter(|p| !p.trim().is_empty()).collect()
    } else {
        vec![entry]
    }
}
