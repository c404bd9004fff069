//! Per-category remedy selection.
//!
//! Each check fires only when a keyword matches and the matching hint is
//! set; otherwise evaluation falls through to the next check.

use super::{ErrorCategory, RecoveryHints, Remedy};

fn mentions(message: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| message.contains(n))
}

pub(super) fn diagnose(
    category: ErrorCategory,
    message: &str,
    hints: &RecoveryHints,
) -> Option<Remedy> {
    let msg = message.to_lowercase();
    match category {
        ErrorCategory::Excel => excel(&msg, hints),
        ErrorCategory::Monitor => monitor(&msg, hints),
        ErrorCategory::ImageSearch => image_search(&msg, hints),
        ErrorCategory::TextSearch => text_search(&msg, hints),
        ErrorCategory::Execution => execution(&msg, hints),
        ErrorCategory::General => None,
    }
}

fn excel(msg: &str, hints: &RecoveryHints) -> Option<Remedy> {
    let decoding = mentions(msg, &["codec", "decode", "encode", "encoding", "utf-8"]);
    if decoding && hints.retry_with_encoding {
        return Some(Remedy::RetryWithAlternateEncoding);
    }
    if mentions(msg, &["permission denied", "locked"]) && hints.suggest_close_file {
        return Some(Remedy::CloseAndRetry);
    }
    if mentions(msg, &["keyerror", "column", "not found"]) && hints.normalize_columns {
        return Some(Remedy::NormalizeColumnNames);
    }
    None
}

fn monitor(msg: &str, hints: &RecoveryHints) -> Option<Remedy> {
    if mentions(msg, &["out of range", "bounds", "invalid region"]) && hints.use_primary_monitor {
        return Some(Remedy::UsePrimaryMonitor);
    }
    if mentions(msg, &["dpi", "scale"]) && hints.reset_dpi_scale {
        return Some(Remedy::ResetDpiScale);
    }
    None
}

fn image_search(msg: &str, hints: &RecoveryHints) -> Option<Remedy> {
    if mentions(msg, &["filenotfound", "no such file", "cannot find"])
        && !hints.search_paths.is_empty()
    {
        return Some(Remedy::TryAlternatePaths(hints.search_paths.clone()));
    }
    if mentions(msg, &["confidence", "not found"]) && hints.lower_confidence {
        return Some(Remedy::LowerConfidence);
    }
    None
}

fn text_search(msg: &str, hints: &RecoveryHints) -> Option<Remedy> {
    if mentions(msg, &["not installed", "initialization"]) {
        // Nothing to retry until the runtime is installed.
        log::error!("Text recognition unavailable: installation required");
        if hints.check_installation {
            log::error!("Install a text recognition engine and restart the run");
        }
        return None;
    }
    if mentions(msg, &["region", "invalid"]) && hints.use_full_screen {
        return Some(Remedy::WidenToFullScreen);
    }
    if mentions(msg, &["no text", "empty"]) && hints.enable_preprocessing {
        return Some(Remedy::EnablePreprocessing);
    }
    None
}

fn execution(msg: &str, hints: &RecoveryHints) -> Option<Remedy> {
    if msg.contains("timeout") && hints.increase_timeout {
        return Some(Remedy::IncreaseTimeout);
    }
    if msg.contains("memory") && hints.clear_cache {
        return Some(Remedy::ClearCaches);
    }
    None
}
