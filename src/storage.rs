//! Macro persistence.
//!
//! Encoding A is pretty-printed JSON. Encoding B is the same JSON sealed with
//! [`MacroCipher`]; files with an `.emf` or `.emacro` extension use it.
//!
//! Also lists a macro directory, deletes with backups, and exports/imports
//! plain copies for sharing.

use crate::crypto::{MacroCipher, is_sealed};
use crate::error::MacroError;
use crate::macro_def::Macro;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const SCHEMA_VERSION: u32 = 1;

pub const ENCRYPTED_EXTENSIONS: [&str; 2] = ["emf", "emacro"];

/// Backups kept per macro file name.
pub const BACKUPS_KEPT: usize = 10;

const EXPORT_VERSION: &str = "1.0.0";

#[derive(Serialize, Deserialize)]
struct MacroDocument {
    schema_version: u32,
    #[serde(rename = "macro")]
    body: Macro,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    export_info: Option<ExportInfo>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportInfo {
    pub exported_at: DateTime<Local>,
    pub export_version: String,
}

/// One entry of [`list_macros`].
#[derive(Clone, Debug, PartialEq)]
pub struct MacroSummary {
    pub path: PathBuf,
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
    pub encrypted: bool,
}

pub fn is_encrypted_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| ENCRYPTED_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

pub fn to_json(m: &Macro) -> Result<String, MacroError> {
    let doc = MacroDocument {
        schema_version: SCHEMA_VERSION,
        body: m.clone(),
        export_info: None,
    };
    Ok(serde_json::to_string_pretty(&doc)?)
}

pub fn from_json(text: &str) -> Result<Macro, MacroError> {
    Ok(parse_document(text)?.body)
}

fn parse_document(text: &str) -> Result<MacroDocument, MacroError> {
    let doc: MacroDocument = serde_json::from_str(text)?;
    if doc.schema_version > SCHEMA_VERSION {
        log::warn!(
            "Macro '{}' uses schema version {} (newer than {}); unknown fields are ignored",
            doc.body.name,
            doc.schema_version,
            SCHEMA_VERSION
        );
    }
    Ok(doc)
}

pub fn save_plain(m: &Macro, path: &Path) -> Result<(), MacroError> {
    write_with_parents(path, to_json(m)?.as_bytes())
}

pub fn load_plain(path: &Path) -> Result<Macro, MacroError> {
    let text = read(path)?;
    from_json(&String::from_utf8_lossy(&text))
}

pub fn save_encrypted(m: &Macro, path: &Path, cipher: &MacroCipher) -> Result<(), MacroError> {
    let sealed = cipher.seal(to_json(m)?.as_bytes())?;
    write_with_parents(path, &sealed)
}

pub fn load_encrypted(path: &Path, cipher: &MacroCipher) -> Result<Macro, MacroError> {
    let plain = cipher.open_sealed(&read(path)?)?;
    let text = String::from_utf8(plain)
        .map_err(|e| MacroError::Crypto(format!("decrypted macro is not UTF-8: {}", e)))?;
    from_json(&text)
}

/// Saves `m`, choosing the encoding from the file extension.
pub fn save_macro(m: &Macro, path: &Path, key_file: &Path) -> Result<(), MacroError> {
    if is_encrypted_path(path) {
        save_encrypted(m, path, &MacroCipher::open(key_file)?)
    } else {
        save_plain(m, path)
    }
}

/// Loads a macro in either encoding. Sealed content is detected by header
/// as well as by extension.
pub fn load_macro(path: &Path, key_file: &Path) -> Result<Macro, MacroError> {
    let data = read(path)?;
    let m = if is_encrypted_path(path) || is_sealed(&data) {
        let plain = MacroCipher::open(key_file)?.open_sealed(&data)?;
        let text = String::from_utf8(plain)
            .map_err(|e| MacroError::Crypto(format!("decrypted macro is not UTF-8: {}", e)))?;
        from_json(&text)?
    } else {
        from_json(&String::from_utf8_lossy(&data))?
    };
    log::info!(
        "Loaded macro '{}' ({} steps) from {}",
        m.name,
        m.step_count(),
        path.display()
    );
    Ok(m)
}

/// Every macro file directly inside `dir`, most recently updated first.
///
/// Encrypted files are opened with `key_file` only when `include_encrypted`
/// is set. Files that fail to load are logged and skipped.
pub fn list_macros(
    dir: &Path,
    key_file: &Path,
    include_encrypted: bool,
) -> Result<Vec<MacroSummary>, MacroError> {
    let mut found = Vec::new();
    if !dir.is_dir() {
        return Ok(found);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let encrypted = is_encrypted_path(&path);
        let is_json = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if !path.is_file() || !(is_json || (encrypted && include_encrypted)) {
            continue;
        }
        match load_macro(&path, key_file) {
            Ok(m) => found.push(MacroSummary {
                path,
                id: m.id,
                name: m.name,
                description: m.description,
                created_at: m.created_at,
                updated_at: m.updated_at,
                encrypted,
            }),
            Err(e) => log::error!("Skipping macro file {}: {}", path.display(), e),
        }
    }
    found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(found)
}

/// Copies `path` into `backup_dir` as `<stem>_backup_<timestamp>_<n>.<ext>`
/// and prunes that file's backups down to [`BACKUPS_KEPT`].
pub fn backup_file(path: &Path, backup_dir: &Path) -> Result<PathBuf, MacroError> {
    fs::create_dir_all(backup_dir)?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let stamp = Local::now().format("%Y%m%d_%H%M%S_%9f");
    let mut n = 0u32;
    let target = loop {
        let candidate = backup_dir.join(format!("{}_backup_{}_{:03}{}", stem, stamp, n, ext));
        if !candidate.exists() {
            break candidate;
        }
        n += 1;
    };
    fs::copy(path, &target).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => MacroError::NotFound(path.display().to_string()),
        _ => MacroError::Io(e),
    })?;
    log::info!("Created backup {}", target.display());
    prune_backups(backup_dir, &stem)?;
    Ok(target)
}

fn prune_backups(backup_dir: &Path, stem: &str) -> Result<(), MacroError> {
    let prefix = format!("{}_backup_", stem);
    let mut backups: Vec<PathBuf> = fs::read_dir(backup_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(&prefix))
        })
        .collect();
    // Names embed a fixed-width timestamp and counter, so they sort by age.
    backups.sort();
    let excess = backups.len().saturating_sub(BACKUPS_KEPT);
    for old in &backups[..excess] {
        fs::remove_file(old)?;
        log::info!("Deleted old backup {}", old.display());
    }
    Ok(())
}

/// Deletes a macro file, backing it up first when `backup_dir` is given.
/// Returns `false` when there was nothing to delete.
pub fn delete_macro(path: &Path, backup_dir: Option<&Path>) -> Result<bool, MacroError> {
    if !path.exists() {
        return Ok(false);
    }
    if let Some(dir) = backup_dir {
        backup_file(path, dir)?;
    }
    fs::remove_file(path)?;
    log::info!("Deleted macro {}", path.display());
    Ok(true)
}

/// Writes a plain JSON copy for sharing, whatever encoding the macro was
/// stored in.
pub fn export_macro(m: &Macro, path: &Path) -> Result<(), MacroError> {
    let doc = MacroDocument {
        schema_version: SCHEMA_VERSION,
        body: m.clone(),
        export_info: Some(ExportInfo {
            exported_at: Local::now(),
            export_version: EXPORT_VERSION.to_string(),
        }),
    };
    write_with_parents(path, serde_json::to_string_pretty(&doc)?.as_bytes())?;
    log::info!("Exported macro '{}' to {}", m.name, path.display());
    Ok(())
}

/// Reads a plain macro document (exported or not) under a fresh id.
pub fn import_macro(path: &Path) -> Result<Macro, MacroError> {
    let text = read(path)?;
    let doc = parse_document(&String::from_utf8_lossy(&text))?;
    if let Some(info) = &doc.export_info {
        log::info!(
            "Importing export v{} from {}",
            info.export_version,
            info.exported_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    let mut m = doc.body;
    m.id = Uuid::new_v4();
    m.touch();
    log::info!("Imported macro '{}' as {}", m.name, m.id);
    Ok(m)
}

fn read(path: &Path) -> Result<Vec<u8>, MacroError> {
    fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => MacroError::NotFound(path.display().to_string()),
        _ => MacroError::Io(e),
    })
}

fn write_with_parents(path: &Path, data: &[u8]) -> Result<(), MacroError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)?;
    Ok(())
}
