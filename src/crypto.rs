//! AES-256-GCM sealing for the encrypted macro encoding.
//!
//! The key lives base64-encoded in a local key file that is created on first
//! use with owner-only permissions.

use crate::error::MacroError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use rand::rngs::OsRng;
use std::fs;
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"EMF1";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

pub struct MacroCipher {
    cipher: Aes256Gcm,
    key_path: PathBuf,
}

impl MacroCipher {
    /// Loads the key at `key_path`, generating and saving a new one if absent.
    pub fn open(key_path: impl AsRef<Path>) -> Result<Self, MacroError> {
        let key_path = key_path.as_ref().to_path_buf();
        let key = if key_path.exists() {
            load_key(&key_path)?
        } else {
            generate_key(&key_path)?
        };
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
            key_path,
        })
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// `MAGIC || nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, MacroError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| MacroError::Crypto(format!("encryption failed: {}", e)))?;
        let mut out = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open_sealed(&self, data: &[u8]) -> Result<Vec<u8>, MacroError> {
        let body = data
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| MacroError::Crypto("not an encrypted macro file".to_string()))?;
        if body.len() < NONCE_LEN {
            return Err(MacroError::Crypto("encrypted payload is truncated".to_string()));
        }
        let (nonce, ciphertext) = body.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                MacroError::Crypto("decryption failed: wrong key or corrupted file".to_string())
            })
    }
}

/// True when `data` starts with the encrypted-file header.
pub fn is_sealed(data: &[u8]) -> bool {
    data.starts_with(MAGIC)
}

fn load_key(path: &Path) -> Result<[u8; KEY_LEN], MacroError> {
    let encoded = fs::read_to_string(path)?;
    let bytes = STANDARD.decode(encoded.trim()).map_err(|e| {
        MacroError::Crypto(format!("key file {} is not base64: {}", path.display(), e))
    })?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        MacroError::Crypto(format!(
            "invalid key size: {} bytes (expected {})",
            b.len(),
            KEY_LEN
        ))
    })
}

fn generate_key(path: &Path) -> Result<[u8; KEY_LEN], MacroError> {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, STANDARD.encode(key))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    log::info!("Generated new macro encryption key at {}", path.display());
    Ok(key)
}
