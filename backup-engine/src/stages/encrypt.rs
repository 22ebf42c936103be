//! Per-file encryption at rest.
//!
//! Envelope layout, no framing: 16-byte random salt ‖ 12-byte random nonce ‖
//! AES-256-GCM ciphertext with the 16-byte tag at the end. A keyfile holds
//! the 32-byte key verbatim and wins over a passphrase; a passphrase is run
//! through PBKDF2-HMAC-SHA256 with the envelope's salt. Manifests record the
//! plaintext hash and size and are themselves never encrypted.

use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::EncryptionConfig;
use crate::error::{EngineError, Result};
use crate::fs::checksum::{fingerprint_bytes, fingerprint_file};
use crate::manifest::{ENC_SUFFIX, MANIFEST_PREFIX};

pub const PBKDF2_ITERATIONS: u32 = 600_000;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

/// Key source for a run. Keyfile beats passphrase.
pub enum KeyMaterial {
    KeyFile([u8; 32]),
    Passphrase(String),
}

impl KeyMaterial {
    /// Load key material from the configuration. No material at all is fatal
    /// for every destination the stage would touch.
    pub fn from_config(cfg: &EncryptionConfig) -> Result<Self> {
        if let Some(path) = &cfg.keyfile {
            let bytes = fs::read(path).map_err(|e| {
                EngineError::KeyMaterial(format!("cannot read keyfile {}: {e}", path.display()))
            })?;
            let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                EngineError::KeyMaterial(format!(
                    "keyfile {} must be exactly 32 bytes, got {}",
                    path.display(),
                    bytes.len()
                ))
            })?;
            return Ok(KeyMaterial::KeyFile(key));
        }
        if let Some(passphrase) = &cfg.passphrase {
            return Ok(KeyMaterial::Passphrase(passphrase.clone()));
        }
        Err(EngineError::KeyMaterial(
            "neither keyfile nor passphrase configured".into(),
        ))
    }

    /// The AES key for one envelope. With a passphrase the derivation runs
    /// per file, because each envelope carries its own salt.
    fn key_for_salt(&self, salt: &[u8]) -> [u8; 32] {
        match self {
            KeyMaterial::KeyFile(key) => *key,
            KeyMaterial::Passphrase(passphrase) => {
                let mut key = [0u8; 32];
                pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
                key
            }
        }
    }
}

/// Seal plaintext into an envelope.
pub fn encrypt_bytes(material: &KeyMaterial, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let key = material.key_for_salt(&salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| EngineError::Crypto("AES-GCM encryption failed".into()))?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open an envelope.
pub fn decrypt_bytes(material: &KeyMaterial, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < SALT_LEN + NONCE_LEN + 16 {
        return Err(EngineError::Crypto("envelope too short".into()));
    }
    let (salt, rest) = data.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = material.key_for_salt(salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| EngineError::Crypto("AES-GCM authentication failed".into()))
}

/// Encrypt one file into a `.enc` sibling (write-then-rename), then delete
/// the plaintext. Returns the sibling path.
pub fn encrypt_file(path: &Path, material: &KeyMaterial) -> Result<PathBuf> {
    let plaintext = fs::read(path)?;
    let envelope = encrypt_bytes(material, &plaintext)?;

    let enc_path = enc_sibling(path);
    let tmp_path = path.with_file_name(format!(
        ".{}.enc.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));
    fs::write(&tmp_path, &envelope)?;
    fs::rename(&tmp_path, &enc_path)?;
    fs::remove_file(path)?;
    Ok(enc_path)
}

/// Decrypt one `.enc` file to `out`.
pub fn decrypt_file(enc_path: &Path, material: &KeyMaterial, out: &Path) -> Result<()> {
    let envelope = fs::read(enc_path)?;
    let plaintext = decrypt_bytes(material, &envelope)?;
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(out, plaintext)?;
    Ok(())
}

/// The `.enc` sibling path of a plaintext path.
pub fn enc_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(ENC_SUFFIX);
    path.with_file_name(name)
}

#[derive(Debug, Default)]
pub struct EncryptStats {
    pub files_encrypted: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
}

/// Encrypt every eligible file under a local destination root: regular
/// files that are not manifests and not already `.enc`. Idempotent: a
/// plaintext whose `.enc` sibling already decrypts to the same content is
/// only deleted, not re-encrypted.
pub fn encrypt_destination(dest_root: &Path, material: &KeyMaterial) -> Result<EncryptStats> {
    let mut stats = EncryptStats::default();

    let eligible: Vec<PathBuf> = WalkDir::new(dest_root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            let name = p.file_name().unwrap_or_default().to_string_lossy();
            !name.starts_with(MANIFEST_PREFIX) && !name.ends_with(ENC_SUFFIX)
        })
        .collect();

    for path in eligible {
        let sibling = enc_sibling(&path);
        if sibling.exists() {
            match sibling_matches(&path, &sibling, material) {
                Ok(true) => {
                    debug!(path = %path.display(), "already encrypted, dropping plaintext");
                    if let Err(e) = fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %e, "cannot remove plaintext");
                        stats.files_failed += 1;
                    } else {
                        stats.files_skipped += 1;
                    }
                    continue;
                }
                Ok(false) => {} // stale sibling, re-encrypt below
                Err(e) => {
                    warn!(path = %sibling.display(), error = %e, "cannot check existing envelope");
                }
            }
        }

        match encrypt_file(&path, material) {
            Ok(_) => stats.files_encrypted += 1,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "encryption failed");
                stats.files_failed += 1;
            }
        }
    }

    info!(
        dest = %dest_root.display(),
        encrypted = stats.files_encrypted,
        skipped = stats.files_skipped,
        failed = stats.files_failed,
        "encryption stage finished"
    );
    Ok(stats)
}

/// Does the existing envelope decrypt to the same bytes as the plaintext?
fn sibling_matches(plain: &Path, sibling: &Path, material: &KeyMaterial) -> Result<bool> {
    let envelope = fs::read(sibling)?;
    let decrypted = decrypt_bytes(material, &envelope)?;
    let (plain_sha, _) = fingerprint_file(plain)?;
    Ok(fingerprint_bytes(&decrypted) == plain_sha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn passphrase() -> KeyMaterial {
        KeyMaterial::Passphrase("correct horse battery staple".into())
    }

    #[test]
    fn round_trip_bitwise() {
        let material = passphrase();
        let plaintext = b"0123456789".to_vec();
        let envelope = encrypt_bytes(&material, &plaintext).unwrap();

        // salt + nonce + ciphertext + tag, no framing
        assert_eq!(envelope.len(), SALT_LEN + NONCE_LEN + plaintext.len() + 16);

        let back = decrypt_bytes(&material, &envelope).unwrap();
        assert_eq!(back, plaintext);
    }

    #[test]
    fn fresh_salt_and_nonce_per_envelope() {
        let material = passphrase();
        let a = encrypt_bytes(&material, b"same").unwrap();
        let b = encrypt_bytes(&material, b"same").unwrap();
        assert_ne!(a, b);
        assert_ne!(&a[..SALT_LEN], &b[..SALT_LEN]);
    }

    #[test]
    fn wrong_passphrase_fails_authentication() {
        let envelope = encrypt_bytes(&passphrase(), b"secret").unwrap();
        let wrong = KeyMaterial::Passphrase("wrong".into());
        assert!(decrypt_bytes(&wrong, &envelope).is_err());
    }

    #[test]
    fn keyfile_beats_passphrase() {
        let tmp = TempDir::new().unwrap();
        let keyfile = tmp.path().join("key.bin");
        std::fs::write(&keyfile, [7u8; 32]).unwrap();

        let cfg = EncryptionConfig {
            enabled: true,
            keyfile: Some(keyfile),
            passphrase: Some("ignored".into()),
        };
        let material = KeyMaterial::from_config(&cfg).unwrap();
        assert!(matches!(material, KeyMaterial::KeyFile(_)));
    }

    #[test]
    fn short_keyfile_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let keyfile = tmp.path().join("key.bin");
        std::fs::write(&keyfile, [7u8; 16]).unwrap();

        let cfg = EncryptionConfig {
            enabled: true,
            keyfile: Some(keyfile),
            passphrase: None,
        };
        assert!(KeyMaterial::from_config(&cfg).is_err());
    }

    #[test]
    fn no_material_is_fatal() {
        let cfg = EncryptionConfig::default();
        assert!(matches!(
            KeyMaterial::from_config(&cfg),
            Err(EngineError::KeyMaterial(_))
        ));
    }

    #[test]
    fn destination_stage_encrypts_and_is_idempotent() {
        let dest = TempDir::new().unwrap();
        std::fs::write(dest.path().join("a.txt"), b"payload").unwrap();
        std::fs::write(
            dest.path().join("backup_manifest_20260101_000000.json"),
            b"{}",
        )
        .unwrap();
        let material = passphrase();

        let stats = encrypt_destination(dest.path(), &material).unwrap();
        assert_eq!(stats.files_encrypted, 1);
        assert!(!dest.path().join("a.txt").exists());
        assert!(dest.path().join("a.txt.enc").exists());
        // Manifests stay readable.
        assert!(dest
            .path()
            .join("backup_manifest_20260101_000000.json")
            .exists());

        // Re-running with the plaintext back in place skips the fresh
        // envelope instead of re-encrypting it.
        std::fs::write(dest.path().join("a.txt"), b"payload").unwrap();
        let stats = encrypt_destination(dest.path(), &material).unwrap();
        assert_eq!(stats.files_encrypted, 0);
        assert_eq!(stats.files_skipped, 1);
        assert!(!dest.path().join("a.txt").exists());
    }

    #[test]
    fn file_round_trip_through_disk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.txt");
        std::fs::write(&path, b"hello world").unwrap();
        let material = passphrase();

        let enc = encrypt_file(&path, &material).unwrap();
        assert_eq!(enc, tmp.path().join("doc.txt.enc"));
        assert!(!path.exists());

        let out = tmp.path().join("restored.txt");
        decrypt_file(&enc, &material, &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"hello world");
    }
}
