//! After-the-fact verification of a destination against its latest manifest.
//!
//! Every `copied` row is stat-ed, size-checked and re-hashed; `.enc` stored
//! files are decrypted to a temp path first and the plaintext hash compared.
//! A mismatch marks the destination corrupted; nothing is ever mutated.
//! Running verify twice on an unchanged destination yields identical
//! results.

use std::path::Path;

use tracing::{info, warn};

use crate::dest::rel_to_native;
use crate::error::Result;
use crate::fs::checksum::fingerprint_file;
use crate::manifest::{store, FileStatus, ENC_SUFFIX};
use crate::stages::encrypt::{decrypt_file, enc_sibling, KeyMaterial};

#[derive(Debug)]
pub struct VerifyOutcome {
    pub path: String,
    pub ok: bool,
    pub detail: Option<String>,
}

#[derive(Debug)]
pub struct VerifyReport {
    pub destination: String,
    pub run_id: String,
    pub checked: usize,
    pub corrupted: bool,
    pub outcomes: Vec<VerifyOutcome>,
}

/// Verify the latest run at a local destination. `Ok(None)` means the
/// destination has no runs to verify.
pub fn verify_destination(
    dest_root: &Path,
    key: Option<&KeyMaterial>,
) -> Result<Option<VerifyReport>> {
    let Some(manifest) = store::latest_manifest(dest_root)? else {
        return Ok(None);
    };

    let mut outcomes = Vec::new();

    for row in &manifest.files {
        if row.status != FileStatus::Copied {
            continue;
        }

        let stored = rel_to_native(dest_root, &row.stored_path);
        let outcome = if row.stored_path.ends_with(ENC_SUFFIX) || !stored.exists() {
            // Either the manifest already points at the envelope, or the
            // plaintext was encrypted after manifesting and only the sibling
            // remains.
            let enc_path = if row.stored_path.ends_with(ENC_SUFFIX) {
                stored.clone()
            } else {
                enc_sibling(&stored)
            };
            verify_encrypted(&row.path, &enc_path, &row.sha256, row.size, key)
        } else {
            verify_plain(&row.path, &stored, &row.sha256, row.size)
        };

        if !outcome.ok {
            warn!(
                dest = %dest_root.display(),
                path = %outcome.path,
                detail = outcome.detail.as_deref().unwrap_or(""),
                "verification mismatch"
            );
        }
        outcomes.push(outcome);
    }

    let corrupted = outcomes.iter().any(|o| !o.ok);
    info!(
        dest = %dest_root.display(),
        run_id = %manifest.run_id,
        checked = outcomes.len(),
        corrupted,
        "verification finished"
    );

    Ok(Some(VerifyReport {
        destination: dest_root.display().to_string(),
        run_id: manifest.run_id.clone(),
        checked: outcomes.len(),
        corrupted,
        outcomes,
    }))
}

fn verify_plain(rel: &str, stored: &Path, want_sha: &str, want_size: u64) -> VerifyOutcome {
    let meta = match stored.metadata() {
        Ok(meta) => meta,
        Err(e) => return mismatch(rel, format!("missing: {e}")),
    };
    if meta.len() != want_size {
        return mismatch(rel, format!("size {} != recorded {}", meta.len(), want_size));
    }
    match fingerprint_file(stored) {
        Ok((sha, _)) if sha == want_sha => ok(rel),
        Ok((sha, _)) => mismatch(rel, format!("sha256 {sha} != recorded {want_sha}")),
        Err(e) => mismatch(rel, format!("cannot hash: {e}")),
    }
}

fn verify_encrypted(
    rel: &str,
    enc_path: &Path,
    want_sha: &str,
    want_size: u64,
    key: Option<&KeyMaterial>,
) -> VerifyOutcome {
    if !enc_path.exists() {
        return mismatch(rel, "stored file missing".to_string());
    }
    let Some(key) = key else {
        return mismatch(rel, "encrypted file but no key material configured".to_string());
    };

    let scratch = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => return mismatch(rel, format!("no scratch space: {e}")),
    };
    let plain = scratch.path().join("plain");
    if let Err(e) = decrypt_file(enc_path, key, &plain) {
        return mismatch(rel, format!("decrypt failed: {e}"));
    }

    match fingerprint_file(&plain) {
        Ok((sha, size)) if sha == want_sha && size == want_size => ok(rel),
        Ok((sha, size)) => mismatch(
            rel,
            format!("plaintext ({sha}, {size}) != recorded ({want_sha}, {want_size})"),
        ),
        Err(e) => mismatch(rel, format!("cannot hash plaintext: {e}")),
    }
}

fn ok(rel: &str) -> VerifyOutcome {
    VerifyOutcome {
        path: rel.to_string(),
        ok: true,
        detail: None,
    }
}

fn mismatch(rel: &str, detail: String) -> VerifyOutcome {
    VerifyOutcome {
        path: rel.to_string(),
        ok: false,
        detail: Some(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::checksum::fingerprint_bytes;
    use crate::manifest::{BackupMode, FileRecord, Manifest};
    use chrono::Local;
    use tempfile::TempDir;

    fn manifest_for(dest: &Path, rows: Vec<FileRecord>) {
        let m = Manifest {
            run_id: "20260101_000000".into(),
            mode: BackupMode::Full,
            source_root: "/src".into(),
            destination_root: dest.display().to_string(),
            started_at: Local::now(),
            finished_at: Local::now(),
            files: rows,
        };
        store::write_manifest(dest, &m).unwrap();
    }

    fn copied_row(rel: &str, content: &[u8]) -> FileRecord {
        FileRecord {
            path: rel.to_string(),
            stored_path: rel.to_string(),
            size: content.len() as u64,
            sha256: fingerprint_bytes(content),
            status: FileStatus::Copied,
            error: None,
        }
    }

    #[test]
    fn empty_destination_has_nothing_to_verify() {
        let dest = TempDir::new().unwrap();
        assert!(verify_destination(dest.path(), None).unwrap().is_none());
    }

    #[test]
    fn clean_destination_verifies_and_is_idempotent() {
        let dest = TempDir::new().unwrap();
        std::fs::write(dest.path().join("a.txt"), b"0123456789").unwrap();
        manifest_for(dest.path(), vec![copied_row("a.txt", b"0123456789")]);

        let first = verify_destination(dest.path(), None).unwrap().unwrap();
        assert!(!first.corrupted);
        assert_eq!(first.checked, 1);

        let second = verify_destination(dest.path(), None).unwrap().unwrap();
        assert_eq!(second.corrupted, first.corrupted);
        assert_eq!(second.checked, first.checked);
    }

    #[test]
    fn tampered_content_marks_corruption() {
        let dest = TempDir::new().unwrap();
        std::fs::write(dest.path().join("a.txt"), b"0123456789").unwrap();
        manifest_for(dest.path(), vec![copied_row("a.txt", b"0123456789")]);

        std::fs::write(dest.path().join("a.txt"), b"0123456789").unwrap();
        assert!(!verify_destination(dest.path(), None).unwrap().unwrap().corrupted);

        std::fs::write(dest.path().join("a.txt"), b"012345678X").unwrap();
        let report = verify_destination(dest.path(), None).unwrap().unwrap();
        assert!(report.corrupted);
        // The verifier never repairs or deletes.
        assert_eq!(std::fs::read(dest.path().join("a.txt")).unwrap(), b"012345678X");
    }

    #[test]
    fn encrypted_sibling_is_decrypted_and_checked() {
        let dest = TempDir::new().unwrap();
        let material = KeyMaterial::Passphrase("pw".into());
        std::fs::write(dest.path().join("a.txt"), b"payload").unwrap();
        manifest_for(dest.path(), vec![copied_row("a.txt", b"payload")]);

        crate::stages::encrypt::encrypt_destination(dest.path(), &material).unwrap();
        assert!(!dest.path().join("a.txt").exists());

        let report = verify_destination(dest.path(), Some(&material))
            .unwrap()
            .unwrap();
        assert!(!report.corrupted);

        // Without key material the row cannot be verified.
        let report = verify_destination(dest.path(), None).unwrap().unwrap();
        assert!(report.corrupted);
    }
}
