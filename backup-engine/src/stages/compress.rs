//! Single-archive compression.
//!
//! When enabled the selector is bypassed: the whole source tree is streamed
//! into one `backup_<run-id>.zip` per local destination, and that archive is
//! what fans out to the remote destinations. The password-protected variant
//! derives a one-time password per run; it is cached in the OS credential
//! store and delivered out-of-band via notifications, never written to the
//! filesystem.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use globset::GlobSet;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};
use zip::unstable::write::FileOptionsExt;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{EngineError, Result};
use crate::fs::checksum::fingerprint_file;
use crate::fs::walker::walk_source;

/// Generated archive password length.
const PASSWORD_LEN: usize = 20;

/// Credential-store service the password is cached under.
const KEYRING_SERVICE: &str = "backup-runner";

#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

pub fn archive_file_name(run_id: &str) -> String {
    format!("backup_{run_id}.zip")
}

/// Stream the source tree into `backup_<run-id>.zip` under `out_dir`.
/// Exclude globs still apply so an archive cannot smuggle excluded paths
/// into a run.
pub fn build_archive(
    source_root: &Path,
    excludes: &GlobSet,
    out_dir: &Path,
    run_id: &str,
    password: Option<&str>,
) -> Result<ArchiveInfo> {
    let file_name = archive_file_name(run_id);
    let final_path = out_dir.join(&file_name);
    let tmp_path = out_dir.join(format!(".{file_name}.tmp"));

    fs::create_dir_all(out_dir)?;
    let files = walk_source(source_root, excludes)?;

    let out = File::create(&tmp_path)?;
    let mut zip = ZipWriter::new(out);

    for entry in &files {
        let mut options: FileOptions = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(if entry.is_symlink() { 0o120_755 } else { 0o644 });
        if entry.size >= u32::MAX as u64 {
            options = options.large_file(true);
        }
        if let Some(pw) = password {
            options = options.with_deprecated_encryption(pw.as_bytes());
        }

        zip.start_file(entry.rel_path.as_str(), options)
            .map_err(|e| EngineError::Archive(e.to_string()))?;

        if let Some(target) = &entry.symlink_target {
            // Symlink entries store the target path as their content.
            zip.write_all(target.to_string_lossy().as_bytes())?;
        } else {
            let mut src = File::open(&entry.abs_path)?;
            io::copy(&mut src, &mut zip)?;
        }
        debug!(path = %entry.rel_path, "archived");
    }

    zip.finish().map_err(|e| EngineError::Archive(e.to_string()))?;
    fs::rename(&tmp_path, &final_path)?;

    let (sha256, size) = fingerprint_file(&final_path)?;
    info!(
        archive = %final_path.display(),
        files = files.len(),
        bytes = size,
        "archive built"
    );

    Ok(ArchiveInfo {
        file_name,
        path: final_path,
        size,
        sha256,
    })
}

/// One-time password for a password-protected archive run.
pub fn generate_archive_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Cache the password in the OS credential store. Failure is survivable:
/// the password still reaches the operator through the notification channel.
pub fn cache_archive_password(run_id: &str, password: &str) {
    let account = format!("archive-{run_id}");
    match keyring::Entry::new(KEYRING_SERVICE, &account) {
        Ok(entry) => {
            if let Err(e) = entry.set_password(password) {
                warn!(run_id, error = %e, "cannot cache archive password in credential store");
            }
        }
        Err(e) => warn!(run_id, error = %e, "credential store unavailable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::walker::build_exclude_set;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn archives_the_whole_tree() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::create_dir(src.path().join("dir")).unwrap();
        fs::write(src.path().join("a.txt"), b"0123456789").unwrap();
        fs::write(src.path().join("dir/b.txt"), b"hello").unwrap();

        let excludes = build_exclude_set(&[]).unwrap();
        let info = build_archive(src.path(), &excludes, dst.path(), "20260101_000000", None)
            .unwrap();

        assert_eq!(info.file_name, "backup_20260101_000000.zip");
        assert!(info.path.exists());
        assert!(info.size > 0);

        let mut archive = zip::ZipArchive::new(File::open(&info.path).unwrap()).unwrap();
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "dir/b.txt"]);

        let mut content = String::new();
        archive
            .by_name("dir/b.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "hello");
    }

    #[test]
    fn password_protected_archive_rejects_plain_reads() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("secret.txt"), b"classified").unwrap();

        let excludes = build_exclude_set(&[]).unwrap();
        let info = build_archive(
            src.path(),
            &excludes,
            dst.path(),
            "20260101_000000",
            Some("hunter2hunter2hunter"),
        )
        .unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&info.path).unwrap()).unwrap();
        // Without the password the entry is unreadable.
        assert!(archive.by_name("secret.txt").is_err());
        let mut content = String::new();
        archive
            .by_name_decrypt("secret.txt", b"hunter2hunter2hunter")
            .unwrap()
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "classified");
    }

    #[test]
    fn excludes_apply_to_archives() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("keep.txt"), b"x").unwrap();
        fs::write(src.path().join("skip.log"), b"x").unwrap();

        let excludes = build_exclude_set(&["*.log".into()]).unwrap();
        let info =
            build_archive(src.path(), &excludes, dst.path(), "20260101_000000", None).unwrap();

        let archive = zip::ZipArchive::new(File::open(&info.path).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
    }

    #[test]
    fn generated_passwords_are_long_and_distinct() {
        let a = generate_archive_password();
        let b = generate_archive_password();
        assert_eq!(a.len(), PASSWORD_LEN);
        assert_ne!(a, b);
    }
}
