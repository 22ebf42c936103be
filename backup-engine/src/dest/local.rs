//! Local directory copier.
//!
//! Per-file contract: create missing parents; recreate symlinks with their
//! original target; stream regular files while hashing, then verify against
//! an independent re-hash of the destination. A mismatch deletes the copy and
//! records a failure. Errors never escape as `Err`: every outcome is a
//! [`FileRecord`].

use std::fs::{self, File};
use std::io;
use std::path::Path;

use tracing::{debug, warn};

use super::rel_to_native;
use crate::fs::checksum::{fingerprint_file, HashingWriter};
use crate::fs::walker::SourceFile;
use crate::manifest::{FileRecord, FileStatus};

/// Copy one source file into `dest_root`.
pub fn copy_file(dest_root: &Path, file: &SourceFile) -> FileRecord {
    if let Some(target) = &file.symlink_target {
        return place_symlink(dest_root, file, target);
    }

    let dest_path = rel_to_native(dest_root, &file.rel_path);

    // A staged artifact (db dump) already lives at its destination; it only
    // needs fingerprinting.
    if file.abs_path == dest_path {
        return match fingerprint_file(&dest_path) {
            Ok((sha, size)) => record(file, size, sha, FileStatus::Copied, None),
            Err(e) => failed(file, format!("cannot hash staged file: {e}")),
        };
    }

    match stream_copy(&file.abs_path, &dest_path) {
        Ok((sha, size)) => {
            debug!(path = %file.rel_path, bytes = size, "copied");
            record(file, size, sha, FileStatus::Copied, None)
        }
        Err(e) => {
            warn!(path = %file.rel_path, error = %e, "copy failed");
            failed(file, e.to_string())
        }
    }
}

/// Stream `src` to `dst` while hashing, then re-hash `dst` independently.
fn stream_copy(src: &Path, dst: &Path) -> io::Result<(String, u64)> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut reader = File::open(src)?;
    let mut writer = HashingWriter::new(File::create(dst)?);
    io::copy(&mut reader, &mut writer)?;
    let (source_sha, size) = writer.finish();

    let (dest_sha, _) = fingerprint_file(dst)?;
    if dest_sha != source_sha {
        let _ = fs::remove_file(dst);
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("checksum mismatch after copy of {}", src.display()),
        ));
    }

    Ok((source_sha, size))
}

#[cfg(unix)]
fn place_symlink(dest_root: &Path, file: &SourceFile, target: &Path) -> FileRecord {
    let dest_path = rel_to_native(dest_root, &file.rel_path);
    let result = (|| -> io::Result<()> {
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::remove_file(&dest_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        std::os::unix::fs::symlink(target, &dest_path)
    })();

    match result {
        Ok(()) => record(file, 0, String::new(), FileStatus::Symlink, None),
        Err(e) => {
            warn!(path = %file.rel_path, error = %e, "symlink failed");
            failed(file, e.to_string())
        }
    }
}

#[cfg(not(unix))]
fn place_symlink(_dest_root: &Path, file: &SourceFile, _target: &Path) -> FileRecord {
    // Platforms that cannot create symlinks without privilege surface this as
    // a per-file failure, not a run failure.
    failed(file, "symlinks are not supported on this platform".to_string())
}

fn record(
    file: &SourceFile,
    size: u64,
    sha256: String,
    status: FileStatus,
    error: Option<String>,
) -> FileRecord {
    FileRecord {
        path: file.rel_path.clone(),
        stored_path: file.rel_path.clone(),
        size,
        sha256,
        status,
        error,
    }
}

fn failed(file: &SourceFile, error: String) -> FileRecord {
    FileRecord {
        path: file.rel_path.clone(),
        stored_path: file.rel_path.clone(),
        size: file.size,
        sha256: String::new(),
        status: FileStatus::Failed,
        error: Some(error),
    }
}
