//! Restore: rebuild a source tree from the manifests a destination holds.
//!
//! Point-in-time selection takes the latest `full` manifest at or before the
//! requested timestamp plus every later incremental/differential up to it,
//! newest-wins per path. Stored `.enc` envelopes are decrypted on the way
//! out; symlinks are recreated from the destination's own links.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::dest::rel_to_native;
use crate::error::{EngineError, Result};
use crate::fs::checksum::fingerprint_file;
use crate::manifest::{store, BackupMode, FileRecord, FileStatus, Manifest, ENC_SUFFIX};
use crate::stages::encrypt::{decrypt_file, enc_sibling, KeyMaterial};

/// Where a restore reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    Local(PathBuf),
    Ssh {
        user: String,
        host: String,
        path: PathBuf,
    },
    S3 {
        bucket: String,
        prefix: String,
    },
}

/// Parse `--from-dir` syntax: a plain path, `user@host:/abs/path`,
/// `ssh://user@host/abs/path`, or `s3://bucket/prefix`.
pub fn parse_restore_source(spec: &str) -> Result<RestoreSource> {
    if let Some(rest) = spec.strip_prefix("s3://") {
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(EngineError::Restore(format!("bad s3 source {spec:?}")));
        }
        return Ok(RestoreSource::S3 {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        });
    }

    if let Some(rest) = spec.strip_prefix("ssh://") {
        let (user, rest) = rest
            .split_once('@')
            .ok_or_else(|| EngineError::Restore(format!("bad ssh source {spec:?}")))?;
        let (host, path) = rest
            .split_once('/')
            .ok_or_else(|| EngineError::Restore(format!("bad ssh source {spec:?}")))?;
        return Ok(RestoreSource::Ssh {
            user: user.to_string(),
            host: host.to_string(),
            path: PathBuf::from(format!("/{path}")),
        });
    }

    // user@host:/abs/path
    if let Some((user, rest)) = spec.split_once('@') {
        if let Some((host, path)) = rest.split_once(":/") {
            if !user.contains('/') && !host.is_empty() {
                return Ok(RestoreSource::Ssh {
                    user: user.to_string(),
                    host: host.to_string(),
                    path: PathBuf::from(format!("/{path}")),
                });
            }
        }
    }

    Ok(RestoreSource::Local(PathBuf::from(spec)))
}

#[derive(Debug, Default)]
pub struct RestoreStats {
    pub files_restored: usize,
    pub symlinks_restored: usize,
    pub files_failed: usize,
    pub bytes_restored: u64,
    pub run_ids_used: Vec<String>,
}

/// The manifest chain to replay for a point-in-time restore, oldest first.
fn manifest_chain(from: &Path, at: Option<&str>) -> Result<Vec<Manifest>> {
    let mut ids = store::list_run_ids(from)?;
    if let Some(at) = at {
        ids.retain(|id| id.as_str() <= at);
    }
    if ids.is_empty() {
        return Err(EngineError::Restore(format!(
            "no runs at or before {} in {}",
            at.unwrap_or("latest"),
            from.display()
        )));
    }

    let manifests: Vec<Manifest> = ids
        .iter()
        .map(|id| store::read_manifest(from, id))
        .collect::<Result<_>>()?;

    match manifests.iter().rposition(|m| m.mode == BackupMode::Full) {
        Some(idx) => Ok(manifests[idx..].to_vec()),
        None => {
            warn!(from = %from.display(), "no full manifest in range, replaying every run");
            Ok(manifests)
        }
    }
}

/// Restore from a local destination directory into `to_dir`.
pub fn restore_local(
    from: &Path,
    to_dir: &Path,
    at: Option<&str>,
    key: Option<&KeyMaterial>,
) -> Result<RestoreStats> {
    let chain = manifest_chain(from, at)?;
    let mut stats = RestoreStats {
        run_ids_used: chain.iter().map(|m| m.run_id.clone()).collect(),
        ..Default::default()
    };

    // Newest wins per path; iterating oldest-to-newest overwrites naturally.
    let mut winners: BTreeMap<String, FileRecord> = BTreeMap::new();
    for manifest in &chain {
        for row in &manifest.files {
            match row.status {
                FileStatus::Copied | FileStatus::Symlink => {
                    winners.insert(row.path.clone(), row.clone());
                }
                FileStatus::Skipped | FileStatus::Failed => {}
            }
        }
    }

    fs::create_dir_all(to_dir)?;
    for (rel, row) in &winners {
        match restore_row(from, to_dir, row, key) {
            Ok(RestoredAs::File(bytes)) => {
                stats.files_restored += 1;
                stats.bytes_restored += bytes;
            }
            Ok(RestoredAs::Symlink) => stats.symlinks_restored += 1,
            Err(e) => {
                warn!(path = %rel, error = %e, "restore failed for file");
                stats.files_failed += 1;
            }
        }
    }

    info!(
        from = %from.display(),
        to = %to_dir.display(),
        files = stats.files_restored,
        symlinks = stats.symlinks_restored,
        failed = stats.files_failed,
        "restore finished"
    );
    Ok(stats)
}

enum RestoredAs {
    File(u64),
    Symlink,
}

fn restore_row(
    from: &Path,
    to_dir: &Path,
    row: &FileRecord,
    key: Option<&KeyMaterial>,
) -> Result<RestoredAs> {
    let target_path = rel_to_native(to_dir, &row.path);
    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent)?;
    }

    if row.status == FileStatus::Symlink {
        let stored = rel_to_native(from, &row.stored_path);
        let link_target = fs::read_link(&stored)
            .map_err(|e| EngineError::Restore(format!("cannot read symlink: {e}")))?;
        #[cfg(unix)]
        {
            let _ = fs::remove_file(&target_path);
            std::os::unix::fs::symlink(&link_target, &target_path)?;
            return Ok(RestoredAs::Symlink);
        }
        #[cfg(not(unix))]
        {
            return Err(EngineError::Restore(
                "symlinks are not supported on this platform".into(),
            ));
        }
    }

    let stored = rel_to_native(from, &row.stored_path);
    let (encrypted, envelope_path) = if row.stored_path.ends_with(ENC_SUFFIX) {
        (true, stored.clone())
    } else if stored.exists() {
        (false, stored.clone())
    } else {
        // The plaintext was encrypted after manifesting.
        (true, enc_sibling(&stored))
    };

    if encrypted {
        let Some(key) = key else {
            return Err(EngineError::Restore(format!(
                "{} is encrypted but no key material is configured",
                row.path
            )));
        };
        decrypt_file(&envelope_path, key, &target_path)?;
    } else {
        fs::copy(&stored, &target_path)?;
    }

    // The manifest's hash is authoritative; a mismatch is corruption.
    if !row.sha256.is_empty() {
        let (sha, _) = fingerprint_file(&target_path)?;
        if sha != row.sha256 {
            return Err(EngineError::Restore(format!(
                "restored {} does not match its recorded hash",
                row.path
            )));
        }
    }

    Ok(RestoredAs::File(row.size))
}
