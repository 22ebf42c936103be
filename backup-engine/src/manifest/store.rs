//! Reading and writing manifests on a local destination.
//!
//! Writes are atomic: serialize to a temp name in the destination root, then
//! rename. Reads sort file names lexicographically, which is chronological
//! because run ids are zero-padded.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{manifest_file_name, run_id_from_file_name, BackupMode, Manifest};
use crate::error::Result;

/// Write a manifest atomically into `dest_root`, returning its final path.
pub fn write_manifest(dest_root: &Path, manifest: &Manifest) -> Result<PathBuf> {
    fs::create_dir_all(dest_root)?;

    let final_path = dest_root.join(manifest_file_name(&manifest.run_id));
    let tmp_path = dest_root.join(format!(".{}.tmp", manifest_file_name(&manifest.run_id)));

    let json = serde_json::to_vec_pretty(manifest)?;
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, &final_path)?;

    debug!(run_id = %manifest.run_id, path = %final_path.display(), "manifest written");
    Ok(final_path)
}

/// All run ids present in `dest_root`, ascending. A missing directory means
/// no prior runs, not an error.
pub fn list_run_ids(dest_root: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dest_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ids: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name();
            run_id_from_file_name(&name.to_string_lossy()).map(str::to_string)
        })
        .collect();
    ids.sort();
    Ok(ids)
}

/// Read the manifest for a specific run id.
pub fn read_manifest(dest_root: &Path, run_id: &str) -> Result<Manifest> {
    let path = dest_root.join(manifest_file_name(run_id));
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Latest manifest of any mode, or `None` when the destination has no runs.
pub fn latest_manifest(dest_root: &Path) -> Result<Option<Manifest>> {
    match list_run_ids(dest_root)?.last() {
        Some(id) => Ok(Some(read_manifest(dest_root, id)?)),
        None => Ok(None),
    }
}

/// Latest manifest whose mode is `full`.
pub fn latest_full_manifest(dest_root: &Path) -> Result<Option<Manifest>> {
    for id in list_run_ids(dest_root)?.iter().rev() {
        let manifest = read_manifest(dest_root, id)?;
        if manifest.mode == BackupMode::Full {
            return Ok(Some(manifest));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{FileRecord, FileStatus};
    use chrono::Local;
    use tempfile::TempDir;

    fn sample_manifest(run_id: &str, mode: BackupMode) -> Manifest {
        Manifest {
            run_id: run_id.to_string(),
            mode,
            source_root: "/src".into(),
            destination_root: "/dst".into(),
            started_at: Local::now(),
            finished_at: Local::now(),
            files: vec![FileRecord {
                path: "a.txt".into(),
                stored_path: "a.txt".into(),
                size: 1,
                sha256: "0".repeat(64),
                status: FileStatus::Copied,
                error: None,
            }],
        }
    }

    #[test]
    fn missing_dir_means_no_prior_runs() {
        let tmp = TempDir::new().unwrap();
        let ids = list_run_ids(&tmp.path().join("never-created")).unwrap();
        assert!(ids.is_empty());
        assert!(latest_manifest(&tmp.path().join("never-created"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn write_then_read_back() {
        let tmp = TempDir::new().unwrap();
        let m = sample_manifest("20260101_000000", BackupMode::Full);
        write_manifest(tmp.path(), &m).unwrap();

        let back = read_manifest(tmp.path(), "20260101_000000").unwrap();
        assert_eq!(back.run_id, m.run_id);
        assert_eq!(back.files.len(), 1);
        assert_eq!(back.files[0].status, FileStatus::Copied);

        // No temp file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn latest_sorts_chronologically() {
        let tmp = TempDir::new().unwrap();
        write_manifest(tmp.path(), &sample_manifest("20260102_000000", BackupMode::Incremental))
            .unwrap();
        write_manifest(tmp.path(), &sample_manifest("20260101_000000", BackupMode::Full)).unwrap();
        write_manifest(tmp.path(), &sample_manifest("20260103_000000", BackupMode::Incremental))
            .unwrap();

        let latest = latest_manifest(tmp.path()).unwrap().unwrap();
        assert_eq!(latest.run_id, "20260103_000000");

        let full = latest_full_manifest(tmp.path()).unwrap().unwrap();
        assert_eq!(full.run_id, "20260101_000000");
    }
}
