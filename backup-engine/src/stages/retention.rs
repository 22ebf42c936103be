//! Retention: prune old runs by age and/or count.
//!
//! A run is the set of stored paths one manifest lists plus the manifest
//! itself. Because dedup hardlinks files and older runs may reference the
//! same stored paths, deletion works on the set difference between the
//! doomed run's paths and the union of every surviving manifest's paths.

use std::collections::HashSet;
use std::path::Path;

use chrono::{Duration, Local};
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::dest::rel_to_native;
use crate::error::Result;
use crate::manifest::{manifest_file_name, parse_run_id, store};

#[derive(Debug, Default)]
pub struct RetentionStats {
    pub runs_pruned: usize,
    pub files_deleted: usize,
}

/// Apply both rules to one local destination. `max_age_days == 0` and
/// `max_count == 0` together make the stage a no-op.
pub fn apply_retention(dest_root: &Path, cfg: &RetentionConfig) -> Result<RetentionStats> {
    let mut stats = RetentionStats::default();
    if cfg.is_noop() {
        return Ok(stats);
    }

    let run_ids = store::list_run_ids(dest_root)?;
    if run_ids.is_empty() {
        return Ok(stats);
    }

    let mut doomed: HashSet<String> = HashSet::new();

    if cfg.max_age_days > 0 {
        let cutoff = Local::now().naive_local() - Duration::days(i64::from(cfg.max_age_days));
        for id in &run_ids {
            match parse_run_id(id) {
                Some(start) if start < cutoff => {
                    doomed.insert(id.clone());
                }
                Some(_) => {}
                None => warn!(run_id = %id, "retention: unparseable run id, leaving in place"),
            }
        }
    }

    if cfg.max_count > 0 && run_ids.len() > cfg.max_count as usize {
        let cut = run_ids.len() - cfg.max_count as usize;
        for id in &run_ids[..cut] {
            doomed.insert(id.clone());
        }
    }

    if doomed.is_empty() {
        return Ok(stats);
    }

    // Paths any surviving manifest still references must outlive the prune.
    let mut kept_paths: HashSet<String> = HashSet::new();
    for id in &run_ids {
        if doomed.contains(id) {
            continue;
        }
        let manifest = store::read_manifest(dest_root, id)?;
        kept_paths.extend(manifest.stored_paths().map(str::to_string));
    }

    for id in &run_ids {
        if !doomed.contains(id) {
            continue;
        }
        let manifest = match store::read_manifest(dest_root, id) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(run_id = %id, error = %e, "retention: unreadable manifest, skipping run");
                continue;
            }
        };

        for stored in manifest.stored_paths() {
            if kept_paths.contains(stored) {
                debug!(path = %stored, "retention: still referenced, kept");
                continue;
            }
            let path = rel_to_native(dest_root, stored);
            match std::fs::remove_file(&path) {
                Ok(()) => stats.files_deleted += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    // Permission problems are logged and skipped, never fatal.
                    warn!(path = %path.display(), error = %e, "retention: cannot delete");
                }
            }
        }

        let manifest_path = dest_root.join(manifest_file_name(id));
        match std::fs::remove_file(&manifest_path) {
            Ok(()) => {
                stats.runs_pruned += 1;
                info!(run_id = %id, dest = %dest_root.display(), "run pruned");
            }
            Err(e) => {
                warn!(run_id = %id, error = %e, "retention: cannot delete manifest");
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{BackupMode, FileRecord, FileStatus, Manifest};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_run(dest: &Path, run_id: &str, files: &[&str]) {
        for rel in files {
            let path = rel_to_native(dest, rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&path, run_id.as_bytes()).unwrap();
        }
        let m = Manifest {
            run_id: run_id.to_string(),
            mode: BackupMode::Full,
            source_root: "/src".into(),
            destination_root: dest.display().to_string(),
            started_at: Local::now(),
            finished_at: Local::now(),
            files: files
                .iter()
                .map(|rel| FileRecord {
                    path: rel.to_string(),
                    stored_path: rel.to_string(),
                    size: run_id.len() as u64,
                    sha256: "x".into(),
                    status: FileStatus::Copied,
                    error: None,
                })
                .collect(),
        };
        store::write_manifest(dest, &m).unwrap();
    }

    fn run_ids(dest: &Path) -> Vec<String> {
        store::list_run_ids(dest).unwrap()
    }

    #[test]
    fn zero_zero_is_a_noop() {
        let dest = TempDir::new().unwrap();
        write_run(dest.path(), "20200101_000000", &["old.txt"]);

        let cfg = RetentionConfig {
            max_age_days: 0,
            max_count: 0,
        };
        let stats = apply_retention(dest.path(), &cfg).unwrap();
        assert_eq!(stats.runs_pruned, 0);
        assert!(dest.path().join("old.txt").exists());
    }

    #[test]
    fn count_rule_keeps_the_newest() {
        let dest = TempDir::new().unwrap();
        write_run(dest.path(), "20260101_000000", &["a/1.txt"]);
        write_run(dest.path(), "20260102_000000", &["a/2.txt"]);
        write_run(dest.path(), "20260103_000000", &["a/3.txt"]);

        let cfg = RetentionConfig {
            max_age_days: 0,
            max_count: 2,
        };
        let stats = apply_retention(dest.path(), &cfg).unwrap();
        assert_eq!(stats.runs_pruned, 1);
        assert_eq!(
            run_ids(dest.path()),
            vec!["20260102_000000", "20260103_000000"]
        );
        assert!(!dest.path().join("a/1.txt").exists());
        assert!(dest.path().join("a/2.txt").exists());
    }

    #[test]
    fn age_rule_prunes_old_runs() {
        let dest = TempDir::new().unwrap();
        write_run(dest.path(), "20200101_000000", &["ancient.txt"]);
        let recent = crate::manifest::run_id_now();
        write_run(dest.path(), &recent, &["fresh.txt"]);

        let cfg = RetentionConfig {
            max_age_days: 30,
            max_count: 0,
        };
        let stats = apply_retention(dest.path(), &cfg).unwrap();
        assert_eq!(stats.runs_pruned, 1);
        assert_eq!(run_ids(dest.path()), vec![recent]);
        assert!(!dest.path().join("ancient.txt").exists());
        assert!(dest.path().join("fresh.txt").exists());
    }

    #[test]
    fn shared_paths_survive_while_referenced() {
        let dest = TempDir::new().unwrap();
        // Both runs list the same stored path (unchanged file, later full).
        write_run(dest.path(), "20260101_000000", &["shared.txt", "only-old.txt"]);
        write_run(dest.path(), "20260102_000000", &["shared.txt"]);

        let cfg = RetentionConfig {
            max_age_days: 0,
            max_count: 1,
        };
        apply_retention(dest.path(), &cfg).unwrap();

        assert!(dest.path().join("shared.txt").exists());
        assert!(!dest.path().join("only-old.txt").exists());
        let survivors: Vec<PathBuf> = vec![dest.path().join(manifest_file_name("20260102_000000"))];
        for path in survivors {
            assert!(path.exists());
        }
    }
}
