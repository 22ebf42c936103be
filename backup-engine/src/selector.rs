//! Run selection: which source files participate this run.
//!
//! The walker produces the candidate set; this module applies the backup
//! mode against the destination's manifest history. Destinations that
//! disagree on "latest" are each evaluated independently, so selection takes
//! the baselines for one destination at a time.

use chrono::NaiveDateTime;

use crate::fs::walker::SourceFile;
use crate::manifest::{parse_run_id, BackupMode, Manifest};

/// Select the files to attempt for one destination.
///
/// - `full`: everything.
/// - `incremental`: mtime strictly after the latest run's start, or absent
///   from the latest manifest.
/// - `differential`: same rule against the latest `full` manifest.
///
/// With no baseline manifest every mode degrades to a full selection. The
/// input is already sorted by relative path and order is preserved.
pub fn select_files(
    candidates: &[SourceFile],
    mode: BackupMode,
    latest: Option<&Manifest>,
    latest_full: Option<&Manifest>,
) -> Vec<SourceFile> {
    let baseline = match mode {
        BackupMode::Full => None,
        BackupMode::Incremental => latest,
        BackupMode::Differential => latest_full,
    };

    let Some(baseline) = baseline else {
        return candidates.to_vec();
    };
    let Some(threshold) = parse_run_id(&baseline.run_id) else {
        return candidates.to_vec();
    };

    let known_paths = baseline.path_set();
    candidates
        .iter()
        .filter(|f| changed_since(f, threshold) || !known_paths.contains(f.rel_path.as_str()))
        .cloned()
        .collect()
}

fn changed_since(file: &SourceFile, threshold: NaiveDateTime) -> bool {
    file.mtime.naive_local() > threshold
}
