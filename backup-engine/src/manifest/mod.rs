//! Manifest value types.
//!
//! A manifest is the authoritative record of what one run produced at one
//! destination. It is persisted as `backup_manifest_<run-id>.json` in the
//! destination root, is never encrypted, and is consumed unchanged by the
//! verifier, the retention stage and the restore reader.

pub mod store;

use chrono::{DateTime, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// File name prefix shared by every manifest.
pub const MANIFEST_PREFIX: &str = "backup_manifest_";

/// Suffix appended to a stored path by the encryption stage.
pub const ENC_SUFFIX: &str = ".enc";

/// Selection policy for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Full,
    Incremental,
    Differential,
}

impl std::fmt::Display for BackupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupMode::Full => write!(f, "full"),
            BackupMode::Incremental => write!(f, "incremental"),
            BackupMode::Differential => write!(f, "differential"),
        }
    }
}

impl std::str::FromStr for BackupMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupMode::Full),
            "incremental" => Ok(BackupMode::Incremental),
            "differential" => Ok(BackupMode::Differential),
            other => Err(format!("unknown backup mode: {other}")),
        }
    }
}

/// Outcome of one file within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Copied,
    Skipped,
    Failed,
    Symlink,
}

/// One row of a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Relative path under the source root, forward-slash normalized.
    pub path: String,
    /// Final on-destination path; differs from `path` when encrypted.
    pub stored_path: String,
    /// Plaintext size in bytes.
    pub size: u64,
    /// SHA-256 of the plaintext content (empty for symlinks and failures).
    pub sha256: String,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-run, per-destination manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub mode: BackupMode,
    pub source_root: String,
    pub destination_root: String,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub files: Vec<FileRecord>,
}

impl Manifest {
    /// Paths of this manifest, for membership tests during selection.
    pub fn path_set(&self) -> HashSet<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }

    /// Stored paths of every non-failed row.
    pub fn stored_paths(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .filter(|f| f.status != FileStatus::Failed)
            .map(|f| f.stored_path.as_str())
    }
}

/// Produce a run identifier from the local clock: `YYYYMMDD_HHMMSS`.
///
/// Zero padding makes lexicographic order chronological, which is what the
/// store relies on to find the latest run.
pub fn run_id_now() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Parse a run identifier back into its local start time.
pub fn parse_run_id(run_id: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(run_id, "%Y%m%d_%H%M%S").ok()
}

/// Manifest file name for a run.
pub fn manifest_file_name(run_id: &str) -> String {
    format!("{MANIFEST_PREFIX}{run_id}.json")
}

/// Extract the run id from a manifest file name, if it is one.
pub fn run_id_from_file_name(name: &str) -> Option<&str> {
    name.strip_prefix(MANIFEST_PREFIX)?.strip_suffix(".json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_round_trips() {
        let id = "20260102_030405";
        let t = parse_run_id(id).unwrap();
        assert_eq!(t.format("%Y%m%d_%H%M%S").to_string(), id);
    }

    #[test]
    fn run_id_rejects_garbage() {
        assert!(parse_run_id("not-a-run-id").is_none());
        assert!(parse_run_id("20261301_000000").is_none());
    }

    #[test]
    fn manifest_file_name_round_trips() {
        let name = manifest_file_name("20260101_120000");
        assert_eq!(name, "backup_manifest_20260101_120000.json");
        assert_eq!(run_id_from_file_name(&name), Some("20260101_120000"));
        assert_eq!(run_id_from_file_name("something_else.json"), None);
    }

    #[test]
    fn status_serializes_lowercase() {
        let rec = FileRecord {
            path: "a.txt".into(),
            stored_path: "a.txt".into(),
            size: 3,
            sha256: "abc".into(),
            status: FileStatus::Copied,
            error: None,
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"status\":\"copied\""));
        assert!(!json.contains("error"));
    }
}
