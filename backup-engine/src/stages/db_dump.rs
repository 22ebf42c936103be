//! Database dump stage.
//!
//! Spawns the configured external dump tool with the password handed over
//! through the environment, never argv. The artifact is staged under the
//! first local destination and from that point on is an ordinary file of the
//! run: it is manifested, fanned out, encrypted, deduplicated and pruned
//! like everything else.

use std::path::Path;
use std::process::Stdio;

use chrono::Local;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::DbDumpConfig;
use crate::dest::rel_to_native;
use crate::error::{EngineError, Result};
use crate::fs::walker::SourceFile;

/// Directory inside the first local destination the artifact lands in.
const STAGING_SUBDIR: &str = "db_dump";

/// Relative path of the staged artifact for a run.
pub fn staged_rel_path(cfg: &DbDumpConfig, run_id: &str) -> String {
    let name = cfg.artifact_name.replace("<run-id>", run_id);
    format!("{STAGING_SUBDIR}/{name}")
}

/// Run the dump tool, staging its stdout under `staging_root`. The returned
/// record participates in the run like any walked source file.
pub async fn produce_dump(
    cfg: &DbDumpConfig,
    staging_root: &Path,
    run_id: &str,
) -> Result<SourceFile> {
    let rel = staged_rel_path(cfg, run_id);
    let abs = rel_to_native(staging_root, &rel);
    if let Some(parent) = abs.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let out_file = std::fs::File::create(&abs)?;
    info!(command = %cfg.dump_command, artifact = %abs.display(), "producing database dump");

    let output = Command::new(&cfg.dump_command)
        .args(&cfg.dump_args)
        .env(&cfg.password_env, &cfg.password)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out_file))
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(status = %output.status, stderr = %stderr.trim(), "dump tool failed");
        let _ = std::fs::remove_file(&abs);
        return Err(EngineError::Selection(format!(
            "dump command {} exited with {}",
            cfg.dump_command, output.status
        )));
    }

    let size = std::fs::metadata(&abs)?.len();
    info!(artifact = %abs.display(), bytes = size, "database dump staged");

    Ok(SourceFile {
        rel_path: rel,
        abs_path: abs,
        size,
        mtime: Local::now(),
        symlink_target: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dump_cfg(command: &str, args: &[&str]) -> DbDumpConfig {
        DbDumpConfig {
            dump_command: command.to_string(),
            dump_args: args.iter().map(|s| s.to_string()).collect(),
            artifact_name: "dump_<run-id>.sql".to_string(),
            password_env: "DB_PASSWORD".to_string(),
            password: "s3cret".to_string(),
        }
    }

    #[test]
    fn staged_path_substitutes_the_run_id() {
        let cfg = dump_cfg("pg_dump", &[]);
        assert_eq!(
            staged_rel_path(&cfg, "20260101_000000"),
            "db_dump/dump_20260101_000000.sql"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stages_stdout_as_the_artifact() {
        let staging = TempDir::new().unwrap();
        // The password must arrive via the environment, not argv.
        let cfg = dump_cfg("sh", &["-c", "printf \"dump-of:$DB_PASSWORD\""]);

        let file = produce_dump(&cfg, staging.path(), "20260101_000000")
            .await
            .unwrap();

        assert_eq!(file.rel_path, "db_dump/dump_20260101_000000.sql");
        assert_eq!(
            std::fs::read_to_string(&file.abs_path).unwrap(),
            "dump-of:s3cret"
        );
        assert_eq!(file.size, 14);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_tool_removes_the_partial_artifact() {
        let staging = TempDir::new().unwrap();
        let cfg = dump_cfg("sh", &["-c", "echo partial; exit 3"]);

        let err = produce_dump(&cfg, staging.path(), "20260101_000000").await;
        assert!(err.is_err());
        assert!(!staging
            .path()
            .join("db_dump/dump_20260101_000000.sql")
            .exists());
    }
}
