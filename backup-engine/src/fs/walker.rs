//! Source tree traversal.
//!
//! Walks the source root without following symlinks and produces one
//! [`SourceFile`] per regular file or symlink. Relative paths are
//! forward-slash normalized and never escape the root; exclude globs are
//! matched against those relative paths.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{EngineError, Result};

/// One file the selector can hand to the copiers.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the source root, forward-slash separated.
    pub rel_path: String,

    /// Absolute path on the local file system.
    pub abs_path: PathBuf,

    /// Size in bytes (0 for symlinks).
    pub size: u64,

    /// Last modification time, local clock.
    pub mtime: DateTime<Local>,

    /// Link target when the entry is a symlink. Symlinks are recorded, never
    /// dereferenced.
    pub symlink_target: Option<PathBuf>,
}

impl SourceFile {
    pub fn is_symlink(&self) -> bool {
        self.symlink_target.is_some()
    }
}

/// Compile exclude globs once per run.
pub fn build_exclude_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| EngineError::Config(format!("bad exclude glob {pattern:?}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| EngineError::Config(format!("exclude globs: {e}")))
}

/// Forward-slash form of a path relative to `root`.
fn relative_slash_path(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Walk `root` and collect every regular file and symlink that survives the
/// exclude set, sorted lexicographically by relative path.
///
/// An unreadable root is fatal for the run; an unreadable entry below it is
/// logged and skipped.
pub fn walk_source(root: &Path, excludes: &GlobSet) -> Result<Vec<SourceFile>> {
    if !root.is_dir() {
        return Err(EngineError::Selection(format!(
            "source directory {} is not readable",
            root.display()
        )));
    }

    let mut files = Vec::new();

    let walker = WalkDir::new(root).follow_links(false).into_iter();
    let walker = walker.filter_entry(|entry| {
        // Prune excluded directories so the walk never descends into them.
        match relative_slash_path(entry.path(), root) {
            Some(rel) => !excludes.is_match(&rel),
            None => true, // the root itself
        }
    });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }

        let Some(rel_path) = relative_slash_path(entry.path(), root) else {
            continue;
        };
        if excludes.is_match(&rel_path) {
            continue;
        }

        let meta = match entry.path().symlink_metadata() {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "skipping: cannot stat");
                continue;
            }
        };

        let mtime: DateTime<Local> = meta
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Local::now());

        if meta.file_type().is_symlink() {
            let target = match std::fs::read_link(entry.path()) {
                Ok(target) => target,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "skipping: unreadable symlink");
                    continue;
                }
            };
            files.push(SourceFile {
                rel_path,
                abs_path: entry.path().to_path_buf(),
                size: 0,
                mtime,
                symlink_target: Some(target),
            });
        } else if meta.is_file() {
            files.push(SourceFile {
                rel_path,
                abs_path: entry.path().to_path_buf(),
                size: meta.len(),
                mtime,
                symlink_target: None,
            });
        }
        // Sockets, fifos and other special files are not backed up.
    }

    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(files)
}
