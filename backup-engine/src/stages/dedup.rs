//! Content-addressed hardlink deduplication.
//!
//! Runs after encryption, across every local destination that shares a
//! filesystem. Files are grouped by plaintext SHA-256: manifest rows supply
//! the hash for anything a run produced (which is how two `.enc` envelopes
//! of identical plaintexts end up in one group despite differing
//! ciphertexts), and unmanifested plain files are hashed on demand. The
//! lexicographically smallest absolute path owns the content; every other
//! member becomes a hardlink to it via link + rename, verified by inode
//! identity. Across filesystems the stage degrades to a logged no-op.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::fs::checksum::fingerprint_file;
use crate::manifest::{store, ENC_SUFFIX, MANIFEST_PREFIX};

#[derive(Debug, Default)]
pub struct DedupStats {
    pub groups: usize,
    pub files_linked: usize,
    pub bytes_saved: u64,
}

#[cfg(unix)]
pub fn dedup_destinations(local_roots: &[PathBuf]) -> Result<DedupStats> {
    use std::os::unix::fs::MetadataExt;

    let mut stats = DedupStats::default();

    // (device, content hash) -> member paths. Keying by device keeps
    // cross-filesystem pairs out of the same group by construction.
    let mut groups: HashMap<(u64, String), Vec<PathBuf>> = HashMap::new();
    // content hash -> devices it was seen on, to log the degradation.
    let mut devices_by_hash: HashMap<String, Vec<u64>> = HashMap::new();

    for root in local_roots {
        let hashes = manifest_hashes(root)?;

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "dedup scan: skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let name = path.file_name().unwrap_or_default().to_string_lossy();
            if name.starts_with(MANIFEST_PREFIX) {
                continue;
            }

            let rel = match relative_slash(path, root) {
                Some(rel) => rel,
                None => continue,
            };

            let hash = match hashes.get(&rel) {
                Some(sha) => sha.clone(),
                None if name.ends_with(ENC_SUFFIX) => {
                    // An envelope with no manifest row: its plaintext hash is
                    // unknowable, so it cannot join any group.
                    continue;
                }
                None => match fingerprint_file(path) {
                    Ok((sha, _)) => sha,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "dedup: cannot hash");
                        continue;
                    }
                },
            };

            let dev = match entry.metadata() {
                Ok(meta) => meta.dev(),
                Err(_) => continue,
            };

            let devs = devices_by_hash.entry(hash.clone()).or_default();
            if !devs.contains(&dev) {
                devs.push(dev);
            }

            groups
                .entry((dev, hash))
                .or_default()
                .push(path.to_path_buf());
        }
    }

    for (hash, devs) in &devices_by_hash {
        if devs.len() > 1 {
            debug!(hash = %hash, "duplicate content spans filesystems, not linkable");
        }
    }

    for ((_, _), mut members) in groups {
        if members.len() < 2 {
            continue;
        }
        members.sort();
        stats.groups += 1;

        let canonical = members[0].clone();
        let canonical_ino = match std::fs::metadata(&canonical) {
            Ok(meta) => meta.ino(),
            Err(e) => {
                warn!(path = %canonical.display(), error = %e, "dedup: canonical vanished");
                continue;
            }
        };

        for member in &members[1..] {
            match std::fs::metadata(member) {
                Ok(meta) if meta.ino() == canonical_ino => continue, // already linked
                Ok(meta) => {
                    match link_over(&canonical, member) {
                        Ok(()) => {
                            // The replacement must not have changed identity.
                            match std::fs::metadata(member) {
                                Ok(after) if after.ino() == canonical_ino => {
                                    stats.files_linked += 1;
                                    stats.bytes_saved += meta.len();
                                }
                                _ => warn!(path = %member.display(), "dedup: inode check failed"),
                            }
                        }
                        Err(e) => {
                            warn!(path = %member.display(), error = %e, "dedup: link failed");
                        }
                    }
                }
                Err(_) => continue,
            }
        }
    }

    info!(
        groups = stats.groups,
        linked = stats.files_linked,
        bytes_saved = stats.bytes_saved,
        "dedup stage finished"
    );
    Ok(stats)
}

/// Atomic replacement: hardlink to a temp name in the same directory, then
/// rename over the duplicate.
#[cfg(unix)]
fn link_over(canonical: &Path, member: &Path) -> std::io::Result<()> {
    let tmp = member.with_file_name(format!(
        ".{}.dedup-tmp",
        member.file_name().unwrap_or_default().to_string_lossy()
    ));
    let _ = std::fs::remove_file(&tmp);
    std::fs::hard_link(canonical, &tmp)?;
    std::fs::rename(&tmp, member)
}

/// stored_path -> plaintext sha256 for every manifest at this root.
fn manifest_hashes(root: &Path) -> Result<HashMap<String, String>> {
    let mut hashes = HashMap::new();
    for run_id in store::list_run_ids(root)? {
        let manifest = match store::read_manifest(root, &run_id) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "dedup: unreadable manifest");
                continue;
            }
        };
        for row in &manifest.files {
            if !row.sha256.is_empty() {
                hashes.insert(row.stored_path.clone(), row.sha256.clone());
            }
        }
    }
    Ok(hashes)
}

fn relative_slash(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(not(unix))]
pub fn dedup_destinations(_local_roots: &[PathBuf]) -> Result<DedupStats> {
    info!("dedup is a no-op on this platform");
    Ok(DedupStats::default())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::manifest::{BackupMode, FileRecord, FileStatus, Manifest};
    use chrono::Local;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    fn manifest_with(dest: &Path, run_id: &str, rows: &[(&str, &str)]) {
        let m = Manifest {
            run_id: run_id.to_string(),
            mode: BackupMode::Full,
            source_root: "/src".into(),
            destination_root: dest.display().to_string(),
            started_at: Local::now(),
            finished_at: Local::now(),
            files: rows
                .iter()
                .map(|(path, sha)| FileRecord {
                    path: path.trim_end_matches(".enc").to_string(),
                    stored_path: path.to_string(),
                    size: 0,
                    sha256: sha.to_string(),
                    status: FileStatus::Copied,
                    error: None,
                })
                .collect(),
        };
        store::write_manifest(dest, &m).unwrap();
    }

    fn inode(path: &Path) -> u64 {
        std::fs::metadata(path).unwrap().ino()
    }

    #[test]
    fn identical_plain_files_share_an_inode() {
        let dest = TempDir::new().unwrap();
        std::fs::write(dest.path().join("x"), vec![9u8; 4096]).unwrap();
        std::fs::write(dest.path().join("y"), vec![9u8; 4096]).unwrap();

        let stats = dedup_destinations(&[dest.path().to_path_buf()]).unwrap();
        assert_eq!(stats.files_linked, 1);
        assert_eq!(inode(&dest.path().join("x")), inode(&dest.path().join("y")));
        // Content is unchanged.
        assert_eq!(std::fs::read(dest.path().join("y")).unwrap(), vec![9u8; 4096]);
    }

    #[test]
    fn envelopes_group_by_manifest_plaintext_hash() {
        let dest = TempDir::new().unwrap();
        // Different ciphertext bytes, same recorded plaintext hash.
        std::fs::write(dest.path().join("x.enc"), b"envelope-one").unwrap();
        std::fs::write(dest.path().join("y.enc"), b"envelope-two").unwrap();
        manifest_with(
            dest.path(),
            "20260101_000000",
            &[("x.enc", "aaaa"), ("y.enc", "aaaa")],
        );

        let stats = dedup_destinations(&[dest.path().to_path_buf()]).unwrap();
        assert_eq!(stats.files_linked, 1);
        assert_eq!(
            inode(&dest.path().join("x.enc")),
            inode(&dest.path().join("y.enc"))
        );
    }

    #[test]
    fn unmanifested_envelopes_are_left_alone() {
        let dest = TempDir::new().unwrap();
        std::fs::write(dest.path().join("a.enc"), b"same").unwrap();
        std::fs::write(dest.path().join("b.enc"), b"same").unwrap();

        let stats = dedup_destinations(&[dest.path().to_path_buf()]).unwrap();
        assert_eq!(stats.files_linked, 0);
        assert_ne!(inode(&dest.path().join("a.enc")), inode(&dest.path().join("b.enc")));
    }

    #[test]
    fn manifests_are_never_candidates() {
        let dest = TempDir::new().unwrap();
        manifest_with(dest.path(), "20260101_000000", &[]);
        manifest_with(dest.path(), "20260102_000000", &[]);

        let stats = dedup_destinations(&[dest.path().to_path_buf()]).unwrap();
        assert_eq!(stats.files_linked, 0);
    }

    #[test]
    fn cross_directory_dedup_within_one_filesystem() {
        let base = TempDir::new().unwrap();
        let d1 = base.path().join("d1");
        let d2 = base.path().join("d2");
        std::fs::create_dir_all(&d1).unwrap();
        std::fs::create_dir_all(&d2).unwrap();
        std::fs::write(d1.join("f"), b"shared-content").unwrap();
        std::fs::write(d2.join("f"), b"shared-content").unwrap();

        let stats = dedup_destinations(&[d1.clone(), d2.clone()]).unwrap();
        assert_eq!(stats.files_linked, 1);
        assert_eq!(inode(&d1.join("f")), inode(&d2.join("f")));
    }
}
