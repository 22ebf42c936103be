//! SFTP copier: one authenticated session per remote host.
//!
//! Host keys are checked against `~/.ssh/known_hosts`; an unknown or
//! mismatched key is warned about and surfaces as a connection failure,
//! never silently trusted. Uploads are chunked, optionally throttled to a
//! KB/s cap over a short sliding window, and retried a bounded number of
//! times on transient transport errors. Authentication errors are not
//! retried. Everything here blocks; callers run it under `spawn_blocking`.

use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ssh2::{CheckResult, KnownHostFileKind, Session, Sftp};
use tracing::{debug, info, warn};

use crate::config::SshServer;
use crate::error::{EngineError, Result};
use crate::fs::checksum::fingerprint_file;
use crate::fs::walker::SourceFile;
use crate::manifest::{manifest_file_name, run_id_from_file_name, FileRecord, FileStatus, Manifest};

/// Upload chunk size.
const CHUNK_SIZE: usize = 32 * 1024;

/// Bounded retries for transient transport errors.
const MAX_ATTEMPTS: u32 = 3;

/// Base backoff between attempts; doubles each retry.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Throttles writes to a byte budget measured over a short sliding window.
pub struct Throttle {
    bytes_per_sec: u64,
    window_start: Instant,
    window_bytes: u64,
}

impl Throttle {
    /// `limit_kbps == 0` disables the cap.
    pub fn new(limit_kbps: u64) -> Self {
        Self {
            bytes_per_sec: limit_kbps * 1024,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    /// Account `n` bytes and sleep if the window is ahead of budget.
    pub fn consume(&mut self, n: u64) {
        if self.bytes_per_sec == 0 {
            return;
        }
        self.window_bytes += n;

        let elapsed = self.window_start.elapsed();
        let expected = Duration::from_secs_f64(self.window_bytes as f64 / self.bytes_per_sec as f64);
        if expected > elapsed {
            std::thread::sleep(expected - elapsed);
        }

        // Reset the window every second so a stall does not bank credit.
        if self.window_start.elapsed() >= Duration::from_secs(1) {
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
    }
}

/// One live session against one host.
pub struct SftpCopier {
    session: Session,
    sftp: Sftp,
    server: SshServer,
    throttle: Throttle,
}

impl SftpCopier {
    /// Connect, verify the host key, authenticate, open the SFTP channel.
    pub fn connect(server: &SshServer) -> Result<Self> {
        let addr = format!("{}:{}", server.host, server.port);
        info!(host = %addr, "opening SFTP session");

        let tcp = TcpStream::connect(&addr)?;
        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;

        verify_host_key(&session, &server.host, server.port)?;
        authenticate(&session, server)?;

        let sftp = session.sftp()?;
        Ok(Self {
            session,
            sftp,
            server: server.clone(),
            throttle: Throttle::new(server.bandwidth_limit_kbps),
        })
    }

    fn remote_path(&self, rel: &str) -> PathBuf {
        let mut path = self.server.remote_dir.clone();
        for part in rel.split('/') {
            path.push(part);
        }
        path
    }

    /// `mkdir -p` equivalent: create each missing ancestor, ignoring
    /// already-exists errors.
    fn ensure_parent_dirs(&self, remote: &Path) -> Result<()> {
        let Some(parent) = remote.parent() else {
            return Ok(());
        };
        let mut ancestors: Vec<&Path> = parent.ancestors().collect();
        ancestors.reverse();
        for dir in ancestors {
            if dir.as_os_str().is_empty() || dir == Path::new("/") {
                continue;
            }
            // Failure here is either "exists" (fine) or a real problem that
            // the subsequent create will report.
            let _ = self.sftp.mkdir(dir, 0o755);
        }
        Ok(())
    }

    fn upload_once(&mut self, local: &Path, remote: &Path) -> Result<u64> {
        self.ensure_parent_dirs(remote)?;

        let mut src = File::open(local)?;
        let mut dst = self.sftp.create(remote)?;
        let mut buf = [0u8; CHUNK_SIZE];
        let mut total = 0u64;

        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n])?;
            total += n as u64;
            self.throttle.consume(n as u64);
        }
        drop(dst);

        // The transport is authenticated, so size equality suffices.
        let remote_size = self.sftp.stat(remote)?.size.ok_or_else(|| {
            EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "remote stat returned no size",
            ))
        })?;
        let local_size = std::fs::metadata(local)?.len();
        if remote_size != local_size {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "remote size {remote_size} != local size {local_size} for {}",
                    remote.display()
                ),
            )));
        }
        Ok(total)
    }

    /// Upload one source file, retrying transient failures.
    pub fn upload_file(&mut self, file: &SourceFile) -> FileRecord {
        let remote = self.remote_path(&file.rel_path);

        if let Some(target) = &file.symlink_target {
            let result = self
                .ensure_parent_dirs(&remote)
                .and_then(|_| Ok(self.sftp.symlink(target, &remote)?));
            return match result {
                Ok(()) => FileRecord {
                    path: file.rel_path.clone(),
                    stored_path: file.rel_path.clone(),
                    size: 0,
                    sha256: String::new(),
                    status: FileStatus::Symlink,
                    error: None,
                },
                Err(e) => self.failed_record(file, e.to_string()),
            };
        }

        let sha = match fingerprint_file(&file.abs_path) {
            Ok((sha, _)) => sha,
            Err(e) => return self.failed_record(file, format!("cannot hash source: {e}")),
        };

        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match self.upload_once(&file.abs_path, &remote) {
                Ok(bytes) => {
                    debug!(host = %self.server.host, path = %file.rel_path, bytes, "uploaded");
                    return FileRecord {
                        path: file.rel_path.clone(),
                        stored_path: file.rel_path.clone(),
                        size: bytes,
                        sha256: sha,
                        status: FileStatus::Copied,
                        error: None,
                    };
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < MAX_ATTEMPTS {
                        let backoff = RETRY_BACKOFF * 2u32.pow(attempt - 1);
                        warn!(
                            host = %self.server.host,
                            path = %file.rel_path,
                            attempt,
                            error = %last_error,
                            "upload failed, retrying in {backoff:?}"
                        );
                        std::thread::sleep(backoff);
                    }
                }
            }
        }

        warn!(host = %self.server.host, path = %file.rel_path, error = %last_error, "upload failed permanently");
        self.failed_record(file, last_error)
    }

    fn failed_record(&self, file: &SourceFile, error: String) -> FileRecord {
        FileRecord {
            path: file.rel_path.clone(),
            stored_path: file.rel_path.clone(),
            size: file.size,
            sha256: String::new(),
            status: FileStatus::Failed,
            error: Some(error),
        }
    }

    /// Upload a serialized manifest: write a temp name, then rename.
    pub fn write_manifest(&mut self, manifest: &Manifest) -> Result<()> {
        let name = manifest_file_name(&manifest.run_id);
        let final_path = self.server.remote_dir.join(&name);
        let tmp_path = self.server.remote_dir.join(format!(".{name}.tmp"));

        self.ensure_parent_dirs(&final_path)?;
        let json = serde_json::to_vec_pretty(manifest)?;
        let mut dst = self.sftp.create(&tmp_path)?;
        dst.write_all(&json)?;
        drop(dst);
        self.sftp.rename(&tmp_path, &final_path, None)?;
        Ok(())
    }

    /// Run ids present at the remote root, ascending. A missing remote
    /// directory means no prior runs.
    pub fn list_run_ids(&self) -> Result<Vec<String>> {
        let entries = match self.sftp.readdir(&self.server.remote_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };
        let mut ids: Vec<String> = entries
            .iter()
            .filter_map(|(path, _)| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(run_id_from_file_name)
                    .map(str::to_string)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn read_manifest(&self, run_id: &str) -> Result<Manifest> {
        let path = self.server.remote_dir.join(manifest_file_name(run_id));
        let mut file = self.sftp.open(&path)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn latest_manifest(&self) -> Result<Option<Manifest>> {
        match self.list_run_ids()?.last() {
            Some(id) => Ok(Some(self.read_manifest(id)?)),
            None => Ok(None),
        }
    }

    pub fn latest_full_manifest(&self) -> Result<Option<Manifest>> {
        for id in self.list_run_ids()?.iter().rev() {
            let manifest = self.read_manifest(id)?;
            if manifest.mode == crate::manifest::BackupMode::Full {
                return Ok(Some(manifest));
            }
        }
        Ok(None)
    }

    pub fn disconnect(self) {
        let _ = self
            .session
            .disconnect(None, "backup run finished", None);
    }
}

/// Warn on unknown, never silently trust.
fn verify_host_key(session: &Session, host: &str, port: u16) -> Result<()> {
    let mut known_hosts = session.known_hosts()?;

    if let Some(home) = std::env::var_os("HOME") {
        let path = Path::new(&home).join(".ssh").join("known_hosts");
        if path.exists() {
            let _ = known_hosts.read_file(&path, KnownHostFileKind::OpenSSH);
        }
    }

    let (key, _) = session
        .host_key()
        .ok_or_else(|| EngineError::HostKey(host.to_string()))?;

    match known_hosts.check_port(host, port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => {
            warn!(host, port, "host key is not in known_hosts, refusing to trust it");
            Err(EngineError::HostKey(format!("{host}:{port}")))
        }
        CheckResult::Mismatch => {
            warn!(host, port, "host key MISMATCH, possible machine-in-the-middle");
            Err(EngineError::HostKey(format!("{host}:{port}")))
        }
        CheckResult::Failure => Err(EngineError::HostKey(format!("{host}:{port}"))),
    }
}

fn authenticate(session: &Session, server: &SshServer) -> Result<()> {
    let result = if let Some(key_file) = &server.key_file {
        session.userauth_pubkey_file(&server.username, None, key_file, None)
    } else if let Some(password) = &server.password {
        session.userauth_password(&server.username, password)
    } else {
        session.userauth_agent(&server.username)
    };

    match result {
        Ok(()) if session.authenticated() => Ok(()),
        _ => Err(EngineError::Authentication(format!(
            "{}@{}",
            server.username, server.host
        ))),
    }
}
