//! Run orchestration.
//!
//! One run walks the state machine `idle → locked → pre-hook → selecting →
//! copying → manifesting → encrypting → deduping → pruning → post-hook →
//! reporting`. Destinations are isolated workers: each selects against its
//! own manifest history, copies its files, and reports records back; the
//! orchestrator is the single writer of every manifest. Only configuration,
//! lock and pre-hook problems abort a run; everything later degrades into
//! per-file rows or per-destination fatals and the run still terminates with
//! an outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{CompressMode, OperationMode, RunConfig, SshServer};
use crate::dest::object::ObjectCopier;
use crate::dest::sftp::SftpCopier;
use crate::dest::{destinations_for, local as local_dest, Destination};
use crate::error::{EngineError, Result};
use crate::events::{outcome_of, DestReport, EventSender, RunEvent, RunReport, Stage};
use crate::fs::walker::{build_exclude_set, walk_source, SourceFile};
use crate::manifest::{run_id_now, store, FileRecord, FileStatus, Manifest, ENC_SUFFIX};
use crate::progress::{format_speed, ProgressTracker};
use crate::schedule::{hooks, lock};
use crate::selector::select_files;
use crate::stages::encrypt::KeyMaterial;
use crate::stages::{compress, db_dump, dedup, encrypt, retention};

pub struct Orchestrator {
    cfg: RunConfig,
    events: EventSender,
    cancel: CancellationToken,
    lock_held: bool,
}

/// Everything one destination worker hands back.
struct DestOutcome {
    dest: Destination,
    report: DestReport,
    records: Vec<FileRecord>,
    sftp: Option<SftpCopier>,
    object: Option<ObjectCopier>,
}

impl Orchestrator {
    pub fn new(cfg: RunConfig, events: EventSender, cancel: CancellationToken) -> Self {
        Self {
            cfg,
            events,
            cancel,
            lock_held: false,
        }
    }

    /// The scheduled loop already owns the single-instance lock.
    pub fn with_lock_held(mut self) -> Self {
        self.lock_held = true;
        self
    }

    fn emit(&self, event: RunEvent) {
        let _ = self.events.send(event);
    }

    fn stage(&self, run_id: &str, stage: Stage) {
        info!(run_id, stage = %stage, "stage");
        self.emit(RunEvent::StageChanged {
            run_id: run_id.to_string(),
            stage,
        });
    }

    /// Execute one run. `Err` only for lock conflicts and pre-hook failures;
    /// any later problem is folded into the report's outcome.
    pub async fn run(&self) -> Result<RunReport> {
        let started = Instant::now();
        let started_at = Local::now();
        let run_id = run_id_now();

        let _lock = if self.lock_held {
            None
        } else {
            Some(lock::acquire(&self.cfg.schedule.lock_file)?)
        };
        self.stage(&run_id, Stage::Locked);

        self.stage(&run_id, Stage::PreHook);
        if let Some(pre) = &self.cfg.hooks.pre_backup {
            // A failing pre-hook aborts before anything is selected.
            hooks::run_hook("pre-backup", pre).await?;
        }

        self.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
            mode: self.cfg.backup_mode,
        });

        let destinations = match self.pipeline(&run_id, started_at).await {
            Ok(destinations) => destinations,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "run failed before any destination completed");
                Vec::new()
            }
        };

        self.stage(&run_id, Stage::PostHook);
        if let Some(post) = &self.cfg.hooks.post_backup {
            if let Err(e) = hooks::run_hook("post-backup", post).await {
                // Logged, never changes the run outcome.
                warn!(run_id = %run_id, error = %e, "post-backup hook failed");
            }
        }

        self.stage(&run_id, Stage::Reporting);
        let report = RunReport {
            run_id: run_id.clone(),
            mode: self.cfg.backup_mode,
            outcome: outcome_of(&destinations),
            cancelled: self.cancel.is_cancelled(),
            duration_secs: started.elapsed().as_secs(),
            destinations,
        };
        info!(
            run_id = %run_id,
            outcome = ?report.outcome,
            bytes = report.total_bytes(),
            failed = report.total_failed(),
            "run finished"
        );
        self.emit(RunEvent::RunFinished {
            report: report.clone(),
        });
        Ok(report)
    }

    /// Selection through retention. An `Err` here means the run produced
    /// nothing at all.
    async fn pipeline(
        &self,
        run_id: &str,
        started_at: DateTime<Local>,
    ) -> Result<Vec<DestReport>> {
        let cfg = &self.cfg;

        let destinations = destinations_for(cfg);
        if destinations.is_empty() {
            return Err(EngineError::Config(
                "no destinations enabled for this run".into(),
            ));
        }

        self.stage(run_id, Stage::Selecting);
        let excludes = build_exclude_set(&cfg.excludes)?;

        // Compression bypasses the selector: the run is one archive.
        let (candidates, bypass_selection) = if cfg.compress != CompressMode::None {
            let archive = self.build_archive(run_id, &excludes).await?;
            (vec![archive], true)
        } else {
            let source = cfg.source_dir.clone();
            let excludes_cl = excludes.clone();
            let mut files =
                tokio::task::spawn_blocking(move || walk_source(&source, &excludes_cl))
                    .await
                    .map_err(|e| EngineError::Selection(e.to_string()))??;

            if let Some(staged) = self.stage_db_dump(run_id).await {
                files.push(staged);
                files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
            }
            (files, false)
        };
        info!(run_id, candidates = candidates.len(), "selection done");

        self.stage(run_id, Stage::Copying);
        let candidates = Arc::new(candidates);
        let mut workers = JoinSet::new();
        for dest in destinations {
            let candidates = Arc::clone(&candidates);
            let events = self.events.clone();
            let cancel = self.cancel.clone();
            let cfg = cfg.clone();
            workers.spawn(async move {
                run_destination(dest, cfg, candidates, bypass_selection, events, cancel).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "destination worker panicked"),
            }
        }
        // Stable report order regardless of completion order.
        outcomes.sort_by(|a, b| a.report.label.cmp(&b.report.label));

        self.stage(run_id, Stage::Manifesting);
        self.write_manifests(run_id, started_at, &mut outcomes).await;

        // A destination that went fatal in an earlier stage is disabled for
        // every remaining stage, so the live set is recomputed per stage.
        let live_local_roots = |outcomes: &[DestOutcome]| -> Vec<PathBuf> {
            outcomes
                .iter()
                .filter(|o| o.report.fatal.is_none())
                .filter_map(|o| o.dest.local_root().map(Path::to_path_buf))
                .collect()
        };

        if cfg.encrypt && !live_local_roots(&outcomes).is_empty() {
            self.stage(run_id, Stage::Encrypting);
            self.encrypt_locals(&mut outcomes).await;
        }

        let local_roots = live_local_roots(&outcomes);
        if cfg.dedup && !local_roots.is_empty() {
            self.stage(run_id, Stage::Deduping);
            let roots = local_roots.clone();
            match tokio::task::spawn_blocking(move || dedup::dedup_destinations(&roots)).await {
                Ok(Ok(stats)) => {
                    info!(run_id, linked = stats.files_linked, "dedup complete")
                }
                Ok(Err(e)) => warn!(run_id, error = %e, "dedup stage failed"),
                Err(e) => warn!(run_id, error = %e, "dedup task failed"),
            }
        }

        self.stage(run_id, Stage::Pruning);
        if !cfg.retention.is_noop() {
            for root in &local_roots {
                let root = root.clone();
                let retention_cfg = cfg.retention.clone();
                match tokio::task::spawn_blocking(move || {
                    retention::apply_retention(&root, &retention_cfg)
                })
                .await
                {
                    Ok(Ok(stats)) if stats.runs_pruned > 0 => {
                        info!(run_id, pruned = stats.runs_pruned, "retention applied")
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(run_id, error = %e, "retention failed"),
                    Err(e) => warn!(run_id, error = %e, "retention task failed"),
                }
            }
        }

        // Close remote sessions politely.
        for outcome in &mut outcomes {
            if let Some(copier) = outcome.sftp.take() {
                copier.disconnect();
            }
        }

        for outcome in &outcomes {
            self.emit(RunEvent::DestinationFinished {
                report: outcome.report.clone(),
            });
        }
        Ok(outcomes.into_iter().map(|o| o.report).collect())
    }

    /// Build the run archive in the first local destination; remote
    /// destinations receive it as a single ordinary file.
    async fn build_archive(
        &self,
        run_id: &str,
        excludes: &globset::GlobSet,
    ) -> Result<SourceFile> {
        let cfg = &self.cfg;
        let first_local = cfg.backup_dirs.first().cloned().ok_or_else(|| {
            EngineError::Config("compression requires at least one local destination".into())
        })?;

        let password = match cfg.compress {
            CompressMode::ZipPw => Some(compress::generate_archive_password()),
            _ => None,
        };
        if let Some(pw) = &password {
            compress::cache_archive_password(run_id, pw);
            // Out-of-band delivery; the password never touches the
            // filesystem in the clear.
            self.emit(RunEvent::ArchivePassword {
                run_id: run_id.to_string(),
                password: pw.clone(),
            });
        }

        let source = cfg.source_dir.clone();
        let excludes = excludes.clone();
        let run_id_owned = run_id.to_string();
        let info = tokio::task::spawn_blocking(move || {
            compress::build_archive(
                &source,
                &excludes,
                &first_local,
                &run_id_owned,
                password.as_deref(),
            )
        })
        .await
        .map_err(|e| EngineError::Archive(e.to_string()))??;

        Ok(SourceFile {
            rel_path: info.file_name.clone(),
            abs_path: info.path.clone(),
            size: info.size,
            mtime: Local::now(),
            symlink_target: None,
        })
    }

    /// Produce the database dump artifact, staged under the first local
    /// destination. A dump failure is isolated: the run continues without
    /// the artifact.
    async fn stage_db_dump(&self, run_id: &str) -> Option<SourceFile> {
        if !self.cfg.wants(OperationMode::Db) {
            return None;
        }
        let db = self.cfg.database.as_ref()?;
        let Some(first_local) = self.cfg.backup_dirs.first() else {
            warn!("database dump requires a local destination, skipping");
            return None;
        };

        match db_dump::produce_dump(db, first_local, run_id).await {
            Ok(staged) => Some(staged),
            Err(e) => {
                warn!(error = %e, "database dump failed, continuing without artifact");
                None
            }
        }
    }

    /// Single-writer manifest phase: one manifest per destination that is
    /// still alive. Local manifests carry `.enc` stored paths when the
    /// encryption stage will follow.
    async fn write_manifests(
        &self,
        run_id: &str,
        started_at: DateTime<Local>,
        outcomes: &mut [DestOutcome],
    ) {
        for outcome in outcomes.iter_mut() {
            if outcome.report.fatal.is_some() {
                continue;
            }

            let mut records = outcome.records.clone();
            if self.cfg.encrypt && outcome.dest.is_local() {
                for record in &mut records {
                    if record.status == FileStatus::Copied {
                        record.stored_path = format!("{}{}", record.stored_path, ENC_SUFFIX);
                    }
                }
            }

            let manifest = Manifest {
                run_id: run_id.to_string(),
                mode: self.cfg.backup_mode,
                source_root: self.cfg.source_dir.display().to_string(),
                destination_root: destination_root_label(&outcome.dest),
                started_at,
                finished_at: Local::now(),
                files: records,
            };

            let written = match &outcome.dest {
                Destination::Local { root } => {
                    let root = root.clone();
                    let manifest = manifest.clone();
                    match tokio::task::spawn_blocking(move || {
                        store::write_manifest(&root, &manifest)
                    })
                    .await
                    {
                        Ok(Ok(_)) => Ok(()),
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(EngineError::Selection(e.to_string())),
                    }
                }
                Destination::Sftp(_) => match outcome.sftp.take() {
                    Some(mut copier) => {
                        let manifest = manifest.clone();
                        match tokio::task::spawn_blocking(move || {
                            let result = copier.write_manifest(&manifest);
                            (copier, result)
                        })
                        .await
                        {
                            Ok((copier, result)) => {
                                outcome.sftp = Some(copier);
                                result
                            }
                            Err(e) => Err(EngineError::Selection(e.to_string())),
                        }
                    }
                    None => Err(EngineError::Selection("sftp session lost".into())),
                },
                Destination::Object(_) => match &outcome.object {
                    Some(copier) => copier.write_manifest(&manifest).await,
                    None => Err(EngineError::ObjectStore("client lost".into())),
                },
            };

            match written {
                Ok(()) => outcome.report.manifest_written = true,
                Err(e) => {
                    error!(run_id, dest = %outcome.report.label, error = %e, "manifest write failed");
                    outcome.report.fatal = Some(format!("manifest write failed: {e}"));
                }
            }
        }
    }

    /// Encrypt every live local destination. Missing key material fails
    /// each of them; a per-file crypto error is recorded and counted.
    async fn encrypt_locals(&self, outcomes: &mut [DestOutcome]) {
        let material = match KeyMaterial::from_config(&self.cfg.encryption) {
            Ok(material) => Arc::new(material),
            Err(e) => {
                error!(error = %e, "encryption stage cannot start");
                for outcome in outcomes.iter_mut() {
                    if outcome.dest.is_local() && outcome.report.fatal.is_none() {
                        outcome.report.fatal = Some(e.to_string());
                    }
                }
                return;
            }
        };

        for outcome in outcomes.iter_mut() {
            if outcome.report.fatal.is_some() {
                continue;
            }
            let Some(root) = outcome.dest.local_root().map(Path::to_path_buf) else {
                continue;
            };
            let material = Arc::clone(&material);
            match tokio::task::spawn_blocking(move || {
                encrypt::encrypt_destination(&root, &material)
            })
            .await
            {
                Ok(Ok(stats)) => outcome.report.files_failed += stats.files_failed,
                Ok(Err(e)) => {
                    error!(dest = %outcome.report.label, error = %e, "encryption failed");
                    outcome.report.fatal = Some(e.to_string());
                }
                Err(e) => {
                    error!(dest = %outcome.report.label, error = %e, "encryption task failed");
                    outcome.report.fatal = Some(e.to_string());
                }
            }
        }
    }

    /// Evaluate selection without taking the lock or writing anything.
    pub async fn dry_run(&self) -> Result<DryRunPlan> {
        let cfg = &self.cfg;
        let excludes = build_exclude_set(&cfg.excludes)?;
        let source = cfg.source_dir.clone();
        let files = tokio::task::spawn_blocking(move || walk_source(&source, &excludes))
            .await
            .map_err(|e| EngineError::Selection(e.to_string()))??;

        let total_bytes = files.iter().map(|f| f.size).sum();
        let mut per_destination = Vec::new();
        for dest in destinations_for(cfg) {
            let selected = match dest.local_root() {
                Some(root) => {
                    let latest = store::latest_manifest(root)?;
                    let latest_full = store::latest_full_manifest(root)?;
                    select_files(&files, cfg.backup_mode, latest.as_ref(), latest_full.as_ref())
                        .len()
                }
                // Remote histories are not consulted in a dry run.
                None => files.len(),
            };
            per_destination.push((dest.label(), selected));
        }

        Ok(DryRunPlan {
            candidates: files.len(),
            total_bytes,
            per_destination,
        })
    }
}

#[derive(Debug)]
pub struct DryRunPlan {
    pub candidates: usize,
    pub total_bytes: u64,
    pub per_destination: Vec<(String, usize)>,
}

fn destination_root_label(dest: &Destination) -> String {
    match dest {
        Destination::Local { root } => root.display().to_string(),
        Destination::Sftp(server) => server.remote_dir.display().to_string(),
        Destination::Object(cfg) => format!("s3://{}/{}", cfg.bucket, cfg.prefix),
    }
}

/// One destination worker: select against this destination's history, copy,
/// hand the records back.
async fn run_destination(
    dest: Destination,
    cfg: RunConfig,
    candidates: Arc<Vec<SourceFile>>,
    bypass_selection: bool,
    events: EventSender,
    cancel: CancellationToken,
) -> DestOutcome {
    match dest {
        Destination::Local { root } => {
            run_local_worker(root, cfg, candidates, bypass_selection, events, cancel).await
        }
        Destination::Sftp(server) => {
            run_sftp_worker(server, cfg, candidates, bypass_selection, events, cancel).await
        }
        Destination::Object(s3) => {
            run_object_worker(s3, cfg, candidates, bypass_selection, events, cancel).await
        }
    }
}

fn tally(report: &mut DestReport, record: &FileRecord, events: &EventSender) {
    match record.status {
        FileStatus::Copied => {
            report.files_copied += 1;
            report.bytes_copied += record.size;
            let _ = events.send(RunEvent::FileCopied {
                destination: report.label.clone(),
                path: record.path.clone(),
                bytes: record.size,
            });
        }
        FileStatus::Symlink => report.files_copied += 1,
        FileStatus::Skipped => report.files_skipped += 1,
        FileStatus::Failed => {
            report.files_failed += 1;
            let _ = events.send(RunEvent::FileFailed {
                destination: report.label.clone(),
                path: record.path.clone(),
                error: record.error.clone().unwrap_or_default(),
            });
        }
    }
}

async fn run_local_worker(
    root: PathBuf,
    cfg: RunConfig,
    candidates: Arc<Vec<SourceFile>>,
    bypass_selection: bool,
    events: EventSender,
    cancel: CancellationToken,
) -> DestOutcome {
    let mut report = DestReport::new(root.display().to_string());

    let baselines = {
        let root = root.clone();
        tokio::task::spawn_blocking(move || -> Result<_> {
            Ok((
                store::latest_manifest(&root)?,
                store::latest_full_manifest(&root)?,
            ))
        })
        .await
    };
    let (latest, latest_full) = match baselines {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            report.fatal = Some(format!("cannot read manifest history: {e}"));
            return DestOutcome {
                dest: Destination::Local { root },
                report,
                records: Vec::new(),
                sftp: None,
                object: None,
            };
        }
        Err(e) => {
            report.fatal = Some(format!("manifest history task failed: {e}"));
            return DestOutcome {
                dest: Destination::Local { root },
                report,
                records: Vec::new(),
                sftp: None,
                object: None,
            };
        }
    };

    let files = if bypass_selection {
        candidates.as_ref().clone()
    } else {
        select_files(
            &candidates,
            cfg.backup_mode,
            latest.as_ref(),
            latest_full.as_ref(),
        )
    };

    let semaphore = Arc::new(Semaphore::new(cfg.parallel_copies.max(1)));
    let mut copies = JoinSet::new();
    for file in files {
        // A stop signal lets in-flight files finish but starts no new ones.
        if cancel.is_cancelled() {
            break;
        }
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let root = root.clone();
        let rel = file.rel_path.clone();
        copies.spawn(async move {
            let record = tokio::task::spawn_blocking(move || local_dest::copy_file(&root, &file))
                .await
                .unwrap_or_else(|e| FileRecord {
                    path: rel.clone(),
                    stored_path: rel,
                    size: 0,
                    sha256: String::new(),
                    status: FileStatus::Failed,
                    error: Some(format!("copy task failed: {e}")),
                });
            drop(permit);
            record
        });
    }

    let mut progress = ProgressTracker::new();
    let mut records = Vec::new();
    while let Some(joined) = copies.join_next().await {
        match joined {
            Ok(record) => {
                if record.status == FileStatus::Copied {
                    progress.add_file(record.size);
                }
                tally(&mut report, &record, &events);
                records.push(record);
            }
            Err(e) => warn!(dest = %report.label, error = %e, "copy task panicked"),
        }
    }
    records.sort_by(|a, b| a.path.cmp(&b.path));
    info!(
        dest = %report.label,
        files = progress.files(),
        bytes = progress.bytes(),
        speed = %format_speed(progress.bytes_per_second()),
        "local copy phase done"
    );

    DestOutcome {
        dest: Destination::Local { root },
        report,
        records,
        sftp: None,
        object: None,
    }
}

async fn run_sftp_worker(
    server: SshServer,
    cfg: RunConfig,
    candidates: Arc<Vec<SourceFile>>,
    bypass_selection: bool,
    events: EventSender,
    cancel: CancellationToken,
) -> DestOutcome {
    let label = server.label();
    let dest = Destination::Sftp(server.clone());

    let worker = tokio::task::spawn_blocking(move || {
        let mut report = DestReport::new(label);

        let mut copier = match SftpCopier::connect(&server) {
            Ok(copier) => copier,
            Err(e) => {
                // One dead host isolates to this destination's tally.
                error!(host = %server.host, error = %e, "SFTP destination unavailable");
                report.fatal = Some(e.to_string());
                return (report, Vec::new(), None);
            }
        };

        let (latest, latest_full) = if bypass_selection {
            (None, None)
        } else {
            let latest = copier.latest_manifest();
            let latest_full = copier.latest_full_manifest();
            match (latest, latest_full) {
                (Ok(latest), Ok(latest_full)) => (latest, latest_full),
                (Err(e), _) | (_, Err(e)) => {
                    report.fatal = Some(format!("cannot read remote manifests: {e}"));
                    return (report, Vec::new(), Some(copier));
                }
            }
        };

        let files = if bypass_selection {
            candidates.as_ref().clone()
        } else {
            select_files(
                &candidates,
                cfg.backup_mode,
                latest.as_ref(),
                latest_full.as_ref(),
            )
        };

        let mut progress = ProgressTracker::new();
        let mut records = Vec::new();
        for file in files {
            if cancel.is_cancelled() {
                break;
            }
            let record = copier.upload_file(&file);
            if record.status == FileStatus::Copied {
                progress.add_file(record.size);
            }
            tally(&mut report, &record, &events);
            records.push(record);
        }
        records.sort_by(|a, b| a.path.cmp(&b.path));
        info!(
            dest = %report.label,
            files = progress.files(),
            speed = %format_speed(progress.bytes_per_second()),
            "upload phase done"
        );
        (report, records, Some(copier))
    })
    .await;

    match worker {
        Ok((report, records, sftp)) => DestOutcome {
            dest,
            report,
            records,
            sftp,
            object: None,
        },
        Err(e) => {
            let mut report = DestReport::new(destination_root_label(&dest));
            report.fatal = Some(format!("worker task failed: {e}"));
            DestOutcome {
                dest,
                report,
                records: Vec::new(),
                sftp: None,
                object: None,
            }
        }
    }
}

async fn run_object_worker(
    s3: crate::config::S3Config,
    cfg: RunConfig,
    candidates: Arc<Vec<SourceFile>>,
    bypass_selection: bool,
    events: EventSender,
    cancel: CancellationToken,
) -> DestOutcome {
    let dest = Destination::Object(s3.clone());
    let mut report = DestReport::new(dest.label());

    let copier = match ObjectCopier::connect(&s3).await {
        Ok(copier) => copier,
        Err(e) => {
            error!(bucket = %s3.bucket, error = %e, "object store unavailable");
            report.fatal = Some(e.to_string());
            return DestOutcome {
                dest,
                report,
                records: Vec::new(),
                sftp: None,
                object: None,
            };
        }
    };

    let (latest, latest_full) = if bypass_selection {
        (None, None)
    } else {
        match (copier.latest_manifest().await, copier.latest_full_manifest().await) {
            (Ok(latest), Ok(latest_full)) => (latest, latest_full),
            (Err(e), _) | (_, Err(e)) => {
                report.fatal = Some(format!("cannot read bucket manifests: {e}"));
                return DestOutcome {
                    dest,
                    report,
                    records: Vec::new(),
                    sftp: None,
                    object: Some(copier),
                };
            }
        }
    };

    let files = if bypass_selection {
        candidates.as_ref().clone()
    } else {
        select_files(
            &candidates,
            cfg.backup_mode,
            latest.as_ref(),
            latest_full.as_ref(),
        )
    };

    let mut records = Vec::new();
    for file in files {
        if cancel.is_cancelled() {
            break;
        }
        let record = copier.upload_file(&file).await;
        tally(&mut report, &record, &events);
        records.push(record);
    }
    records.sort_by(|a, b| a.path.cmp(&b.path));

    DestOutcome {
        dest,
        report,
        records,
        sftp: None,
        object: Some(copier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CompressMode, EncryptionConfig, HooksConfig, NotifyConfig, OperationMode, RetentionConfig,
        RunConfig, ScheduleConfig,
    };
    use crate::events::RunOutcome;
    use crate::fs::checksum::fingerprint_file;
    use crate::manifest::BackupMode;
    use tempfile::TempDir;

    fn base_cfg(src: &Path, dests: Vec<PathBuf>, lock: &Path) -> RunConfig {
        RunConfig {
            source_dir: src.to_path_buf(),
            backup_dirs: dests,
            operation_modes: vec![OperationMode::Local],
            backup_mode: BackupMode::Full,
            excludes: Vec::new(),
            parallel_copies: 4,
            compress: CompressMode::None,
            encrypt: false,
            dedup: false,
            ssh_servers: Vec::new(),
            s3: None,
            database: None,
            encryption: EncryptionConfig::default(),
            retention: RetentionConfig::default(),
            schedule: ScheduleConfig {
                times: Vec::new(),
                interval_minutes: 5,
                lock_file: lock.to_path_buf(),
            },
            hooks: HooksConfig::default(),
            notifications: NotifyConfig::default(),
            smtp: None,
        }
    }

    fn orchestrator(cfg: RunConfig) -> Orchestrator {
        let (events_tx, _events_rx) = crate::events::channel();
        Orchestrator::new(cfg, events_tx, CancellationToken::new())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn full_local_run_copies_everything_and_manifests() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let lock = TempDir::new().unwrap();
        std::fs::write(src.path().join("a.txt"), b"0123456789").unwrap();
        std::fs::create_dir(src.path().join("dir")).unwrap();
        std::fs::write(src.path().join("dir/b.txt"), b"hello").unwrap();
        std::os::unix::fs::symlink("a.txt", src.path().join("link")).unwrap();

        let cfg = base_cfg(
            src.path(),
            vec![dst.path().to_path_buf()],
            &lock.path().join("run.lock"),
        );
        let report = orchestrator(cfg).run().await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Success);
        assert!(dst.path().join("a.txt").exists());
        assert!(dst.path().join("dir/b.txt").exists());
        assert_eq!(
            std::fs::read_link(dst.path().join("link")).unwrap(),
            PathBuf::from("a.txt")
        );

        let manifest = store::latest_manifest(dst.path()).unwrap().unwrap();
        assert_eq!(manifest.mode, BackupMode::Full);
        assert_eq!(manifest.files.len(), 3);
        let row = manifest.files.iter().find(|f| f.path == "a.txt").unwrap();
        assert_eq!(row.status, FileStatus::Copied);
        let (sha, _) = fingerprint_file(&src.path().join("a.txt")).unwrap();
        assert_eq!(row.sha256, sha);
        let link_row = manifest.files.iter().find(|f| f.path == "link").unwrap();
        assert_eq!(link_row.status, FileStatus::Symlink);
        // Lock released after the run.
        assert!(!lock.path().join("run.lock").exists());
    }

    #[tokio::test]
    async fn incremental_run_carries_only_the_change() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let lock = TempDir::new().unwrap();
        std::fs::write(src.path().join("a.txt"), b"0123456789").unwrap();
        std::fs::write(src.path().join("b.txt"), b"stable").unwrap();

        let cfg = base_cfg(
            src.path(),
            vec![dst.path().to_path_buf()],
            &lock.path().join("run.lock"),
        );
        orchestrator(cfg.clone()).run().await.unwrap();

        // Run ids have second precision; make the change land strictly after
        // the first run's start.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        std::fs::write(src.path().join("a.txt"), b"0123456789x").unwrap();

        let mut cfg2 = cfg;
        cfg2.backup_mode = BackupMode::Incremental;
        let report = orchestrator(cfg2).run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Success);

        let manifest = store::latest_manifest(dst.path()).unwrap().unwrap();
        assert_eq!(manifest.mode, BackupMode::Incremental);
        let rows: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(rows, vec!["a.txt"]);
        assert_eq!(
            std::fs::read(dst.path().join("a.txt")).unwrap(),
            b"0123456789x"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn encrypt_dedup_retention_pipeline() {
        use std::os::unix::fs::MetadataExt;

        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let lock = TempDir::new().unwrap();
        let keys = TempDir::new().unwrap();
        let keyfile = keys.path().join("key.bin");
        std::fs::write(&keyfile, [42u8; 32]).unwrap();

        let payload = vec![7u8; 1024];
        std::fs::write(src.path().join("x"), &payload).unwrap();
        std::fs::write(src.path().join("y"), &payload).unwrap();

        let mut cfg = base_cfg(
            src.path(),
            vec![dst.path().to_path_buf()],
            &lock.path().join("run.lock"),
        );
        cfg.encrypt = true;
        cfg.encryption = EncryptionConfig {
            enabled: true,
            keyfile: Some(keyfile),
            passphrase: None,
        };
        cfg.dedup = true;
        cfg.retention.max_count = 2;

        let report = orchestrator(cfg.clone()).run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Success);

        // Plaintext gone, envelopes hardlinked, manifest keeps the
        // plaintext hash for both.
        assert!(!dst.path().join("x").exists());
        let x_meta = std::fs::metadata(dst.path().join("x.enc")).unwrap();
        let y_meta = std::fs::metadata(dst.path().join("y.enc")).unwrap();
        assert_eq!(x_meta.ino(), y_meta.ino());

        let manifest = store::latest_manifest(dst.path()).unwrap().unwrap();
        let x_row = manifest.files.iter().find(|f| f.path == "x").unwrap();
        let y_row = manifest.files.iter().find(|f| f.path == "y").unwrap();
        assert_eq!(x_row.stored_path, "x.enc");
        assert_eq!(x_row.sha256, y_row.sha256);
        assert_eq!(x_row.size, 1024);

        // Two more fulls; only the two newest manifests may survive.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        orchestrator(cfg.clone()).run().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        orchestrator(cfg).run().await.unwrap();

        let ids = store::list_run_ids(dst.path()).unwrap();
        assert_eq!(ids.len(), 2);
        // Shared stored paths survived retention.
        assert!(dst.path().join("x.enc").exists());
        assert!(dst.path().join("y.enc").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pre_hook_failure_aborts_before_selection() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let lock = TempDir::new().unwrap();
        std::fs::write(src.path().join("a.txt"), b"data").unwrap();

        let mut cfg = base_cfg(
            src.path(),
            vec![dst.path().to_path_buf()],
            &lock.path().join("run.lock"),
        );
        cfg.hooks.pre_backup = Some("exit 1".into());

        let err = orchestrator(cfg).run().await;
        assert!(matches!(err, Err(EngineError::Hook(_))));
        assert!(!dst.path().join("a.txt").exists());
        assert!(store::latest_manifest(dst.path()).unwrap().is_none());
    }

    #[tokio::test]
    async fn held_lock_conflicts_and_stays_untouched() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let lock = TempDir::new().unwrap();
        let lock_path = lock.path().join("run.lock");
        // Our own pid is alive, so the lock reads as held.
        std::fs::write(&lock_path, std::process::id().to_string()).unwrap();

        let cfg = base_cfg(src.path(), vec![dst.path().to_path_buf()], &lock_path);
        let err = orchestrator(cfg).run().await;
        assert!(matches!(err, Err(EngineError::LockHeld { .. })));
        assert!(lock_path.exists());
    }

    #[tokio::test]
    async fn archive_run_produces_one_zip_per_manifest_row() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let lock = TempDir::new().unwrap();
        std::fs::write(src.path().join("a.txt"), b"0123456789").unwrap();
        std::fs::write(src.path().join("b.txt"), b"hello").unwrap();

        let mut cfg = base_cfg(
            src.path(),
            vec![dst.path().to_path_buf()],
            &lock.path().join("run.lock"),
        );
        cfg.compress = CompressMode::Zip;

        let report = orchestrator(cfg).run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Success);

        let manifest = store::latest_manifest(dst.path()).unwrap().unwrap();
        assert_eq!(manifest.files.len(), 1);
        let row = &manifest.files[0];
        assert!(row.path.starts_with("backup_"));
        assert!(row.path.ends_with(".zip"));
        assert!(dst.path().join(&row.stored_path).exists());
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let lock = TempDir::new().unwrap();
        std::fs::write(src.path().join("a.txt"), b"0123456789").unwrap();

        let cfg = base_cfg(
            src.path(),
            vec![dst.path().to_path_buf()],
            &lock.path().join("run.lock"),
        );
        let plan = orchestrator(cfg).dry_run().await.unwrap();

        assert_eq!(plan.candidates, 1);
        assert_eq!(plan.total_bytes, 10);
        assert_eq!(plan.per_destination.len(), 1);
        assert_eq!(plan.per_destination[0].1, 1);
        assert!(!dst.path().join("a.txt").exists());
        assert!(store::list_run_ids(dst.path()).unwrap().is_empty());
    }
}
