//! Backup runner - command-line front end for the pipeline engine.

mod logger;
mod notify;
mod shutdown;

use std::path::PathBuf;
use std::process::ExitCode;

use backup_engine::config::RunConfig;
use backup_engine::error::EngineError;
use backup_engine::manifest::{store, FileStatus};
use backup_engine::orchestrator::Orchestrator;
use backup_engine::progress::format_bytes;
use backup_engine::restore::{parse_restore_source, restore_local, RestoreSource};
use backup_engine::stages::encrypt::KeyMaterial;
use backup_engine::verify::verify_destination;
use backup_engine::{events, schedule};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "backup-runner", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a backup run, or one of the auxiliary modes
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Destination families to address this run
    #[arg(long = "operation-modes", value_name = "MODE", num_args = 1.., value_parser = ["local", "ssh", "s3", "db"])]
    operation_modes: Vec<String>,

    /// Selection policy
    #[arg(long = "backup-mode", value_parser = ["full", "incremental", "differential"])]
    backup_mode: Option<String>,

    #[arg(long = "source-dir", value_name = "DIR")]
    source_dir: Option<PathBuf>,

    #[arg(long = "backup-dirs", value_name = "DIR", num_args = 1..)]
    backup_dirs: Vec<PathBuf>,

    /// SSH destinations, `[user@]host[:port]`
    #[arg(long = "ssh-servers", value_name = "HOST", num_args = 1..)]
    ssh_servers: Vec<String>,

    /// Exclude globs, matched against source-relative paths
    #[arg(long = "exclude", value_name = "GLOB", num_args = 1..)]
    exclude: Vec<String>,

    /// Keep only the N newest runs per destination
    #[arg(long, value_name = "N")]
    retain: Option<u32>,

    /// Pack the whole source into one archive per run
    #[arg(long, value_parser = ["zip", "zip_pw"])]
    compress: Option<String>,

    /// Encrypt local destinations after manifesting
    #[arg(long)]
    encrypt: bool,

    /// Hardlink-deduplicate local destinations
    #[arg(long)]
    dedup: bool,

    /// Long-lived scheduled mode (slot timetable + single-instance lock)
    #[arg(long, conflicts_with = "dry_run")]
    scheduled: bool,

    /// Evaluate selection without taking the lock or writing anything
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Print the effective configuration with secrets masked
    #[arg(long = "show-setup")]
    show_setup: bool,

    /// Summarize the stored runs per destination
    #[arg(long)]
    status: bool,

    /// Re-hash the latest run at each local destination
    #[arg(long)]
    verify: bool,

    /// Restore from a destination instead of producing a backup
    #[arg(
        long,
        conflicts_with_all = [
            "scheduled", "dry_run", "encrypt", "dedup", "compress",
            "backup_mode", "operation_modes", "retain",
        ]
    )]
    restore: bool,

    /// Restore source: a path, `user@host:/abs/path` or `s3://bucket/prefix`
    #[arg(long = "from-dir", value_name = "SOURCE", requires = "restore")]
    from_dir: Option<String>,

    #[arg(long = "to-dir", value_name = "DIR", requires = "restore")]
    to_dir: Option<PathBuf>,

    /// Point-in-time selection
    #[arg(long = "restore-timestamp", value_name = "YYYYMMDD_HHMMSS", requires = "restore")]
    restore_timestamp: Option<String>,

    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Resolves to `config/config.<NAME>.ini`
    #[arg(long, value_name = "NAME", conflicts_with = "config")]
    profile: Option<String>,

    /// Force notifications on
    #[arg(long)]
    notifications: bool,

    #[arg(long = "receiver", value_name = "EMAIL", num_args = 1..)]
    receiver: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let Command::Run(args) = cli.command;

    if let Err(e) = logger::init(&args.log_level) {
        eprintln!("cannot initialize logging: {e}");
        return ExitCode::from(1);
    }

    match execute(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            match e {
                EngineError::Config(_) => ExitCode::from(1),
                EngineError::LockHeld { .. } => ExitCode::from(2),
                _ => ExitCode::from(4),
            }
        }
    }
}

fn resolve_config_path(args: &RunArgs) -> PathBuf {
    if let Some(path) = &args.config {
        return path.clone();
    }
    if let Some(profile) = &args.profile {
        return PathBuf::from(format!("config/config.{profile}.ini"));
    }
    PathBuf::from("config/config.ini")
}

fn apply_overrides(cfg: &mut RunConfig, args: &RunArgs) -> backup_engine::Result<()> {
    if let Some(dir) = &args.source_dir {
        cfg.source_dir = dir.clone();
    }
    if !args.backup_dirs.is_empty() {
        cfg.backup_dirs = args.backup_dirs.clone();
    }
    if !args.operation_modes.is_empty() {
        cfg.operation_modes = args
            .operation_modes
            .iter()
            .map(|m| m.parse().map_err(EngineError::Config))
            .collect::<backup_engine::Result<_>>()?;
    }
    if let Some(mode) = &args.backup_mode {
        cfg.backup_mode = mode.parse().map_err(EngineError::Config)?;
    }
    cfg.excludes.extend(args.exclude.iter().cloned());
    if let Some(n) = args.retain {
        cfg.retention.max_count = n;
    }
    if let Some(compress) = &args.compress {
        cfg.compress = compress.parse().map_err(EngineError::Config)?;
    }
    if args.encrypt {
        cfg.encrypt = true;
        cfg.encryption.enabled = true;
    }
    if args.dedup {
        cfg.dedup = true;
    }
    if args.notifications {
        cfg.notifications.enabled = true;
    }
    if !args.receiver.is_empty() {
        cfg.notifications.receivers = args.receiver.clone();
    }
    cfg.apply_ssh_server_specs(&args.ssh_servers)?;
    Ok(())
}

async fn execute(args: RunArgs) -> backup_engine::Result<ExitCode> {
    let config_path = resolve_config_path(&args);
    let mut cfg = RunConfig::load(&config_path)?;
    apply_overrides(&mut cfg, &args)?;

    if args.show_setup {
        let snapshot = serde_json::to_string_pretty(&cfg.masked())?;
        println!("{snapshot}");
        return Ok(ExitCode::SUCCESS);
    }
    if args.status {
        return status(&cfg);
    }
    if args.verify {
        return verify(&cfg);
    }
    if args.restore {
        return restore(&cfg, &args);
    }

    if args.dry_run {
        let (events_tx, _events_rx) = events::channel();
        let orchestrator = Orchestrator::new(cfg, events_tx, CancellationToken::new());
        let plan = orchestrator.dry_run().await?;
        println!(
            "would consider {} files ({})",
            plan.candidates,
            format_bytes(plan.total_bytes)
        );
        for (dest, selected) in &plan.per_destination {
            println!("  {dest}: {selected} files selected");
        }
        return Ok(ExitCode::SUCCESS);
    }

    let (events_tx, events_rx) = events::channel();
    let notifier = notify::spawn_notifier(events_rx, &cfg.notifications);
    let cancel = CancellationToken::new();
    shutdown::spawn_signal_listener(cancel.clone());

    if args.scheduled {
        schedule::run_scheduled(cfg, events_tx, cancel).await?;
        let _ = notifier.await;
        return Ok(ExitCode::SUCCESS);
    }

    let orchestrator = Orchestrator::new(cfg, events_tx, cancel);
    let report = orchestrator.run().await?;
    drop(orchestrator);
    let _ = notifier.await;

    Ok(match report.outcome {
        events::RunOutcome::Success => ExitCode::SUCCESS,
        events::RunOutcome::Partial => ExitCode::from(3),
        events::RunOutcome::Failed => ExitCode::from(4),
    })
}

fn status(cfg: &RunConfig) -> backup_engine::Result<ExitCode> {
    for dir in &cfg.backup_dirs {
        println!("{}:", dir.display());
        let ids = store::list_run_ids(dir)?;
        if ids.is_empty() {
            println!("  (no runs)");
            continue;
        }
        for id in ids {
            let manifest = store::read_manifest(dir, &id)?;
            let copied = manifest
                .files
                .iter()
                .filter(|f| matches!(f.status, FileStatus::Copied | FileStatus::Symlink))
                .count();
            let failed = manifest
                .files
                .iter()
                .filter(|f| f.status == FileStatus::Failed)
                .count();
            let bytes: u64 = manifest
                .files
                .iter()
                .filter(|f| f.status == FileStatus::Copied)
                .map(|f| f.size)
                .sum();
            println!(
                "  {id}  {:<12}  {copied} files, {}, {failed} failed",
                manifest.mode.to_string(),
                format_bytes(bytes),
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn verify(cfg: &RunConfig) -> backup_engine::Result<ExitCode> {
    let key = KeyMaterial::from_config(&cfg.encryption).ok();
    let mut corrupted = false;

    for dir in &cfg.backup_dirs {
        match verify_destination(dir, key.as_ref())? {
            None => println!("{}: no runs to verify", dir.display()),
            Some(report) => {
                let verdict = if report.corrupted { "CORRUPTED" } else { "ok" };
                println!(
                    "{}: run {}: {} files checked, {verdict}",
                    report.destination, report.run_id, report.checked
                );
                for outcome in report.outcomes.iter().filter(|o| !o.ok) {
                    println!(
                        "    {}: {}",
                        outcome.path,
                        outcome.detail.as_deref().unwrap_or("mismatch")
                    );
                }
                corrupted |= report.corrupted;
            }
        }
    }

    Ok(if corrupted {
        ExitCode::from(4)
    } else {
        ExitCode::SUCCESS
    })
}

fn restore(cfg: &RunConfig, args: &RunArgs) -> backup_engine::Result<ExitCode> {
    let from = args
        .from_dir
        .as_ref()
        .ok_or_else(|| EngineError::Config("--restore requires --from-dir".into()))?;
    let to = args
        .to_dir
        .as_ref()
        .ok_or_else(|| EngineError::Config("--restore requires --to-dir".into()))?;

    match parse_restore_source(from)? {
        RestoreSource::Local(path) => {
            let key = KeyMaterial::from_config(&cfg.encryption).ok();
            let stats = restore_local(&path, to, args.restore_timestamp.as_deref(), key.as_ref())?;
            println!(
                "restored {} files and {} symlinks ({}) from runs {:?}, {} failures",
                stats.files_restored,
                stats.symlinks_restored,
                format_bytes(stats.bytes_restored),
                stats.run_ids_used,
                stats.files_failed,
            );
            Ok(if stats.files_failed > 0 {
                ExitCode::from(4)
            } else {
                ExitCode::SUCCESS
            })
        }
        RestoreSource::Ssh { host, .. } => Err(EngineError::Restore(format!(
            "restoring straight from ssh://{host} is not supported; mount or copy the destination locally first"
        ))),
        RestoreSource::S3 { bucket, .. } => Err(EngineError::Restore(format!(
            "restoring straight from s3://{bucket} is not supported; sync the prefix locally first"
        ))),
    }
}
