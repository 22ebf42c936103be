//! Lifecycle events and run reports.
//!
//! The orchestrator emits one structured event per state transition and per
//! file outcome; logs and notifications both observe the same stream, so they
//! can never disagree about what a run did.

use serde::Serialize;

use crate::manifest::BackupMode;

/// Orchestrator state machine stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Locked,
    PreHook,
    Selecting,
    Copying,
    Manifesting,
    Encrypting,
    Deduping,
    Pruning,
    PostHook,
    Reporting,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Idle => "idle",
            Stage::Locked => "locked",
            Stage::PreHook => "pre-hook",
            Stage::Selecting => "selecting",
            Stage::Copying => "copying",
            Stage::Manifesting => "manifesting",
            Stage::Encrypting => "encrypting",
            Stage::Deduping => "deduping",
            Stage::Pruning => "pruning",
            Stage::PostHook => "post-hook",
            Stage::Reporting => "reporting",
        };
        f.write_str(s)
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Partial,
    Failed,
}

/// Per-destination accumulator, reported at the end of the run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DestReport {
    pub label: String,
    pub files_copied: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub bytes_copied: u64,
    pub manifest_written: bool,
    /// A destination-fatal error (connection refused, key material missing).
    pub fatal: Option<String>,
}

impl DestReport {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }
}

/// Result of one whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: BackupMode,
    pub outcome: RunOutcome,
    pub cancelled: bool,
    pub duration_secs: u64,
    pub destinations: Vec<DestReport>,
}

impl RunReport {
    pub fn total_bytes(&self) -> u64 {
        self.destinations.iter().map(|d| d.bytes_copied).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.destinations.iter().map(|d| d.files_failed).sum()
    }
}

/// Compute the run outcome from the per-destination reports.
///
/// `failed` means no destination produced a valid manifest; `partial` means
/// at least one file or destination failed while at least one manifest was
/// written; `success` means neither.
pub fn outcome_of(destinations: &[DestReport]) -> RunOutcome {
    let any_manifest = destinations.iter().any(|d| d.manifest_written);
    if !any_manifest {
        return RunOutcome::Failed;
    }
    let any_failure = destinations
        .iter()
        .any(|d| d.files_failed > 0 || d.fatal.is_some() || !d.manifest_written);
    if any_failure {
        RunOutcome::Partial
    } else {
        RunOutcome::Success
    }
}

/// Events emitted while a run progresses.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        mode: BackupMode,
    },
    StageChanged {
        run_id: String,
        stage: Stage,
    },
    FileCopied {
        destination: String,
        path: String,
        bytes: u64,
    },
    FileFailed {
        destination: String,
        path: String,
        error: String,
    },
    DestinationFinished {
        report: DestReport,
    },
    /// One-time archive password, delivered out-of-band only.
    ArchivePassword {
        run_id: String,
        password: String,
    },
    RunFinished {
        report: RunReport,
    },
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<RunEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<RunEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
