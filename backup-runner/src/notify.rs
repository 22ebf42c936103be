//! Notification sink.
//!
//! The engine emits structured run events; this module turns them into
//! operator-facing messages. The shipped transport writes through the log;
//! chat-bot and mail transports plug in behind the same trait. An empty
//! receiver list disables notifications entirely.

use backup_engine::config::NotifyConfig;
use backup_engine::events::{EventReceiver, RunEvent, RunOutcome};
use backup_engine::progress::format_bytes;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A notification transport.
pub trait Notifier: Send + Sync {
    fn notify(&self, subject: &str, body: &str);
}

/// Default transport: structured log lines addressed to the receiver list.
pub struct LogNotifier {
    receivers: Vec<String>,
    host: String,
}

impl LogNotifier {
    pub fn new(receivers: Vec<String>) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        Self { receivers, host }
    }
}

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, body: &str) {
        info!(
            receivers = %self.receivers.join(", "),
            host = %self.host,
            subject,
            "{body}"
        );
    }
}

/// Drain the event stream, forwarding what operators care about. Returns
/// when the engine drops its sender.
pub fn spawn_notifier(mut events: EventReceiver, cfg: &NotifyConfig) -> JoinHandle<()> {
    let active = cfg.is_active();
    let notifier = LogNotifier::new(cfg.receivers.clone());

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if !active {
                continue;
            }
            match event {
                RunEvent::RunStarted { run_id, mode } => {
                    notifier.notify(
                        &format!("backup {run_id} started"),
                        &format!("mode: {mode}"),
                    );
                }
                RunEvent::ArchivePassword { run_id, password } => {
                    // Out-of-band delivery of the one-time archive password.
                    notifier.notify(
                        &format!("archive password for {run_id}"),
                        &format!("password: {password} (also cached in the OS credential store)"),
                    );
                }
                RunEvent::FileFailed {
                    destination,
                    path,
                    error,
                } => {
                    warn!(dest = %destination, path = %path, error = %error, "file failed");
                }
                RunEvent::RunFinished { report } => {
                    let verdict = match report.outcome {
                        RunOutcome::Success => "succeeded",
                        RunOutcome::Partial => "finished with failures",
                        RunOutcome::Failed => "FAILED",
                    };
                    let mut body = format!(
                        "{} in {}s, {} transferred, {} file failures",
                        verdict,
                        report.duration_secs,
                        format_bytes(report.total_bytes()),
                        report.total_failed(),
                    );
                    for dest in &report.destinations {
                        body.push_str(&format!(
                            "\n  {}: {} copied, {} skipped, {} failed{}",
                            dest.label,
                            dest.files_copied,
                            dest.files_skipped,
                            dest.files_failed,
                            dest.fatal
                                .as_deref()
                                .map(|f| format!(" [fatal: {f}]"))
                                .unwrap_or_default(),
                        ));
                    }
                    notifier.notify(&format!("backup {} {}", report.run_id, verdict), &body);
                }
                RunEvent::StageChanged { .. }
                | RunEvent::FileCopied { .. }
                | RunEvent::DestinationFinished { .. } => {}
            }
        }
    })
}
