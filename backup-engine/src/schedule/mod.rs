//! Scheduled operation: slot timetable, single-instance lock, hooks.
//!
//! A scheduled process is one long-lived task that wakes on a ticker. A run
//! fires when the current local time falls within ± `interval_minutes` of a
//! configured HH:MM slot and that slot has not fired yet today.

pub mod hooks;
pub mod lock;

use std::collections::HashSet;

use chrono::{Duration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::RunConfig;
use crate::error::Result;
use crate::events::EventSender;
use crate::orchestrator::Orchestrator;

/// The wall-clock slots a scheduled process fires on.
pub struct Timetable {
    slots: Vec<NaiveTime>,
    tolerance_minutes: u32,
}

impl Timetable {
    pub fn new(slots: Vec<NaiveTime>, tolerance_minutes: u32) -> Self {
        Self {
            slots,
            tolerance_minutes: tolerance_minutes.max(1),
        }
    }

    /// The slot `now` falls within tolerance of, if any.
    pub fn due_slot(&self, now: NaiveDateTime) -> Option<NaiveTime> {
        let tolerance = Duration::minutes(i64::from(self.tolerance_minutes));
        self.slots.iter().copied().find(|slot| {
            let slot_at = now.date().and_time(*slot);
            let delta = now - slot_at;
            delta <= tolerance && delta >= -tolerance
        })
    }
}

/// Remembers which slots already fired, per day, so a slot fires at most
/// once per day no matter how often the ticker lands inside its window.
#[derive(Default)]
pub struct SlotLedger {
    fired: HashSet<(NaiveDate, NaiveTime)>,
}

impl SlotLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_fired(&self, date: NaiveDate, slot: NaiveTime) -> bool {
        self.fired.contains(&(date, slot))
    }

    pub fn mark_fired(&mut self, date: NaiveDate, slot: NaiveTime) {
        self.fired.insert((date, slot));
    }
}

/// Long-lived scheduled loop. Holds the single-instance lock for the whole
/// process lifetime; each due slot runs one orchestration with that lock
/// already held. Returns when cancelled.
pub async fn run_scheduled(
    cfg: RunConfig,
    events: EventSender,
    cancel: CancellationToken,
) -> Result<()> {
    let _lock = lock::acquire(&cfg.schedule.lock_file)?;
    info!(
        slots = cfg.schedule.times.len(),
        interval_minutes = cfg.schedule.interval_minutes,
        "scheduler started"
    );

    let timetable = Timetable::new(cfg.schedule.times.clone(), cfg.schedule.interval_minutes);
    let mut ledger = SlotLedger::new();

    // Tick at most once a minute, never slower than the tolerance window.
    let tick_secs = 60u64.min(u64::from(cfg.schedule.interval_minutes) * 60);
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(tick_secs.max(1)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => {
                info!("scheduler stopping");
                return Ok(());
            }
        }

        let now = Local::now().naive_local();
        let Some(slot) = timetable.due_slot(now) else {
            continue;
        };
        if ledger.has_fired(now.date(), slot) {
            continue;
        }
        ledger.mark_fired(now.date(), slot);

        info!(slot = %slot.format("%H:%M"), "scheduled slot due, starting run");
        let orchestrator =
            Orchestrator::new(cfg.clone(), events.clone(), cancel.child_token()).with_lock_held();
        match orchestrator.run().await {
            Ok(report) => {
                info!(run_id = %report.run_id, outcome = ?report.outcome, "scheduled run finished")
            }
            Err(e) => error!(error = %e, "scheduled run failed"),
        }
    }
}
