// Daily question schedule.
//
// `run_schedule` only emits ticks; the app loop owns the job itself so that a
// slow batch never delays command handling.

use std::time::Duration;

use chrono::{DateTime, Days, FixedOffset, NaiveTime, TimeZone, Utc};
use groupquiz_core::{DeliveryOrchestrator, DeliveryOutcome, Messenger, QuizStore, Trigger};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::ScheduleConfig;

/// Emitted once per scheduled run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub scheduled_for: DateTime<Utc>,
}

/// Counts of per-group outcomes for one run of the daily job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobSummary {
    pub groups: usize,
    pub sent: usize,
    pub skipped: usize,
    pub blocked: usize,
    pub failed: usize,
}

/// The next instant strictly after `now` whose wall-clock time in `offset`
/// is `time`.
pub fn next_run_after(now: DateTime<Utc>, time: NaiveTime, offset: FixedOffset) -> DateTime<Utc> {
    let local_date = now.with_timezone(&offset).date_naive();
    let candidate = at_local(local_date.and_time(time), offset);
    if candidate > now {
        return candidate;
    }
    match local_date.checked_add_days(Days::new(1)) {
        Some(next_day) => at_local(next_day.and_time(time), offset),
        None => candidate + chrono::Duration::days(1),
    }
}

fn at_local(local: chrono::NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    let utc = local - chrono::Duration::seconds(i64::from(offset.local_minus_utc()));
    Utc.from_utc_datetime(&utc)
}

/// Sleep until each scheduled run and send a tick. Returns when the receiver
/// is gone.
pub async fn run_schedule(tx: mpsc::Sender<Tick>, schedule: ScheduleConfig) {
    loop {
        let now = Utc::now();
        let next = next_run_after(now, schedule.time, schedule.offset);
        let wait = (next - now).to_std().unwrap_or_default();
        info!("Next daily question at {next} (in {}s)", wait.as_secs());

        tokio::time::sleep(wait).await;

        if tx.send(Tick { scheduled_for: next }).await.is_err() {
            info!("Schedule receiver closed, stopping scheduler");
            return;
        }
    }
}

/// Deliver the daily question to every group that has participants, one
/// group at a time with `pause` between groups. Failures are counted and the
/// batch carries on.
pub async fn run_daily_job<S: QuizStore, M: Messenger>(
    store: &S,
    orchestrator: &DeliveryOrchestrator<S, M>,
    pause: Duration,
) -> JobSummary {
    let groups = match store.groups_with_participants() {
        Ok(groups) => groups,
        Err(e) => {
            error!("Daily job could not list groups: {e}");
            return JobSummary::default();
        }
    };

    let mut summary = JobSummary {
        groups: groups.len(),
        ..JobSummary::default()
    };
    info!("Daily job starting for {} groups", summary.groups);

    for (i, group) in groups.into_iter().enumerate() {
        if i > 0 && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        match orchestrator.deliver(group, Trigger::Scheduled).await {
            DeliveryOutcome::Sent { .. } => summary.sent += 1,
            DeliveryOutcome::SkippedNoParticipants => summary.skipped += 1,
            DeliveryOutcome::Blocked(reason) => {
                info!("Group {group} skipped: {reason}");
                summary.blocked += 1;
            }
            DeliveryOutcome::Failed(e) => {
                warn!("Daily question for group {group} failed: {e}");
                summary.failed += 1;
            }
        }
    }

    info!(
        sent = summary.sent,
        skipped = summary.skipped,
        blocked = summary.blocked,
        failed = summary.failed,
        "Daily job finished"
    );
    summary
}
