//! Kind-specific scheduling policy for locally materialised tasks.
//!
//! Every variant moves through `scheduled → fired → removed-or-rescheduled`.
//! The owning [`CalendarBook`](crate::book::CalendarBook) decides what happens
//! to the task once it is reported expired or retired.

use chrono::{DateTime, Duration, Utc};

use crate::{
    calendar::{Event, EventCalendar},
    error::{Result, SchedulerError},
    schedule::{interval_from_secs, next_cron_after, next_interval_slot, parse_cron},
    types::{CalendarRow, TaskKey, TaskKind},
};

/// Result of (re)scheduling a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheduling {
    /// At least one event is pending (or an occurrence is already queued).
    Active,
    /// Nothing will ever fire; drop the task from the active set.
    Expired(String),
}

/// What happens after one of the task's events fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterFire {
    /// The next occurrence has been inserted.
    Rescheduled(DateTime<Utc>),
    /// No further occurrences. `delete_row` asks for the persisted definition
    /// to be removed once the fired run completes.
    Retired { delete_row: bool },
}

/// One-shot task at an absolute instant.
#[derive(Debug, Clone)]
pub struct AtTask {
    row: CalendarRow,
}

impl AtTask {
    fn schedule(&mut self, cal: &mut EventCalendar, now: DateTime<Utc>) -> Scheduling {
        let key = self.row.key();
        match self.row.scheduled_time {
            // No time means as soon as possible.
            None => {
                cal.insert(Event::new(now, key));
                Scheduling::Active
            }
            Some(t) if t >= now => {
                cal.insert(Event::new(t, key));
                Scheduling::Active
            }
            Some(_) if self.row.retroactive => {
                cal.insert(Event::new(now, key));
                Scheduling::Active
            }
            Some(t) => Scheduling::Expired(format!(
                "scheduled for {t} and not retroactive"
            )),
        }
    }

    fn fired(&mut self) -> AfterFire {
        AfterFire::Retired { delete_row: true }
    }
}

/// Recurring task driven by a cron expression (UTC).
#[derive(Debug, Clone)]
pub struct CronTask {
    row: CalendarRow,
    schedule: cron::Schedule,
}

impl CronTask {
    fn schedule(&mut self, cal: &mut EventCalendar, now: DateTime<Utc>, catch_up: bool) -> Scheduling {
        let key = self.row.key();
        let missed = self.row.scheduled_time.is_some_and(|t| t < now);
        if catch_up && missed && self.row.retroactive {
            cal.insert(Event::new(now, key));
            return Scheduling::Active;
        }
        match next_cron_after(&self.schedule, now) {
            Some(next) => {
                cal.insert(Event::new(next, key));
                Scheduling::Active
            }
            None => Scheduling::Expired("cron expression has no further occurrences".to_string()),
        }
    }

    fn fired(&mut self, cal: &mut EventCalendar, fired_at: DateTime<Utc>, now: DateTime<Utc>) -> AfterFire {
        match next_cron_after(&self.schedule, fired_at.max(now)) {
            Some(next) => {
                cal.insert(Event::new(next, self.row.key()));
                AfterFire::Rescheduled(next)
            }
            None => AfterFire::Retired { delete_row: false },
        }
    }
}

/// Recurring task repeating every `interval` from its scheduled time.
#[derive(Debug, Clone)]
pub struct RunnerTask {
    row: CalendarRow,
    interval: Duration,
    /// Slot grid origin: the scheduled time, or the first time we saw the task.
    anchor: Option<DateTime<Utc>>,
}

impl RunnerTask {
    fn schedule(&mut self, cal: &mut EventCalendar, now: DateTime<Utc>, catch_up: bool) -> Scheduling {
        let key = self.row.key();
        let anchor = *self.anchor.get_or_insert(self.row.scheduled_time.unwrap_or(now));
        if anchor >= now {
            cal.insert(Event::new(anchor, key));
            return Scheduling::Active;
        }
        if catch_up && self.row.retroactive {
            cal.insert(Event::new(now, key));
            return Scheduling::Active;
        }
        match next_interval_slot(anchor, self.interval, now) {
            Some(next) => {
                cal.insert(Event::new(next, key));
                Scheduling::Active
            }
            None => Scheduling::Expired("runner interval is not positive".to_string()),
        }
    }

    fn fired(&mut self, cal: &mut EventCalendar, fired_at: DateTime<Utc>, now: DateTime<Utc>) -> AfterFire {
        let anchor = self.anchor.unwrap_or(fired_at);
        match next_interval_slot(anchor, self.interval, fired_at.max(now)) {
            Some(next) => {
                cal.insert(Event::new(next, self.row.key()));
                AfterFire::Rescheduled(next)
            }
            None => AfterFire::Retired { delete_row: false },
        }
    }
}

/// A materialised CRON, AT or RUNNER task.
#[derive(Debug, Clone)]
pub enum CalendarTask {
    At(AtTask),
    Cron(CronTask),
    Runner(RunnerTask),
}

impl CalendarTask {
    /// Build the kind-specific policy for a definition row.
    pub fn from_row(row: CalendarRow) -> Result<Self> {
        match row.kind {
            TaskKind::At => Ok(CalendarTask::At(AtTask { row })),
            TaskKind::Cron => {
                let expression = row.schedule.as_deref().ok_or_else(|| {
                    SchedulerError::InvalidSchedule(format!("cron task {} has no schedule", row.id))
                })?;
                let schedule = parse_cron(expression)?;
                Ok(CalendarTask::Cron(CronTask { row, schedule }))
            }
            TaskKind::Runner => {
                let secs = row.interval_secs.ok_or_else(|| {
                    SchedulerError::InvalidSchedule(format!("runner task {} has no interval", row.id))
                })?;
                let interval = interval_from_secs(secs)?;
                Ok(CalendarTask::Runner(RunnerTask {
                    row,
                    interval,
                    anchor: None,
                }))
            }
            TaskKind::Generic => Err(SchedulerError::InvalidSchedule(format!(
                "generic task {} cannot be materialised in the calendar",
                row.id
            ))),
        }
    }

    pub fn row(&self) -> &CalendarRow {
        match self {
            CalendarTask::At(t) => &t.row,
            CalendarTask::Cron(t) => &t.row,
            CalendarTask::Runner(t) => &t.row,
        }
    }

    pub fn key(&self) -> TaskKey {
        self.row().key()
    }

    /// Insert the first event for a newly loaded task.
    pub fn schedule(&mut self, cal: &mut EventCalendar, now: DateTime<Utc>) -> Scheduling {
        match self {
            CalendarTask::At(t) => t.schedule(cal, now),
            CalendarTask::Cron(t) => t.schedule(cal, now, true),
            CalendarTask::Runner(t) => t.schedule(cal, now, true),
        }
    }

    /// Re-derive scheduling after the stored definition changed.
    ///
    /// Pending events of the previous version are purged first. If one of
    /// them was already due the slot is kept and fires now; otherwise a
    /// recurring task resumes on its next regular occurrence, since a stored
    /// time in the past means nothing was missed once the task is loaded.
    /// When `fire_queued` is set an occurrence has already fired and is
    /// waiting to be dispatched: nothing is added on top of it, and a
    /// one-shot AT task is not rescheduled at all.
    pub fn reconcile(
        &mut self,
        cal: &mut EventCalendar,
        previous: &CalendarTask,
        fire_queued: bool,
        now: DateTime<Utc>,
    ) -> Scheduling {
        let key = previous.key();
        let overdue = cal.iter().any(|e| e.task == key && e.due <= now);
        let _ = cal.remove(Some(&key), None);

        // Keep the slot grid unless the scheduled time itself moved.
        if let (CalendarTask::Runner(t), CalendarTask::Runner(prev)) = (&mut *self, previous) {
            if prev.row.scheduled_time == t.row.scheduled_time {
                t.anchor = prev.anchor;
            }
        }

        match self {
            CalendarTask::At(_) if fire_queued => Scheduling::Active,
            CalendarTask::At(t) => t.schedule(cal, now),
            CalendarTask::Cron(_) | CalendarTask::Runner(_) if overdue && !fire_queued => {
                cal.insert(Event::new(now, key));
                Scheduling::Active
            }
            CalendarTask::Cron(t) => t.schedule(cal, now, false),
            CalendarTask::Runner(t) => t.schedule(cal, now, false),
        }
    }

    /// Advance the task after its event at `fired_at` was drained.
    pub fn fired(&mut self, cal: &mut EventCalendar, fired_at: DateTime<Utc>, now: DateTime<Utc>) -> AfterFire {
        match self {
            CalendarTask::At(t) => t.fired(),
            CalendarTask::Cron(t) => t.fired(cal, fired_at, now),
            CalendarTask::Runner(t) => t.fired(cal, fired_at, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    fn at_row(id: i64, offset_secs: Option<i64>, retroactive: bool) -> CalendarRow {
        CalendarRow {
            kind: TaskKind::At,
            id,
            job: "report".into(),
            role: "sched".into(),
            schedule: None,
            scheduled_time: offset_secs.map(|s| now() + Duration::seconds(s)),
            interval_secs: None,
            retroactive,
        }
    }

    fn cron_row(id: i64, expr: &str, missed: bool, retroactive: bool) -> CalendarRow {
        CalendarRow {
            kind: TaskKind::Cron,
            schedule: Some(expr.into()),
            scheduled_time: missed.then(|| now() - Duration::minutes(5)),
            retroactive,
            ..at_row(id, None, false)
        }
    }

    fn runner_row(id: i64, offset_secs: i64, every: f64, retroactive: bool) -> CalendarRow {
        CalendarRow {
            kind: TaskKind::Runner,
            interval_secs: Some(every),
            scheduled_time: Some(now() + Duration::seconds(offset_secs)),
            retroactive,
            ..at_row(id, None, false)
        }
    }

    fn schedule(row: CalendarRow) -> (CalendarTask, EventCalendar, Scheduling) {
        let mut cal = EventCalendar::new();
        let mut task = CalendarTask::from_row(row).unwrap();
        let result = task.schedule(&mut cal, now());
        (task, cal, result)
    }

    #[test]
    fn future_at_inserts_one_event_at_its_time() {
        let (_, cal, result) = schedule(at_row(1, Some(90), false));
        assert_eq!(result, Scheduling::Active);
        assert_eq!(cal.len(), 1);
        assert_eq!(cal.peek_due_time(), Some(now() + Duration::seconds(90)));
    }

    #[test]
    fn past_retroactive_at_fires_immediately() {
        let (_, cal, result) = schedule(at_row(1, Some(-600), true));
        assert_eq!(result, Scheduling::Active);
        assert_eq!(cal.len(), 1);
        assert_eq!(cal.peek_due_time(), Some(now()));
    }

    #[test]
    fn past_non_retroactive_at_expires() {
        let (_, cal, result) = schedule(at_row(1, Some(-600), false));
        assert!(matches!(result, Scheduling::Expired(_)));
        assert!(cal.is_empty());
    }

    #[test]
    fn at_without_time_runs_as_soon_as_possible() {
        let (_, cal, result) = schedule(at_row(1, None, false));
        assert_eq!(result, Scheduling::Active);
        assert_eq!(cal.peek_due_time(), Some(now()));
    }

    #[test]
    fn fired_at_retires_and_asks_for_row_deletion() {
        let (mut task, mut cal, _) = schedule(at_row(1, Some(0), false));
        let due = cal.drain_due(now());
        assert_eq!(due.len(), 1);
        assert_eq!(
            task.fired(&mut cal, due[0].due, now()),
            AfterFire::Retired { delete_row: true }
        );
        assert!(cal.is_empty());
    }

    #[test]
    fn at_reconcile_moves_the_event() {
        let (task, mut cal, _) = schedule(at_row(1, Some(60), false));
        let mut updated = CalendarTask::from_row(at_row(1, Some(300), false)).unwrap();
        assert_eq!(updated.reconcile(&mut cal, &task, false, now()), Scheduling::Active);
        assert_eq!(cal.len(), 1);
        assert_eq!(cal.peek_due_time(), Some(now() + Duration::seconds(300)));
    }

    #[test]
    fn at_reconcile_with_queued_fire_does_not_reschedule() {
        let (task, mut cal, _) = schedule(at_row(1, Some(-60), true));
        let _ = cal.drain_due(now());
        let mut updated = CalendarTask::from_row(at_row(1, Some(-30), true)).unwrap();
        assert_eq!(updated.reconcile(&mut cal, &task, true, now()), Scheduling::Active);
        assert!(cal.is_empty());
    }

    #[test]
    fn cron_schedules_next_occurrence() {
        let (_, cal, result) = schedule(cron_row(2, "*/10 * * * *", false, false));
        assert_eq!(result, Scheduling::Active);
        assert_eq!(cal.peek_due_time(), Some(now() + Duration::minutes(10)));
    }

    #[test]
    fn missed_retroactive_cron_catches_up_once() {
        let (mut task, mut cal, _) = schedule(cron_row(2, "*/10 * * * *", true, true));
        assert_eq!(cal.peek_due_time(), Some(now()));
        let due = cal.drain_due(now());
        assert_eq!(due.len(), 1);
        let after = task.fired(&mut cal, due[0].due, now());
        assert_eq!(after, AfterFire::Rescheduled(now() + Duration::minutes(10)));
        assert_eq!(cal.len(), 1);
    }

    #[test]
    fn missed_cron_without_retroactive_skips_to_next() {
        let (_, cal, _) = schedule(cron_row(2, "*/10 * * * *", true, false));
        assert_eq!(cal.peek_due_time(), Some(now() + Duration::minutes(10)));
    }

    #[test]
    fn cron_reconcile_with_queued_fire_adds_no_catch_up() {
        let (mut task, mut cal, _) = schedule(cron_row(2, "*/10 * * * *", true, true));
        let due = cal.drain_due(now());
        task.fired(&mut cal, due[0].due, now());

        let mut updated = CalendarTask::from_row(cron_row(2, "*/20 * * * *", true, true)).unwrap();
        assert_eq!(updated.reconcile(&mut cal, &task, true, now()), Scheduling::Active);
        assert_eq!(cal.len(), 1);
        assert_eq!(cal.peek_due_time(), Some(now() + Duration::minutes(20)));
    }

    #[test]
    fn cron_edit_after_catch_up_fired_adds_no_second_run() {
        let (mut task, mut cal, _) = schedule(cron_row(2, "*/10 * * * *", true, true));
        let due = cal.drain_due(now());
        task.fired(&mut cal, due[0].due, now());

        // stored time is still in the past, but nothing was missed since
        let later = now() + Duration::minutes(2);
        let mut renamed = cron_row(2, "*/10 * * * *", true, true);
        renamed.role = "other".into();
        let mut updated = CalendarTask::from_row(renamed).unwrap();
        assert_eq!(updated.reconcile(&mut cal, &task, false, later), Scheduling::Active);
        assert_eq!(cal.len(), 1);
        assert_eq!(cal.peek_due_time(), Some(now() + Duration::minutes(10)));
    }

    #[test]
    fn edit_keeps_an_overdue_slot() {
        let (task, mut cal, _) = schedule(cron_row(2, "*/10 * * * *", false, false));
        // the 12:10 event is pending but was not drained yet
        let late = now() + Duration::minutes(11);
        let mut updated = CalendarTask::from_row(cron_row(2, "*/5 * * * *", false, false)).unwrap();
        updated.reconcile(&mut cal, &task, false, late);
        assert_eq!(cal.len(), 1);
        assert_eq!(cal.peek_due_time(), Some(late));
    }

    #[test]
    fn cron_without_expression_is_invalid() {
        let mut row = cron_row(2, "* * * * *", false, false);
        row.schedule = None;
        assert!(CalendarTask::from_row(row).is_err());
    }

    #[test]
    fn runner_repeats_on_its_interval() {
        let (mut task, mut cal, _) = schedule(runner_row(3, 30, 60.0, false));
        let first = now() + Duration::seconds(30);
        assert_eq!(cal.peek_due_time(), Some(first));
        let due = cal.drain_due(first);
        assert_eq!(
            task.fired(&mut cal, due[0].due, first),
            AfterFire::Rescheduled(first + Duration::seconds(60))
        );
    }

    #[test]
    fn late_runner_without_retroactive_realigns() {
        let (_, cal, _) = schedule(runner_row(3, -150, 60.0, false));
        // anchor at -150s, slots at -90, -30, +30
        assert_eq!(cal.peek_due_time(), Some(now() + Duration::seconds(30)));
    }

    #[test]
    fn late_retroactive_runner_fires_now_then_realigns() {
        let (mut task, mut cal, _) = schedule(runner_row(3, -150, 60.0, true));
        assert_eq!(cal.peek_due_time(), Some(now()));
        let due = cal.drain_due(now());
        assert_eq!(
            task.fired(&mut cal, due[0].due, now()),
            AfterFire::Rescheduled(now() + Duration::seconds(30))
        );
    }

    #[test]
    fn runner_edit_keeps_slot_grid_without_extra_run() {
        let (mut task, mut cal, _) = schedule(runner_row(3, -150, 60.0, true));
        let due = cal.drain_due(now());
        task.fired(&mut cal, due[0].due, now());

        let later = now() + Duration::seconds(10);
        let mut renamed = runner_row(3, -150, 60.0, true);
        renamed.role = "other".into();
        let mut updated = CalendarTask::from_row(renamed).unwrap();
        assert_eq!(updated.reconcile(&mut cal, &task, false, later), Scheduling::Active);
        assert!(cal.drain_due(later).is_empty());
        assert_eq!(cal.peek_due_time(), Some(now() + Duration::seconds(30)));
    }

    #[test]
    fn runner_with_huge_interval_is_invalid() {
        assert!(CalendarTask::from_row(runner_row(3, -60, 1e13, false)).is_err());
    }

    #[test]
    fn runner_with_zero_interval_is_invalid() {
        assert!(CalendarTask::from_row(runner_row(3, 0, 0.0, false)).is_err());
    }

    #[test]
    fn generic_rows_are_not_calendar_tasks() {
        let mut row = at_row(9, None, false);
        row.kind = TaskKind::Generic;
        assert!(CalendarTask::from_row(row).is_err());
    }
}
