//! Per-database bookkeeping for the local calendar layer.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    calendar::EventCalendar,
    calendar_task::{AfterFire, CalendarTask, Scheduling},
    types::{CalendarRow, TaskKey, TaskKind},
};

/// An occurrence that fired and is waiting for a free connection.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredOccurrence {
    pub key: TaskKey,
    pub job: String,
    pub role: String,
    pub due: DateTime<Utc>,
    pub retroactive: bool,
    /// The persisted definition is deleted once this run completes (AT).
    pub delete_row: bool,
}

impl FiredOccurrence {
    fn new(row: &CalendarRow, due: DateTime<Utc>, delete_row: bool) -> Self {
        Self {
            key: row.key(),
            job: row.job.clone(),
            role: row.role.clone(),
            due,
            retroactive: row.retroactive,
            delete_row,
        }
    }
}

/// Counts from one [`CalendarBook::refresh`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub expired: usize,
}

impl RefreshSummary {
    pub fn changed(&self) -> bool {
        self.added + self.updated + self.removed + self.expired > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retirement {
    /// Fired; the run has not completed yet.
    Running,
    /// Run completed; the row still has to be deleted.
    Completed,
}

/// The event calendar together with the tasks it was built from.
///
/// Keys in `retired` have fired their last occurrence and stay out of
/// refreshes until their row is confirmed deleted, so a one-shot task can
/// never fire twice. Keys in `expired` will never fire again; their row is
/// remembered so an unchanged definition is not re-evaluated on every refresh.
#[derive(Debug, Default)]
pub struct CalendarBook {
    calendar: EventCalendar,
    tasks: HashMap<TaskKey, CalendarTask>,
    fired: VecDeque<FiredOccurrence>,
    retired: HashMap<TaskKey, Retirement>,
    expired: HashMap<TaskKey, CalendarRow>,
}

impl CalendarBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff the full definition list of `kind` against what is loaded.
    ///
    /// New rows are scheduled, changed rows reconciled, vanished rows purged
    /// from the calendar and from the fired queue.
    pub fn refresh(&mut self, kind: TaskKind, rows: Vec<CalendarRow>, now: DateTime<Utc>) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        let mut seen = HashSet::with_capacity(rows.len());

        for row in rows {
            let key = row.key();
            if key.kind != kind {
                warn!(task = %key, expected = %kind, "calendar row of the wrong kind ignored");
                continue;
            }
            seen.insert(key);
            if self.retired.contains_key(&key) {
                continue;
            }
            if self.expired.get(&key) == Some(&row) {
                continue;
            }
            self.expired.remove(&key);

            match self.tasks.get(&key) {
                Some(previous) if previous.row() == &row => {}
                Some(_) => {
                    if self.reconcile(row, now) {
                        summary.updated += 1;
                    } else {
                        summary.expired += 1;
                    }
                }
                None => {
                    if self.add(row, now) {
                        summary.added += 1;
                    } else {
                        summary.expired += 1;
                    }
                }
            }
        }

        let vanished: Vec<TaskKey> = self
            .tasks
            .keys()
            .filter(|k| k.kind == kind && !seen.contains(k))
            .copied()
            .collect();
        for key in vanished {
            self.tasks.remove(&key);
            let _ = self.calendar.remove(Some(&key), None);
            debug!(task = %key, "calendar task removed");
            summary.removed += 1;
        }
        self.fired.retain(|f| f.key.kind != kind || seen.contains(&f.key));
        self.retired.retain(|k, _| k.kind != kind || seen.contains(k));
        self.expired.retain(|k, _| k.kind != kind || seen.contains(k));

        summary
    }

    fn add(&mut self, row: CalendarRow, now: DateTime<Utc>) -> bool {
        let key = row.key();
        let mut task = match CalendarTask::from_row(row.clone()) {
            Ok(task) => task,
            Err(e) => {
                self.expire(row, &e.to_string());
                return false;
            }
        };
        match task.schedule(&mut self.calendar, now) {
            Scheduling::Active => {
                debug!(task = %key, "calendar task scheduled");
                self.tasks.insert(key, task);
                true
            }
            Scheduling::Expired(reason) => {
                self.expire(row, &reason);
                false
            }
        }
    }

    fn reconcile(&mut self, row: CalendarRow, now: DateTime<Utc>) -> bool {
        let key = row.key();
        let Some(previous) = self.tasks.remove(&key) else {
            return self.add(row, now);
        };
        let mut task = match CalendarTask::from_row(row.clone()) {
            Ok(task) => task,
            Err(e) => {
                let _ = self.calendar.remove(Some(&key), None);
                self.expire(row, &e.to_string());
                return false;
            }
        };
        let queued = self.fired.iter().any(|f| f.key == key);
        match task.reconcile(&mut self.calendar, &previous, queued, now) {
            Scheduling::Active => {
                debug!(task = %key, "calendar task updated");
                self.tasks.insert(key, task);
                true
            }
            Scheduling::Expired(reason) => {
                self.expire(row, &reason);
                false
            }
        }
    }

    fn expire(&mut self, row: CalendarRow, reason: &str) {
        info!(task = %row.key(), job = %row.job, reason, "calendar task expired");
        self.expired.insert(row.key(), row);
    }

    /// Move every event due at or before `now` into the fired queue and
    /// advance its task. Returns the number of occurrences queued.
    ///
    /// An occurrence of a task that is already queued is coalesced into it.
    pub fn collect_due(&mut self, now: DateTime<Utc>) -> usize {
        let mut queued = 0;
        for event in self.calendar.drain_due(now) {
            let Some(task) = self.tasks.get_mut(&event.task) else {
                continue;
            };
            let after = task.fired(&mut self.calendar, event.due, now);
            let delete_row = matches!(after, AfterFire::Retired { delete_row: true });
            let occurrence = FiredOccurrence::new(task.row(), event.due, delete_row);

            if let AfterFire::Retired { delete_row } = after {
                if let Some(task) = self.tasks.remove(&event.task) {
                    if delete_row {
                        self.retired.insert(event.task, Retirement::Running);
                    } else {
                        self.expire(task.row().clone(), "no further occurrences");
                    }
                }
            }

            if self.fired.iter().any(|f| f.key == occurrence.key) {
                debug!(task = %occurrence.key, "occurrence coalesced with a queued one");
                continue;
            }
            self.fired.push_back(occurrence);
            queued += 1;
        }
        queued
    }

    /// Pop up to `limit` queued occurrences in firing order, skipping (and
    /// keeping) those whose task is still busy.
    pub fn take_dispatchable<F>(&mut self, limit: usize, is_busy: F) -> Vec<FiredOccurrence>
    where
        F: Fn(&TaskKey) -> bool,
    {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.fired.len());
        while let Some(occurrence) = self.fired.pop_front() {
            if taken.len() < limit && !is_busy(&occurrence.key) {
                taken.push(occurrence);
            } else {
                kept.push_back(occurrence);
            }
        }
        self.fired = kept;
        taken
    }

    /// Record that the run of `key` completed. Returns `true` when its row
    /// now has to be deleted.
    pub fn complete(&mut self, key: &TaskKey) -> bool {
        match self.retired.get_mut(key) {
            Some(state) => {
                *state = Retirement::Completed;
                true
            }
            None => false,
        }
    }

    /// Retired tasks whose run completed and whose row is still present.
    pub fn pending_deletions(&self) -> Vec<TaskKey> {
        let mut keys: Vec<TaskKey> = self
            .retired
            .iter()
            .filter(|(_, state)| **state == Retirement::Completed)
            .map(|(k, _)| *k)
            .collect();
        keys.sort_by_key(|k| k.id);
        keys
    }

    /// The row of `key` was deleted; it may be loaded again if it reappears.
    pub fn confirm_deleted(&mut self, key: &TaskKey) {
        self.retired.remove(key);
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.calendar.peek_due_time()
    }

    /// Whether fired occurrences are waiting for dispatch.
    pub fn fire_pending(&self) -> bool {
        !self.fired.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.fired.len()
    }

    pub fn is_loaded(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn is_retired(&self, key: &TaskKey) -> bool {
        self.retired.contains_key(key)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn calendar(&self) -> &EventCalendar {
        &self.calendar
    }
}
