//! Time-ordered calendar of pending occurrences for locally materialised
//! tasks.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::{
    error::{Result, SchedulerError},
    types::{TaskKey, TaskKind},
};

/// One pending occurrence. `task` is a lookup key, not ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub due: DateTime<Utc>,
    pub kind: TaskKind,
    pub task: TaskKey,
}

impl Event {
    pub fn new(due: DateTime<Utc>, task: TaskKey) -> Self {
        Self {
            due,
            kind: task.kind,
            task,
        }
    }
}

/// Events sorted ascending by due time, ties in insertion order.
#[derive(Debug, Default)]
pub struct EventCalendar {
    events: Vec<Event>,
}

impl EventCalendar {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Insert keeping the order. Returns `false` when an identical event is
    /// already present.
    pub fn insert(&mut self, event: Event) -> bool {
        if self.events.contains(&event) {
            return false;
        }
        // After every event due at or before this one: equal times keep
        // insertion order.
        let at = self.events.partition_point(|e| e.due <= event.due);
        self.events.insert(at, event);
        true
    }

    /// Earliest due time, or `None` when empty.
    pub fn peek_due_time(&self) -> Option<DateTime<Utc>> {
        self.events.first().map(|e| e.due)
    }

    /// Remove and return every event due at or before `as_of`, earliest first.
    pub fn drain_due(&mut self, as_of: DateTime<Utc>) -> Vec<Event> {
        let split = self.events.partition_point(|e| e.due <= as_of);
        self.events.drain(..split).collect()
    }

    /// Remove every event matching `task` and/or `kind`.
    ///
    /// At least one filter is required; with none the calendar is left
    /// untouched and [`SchedulerError::MissingFilter`] is returned.
    pub fn remove(&mut self, task: Option<&TaskKey>, kind: Option<TaskKind>) -> Result<usize> {
        if task.is_none() && kind.is_none() {
            warn!("calendar remove called without a filter");
            return Err(SchedulerError::MissingFilter);
        }
        let before = self.events.len();
        self.events.retain(|e| {
            let task_match = task.map_or(true, |t| e.task == *t);
            let kind_match = kind.map_or(true, |k| e.kind == k);
            !(task_match && kind_match)
        });
        Ok(before - self.events.len())
    }

    /// Whether any event for `task` is pending.
    pub fn contains_task(&self, task: &TaskKey) -> bool {
        self.events.iter().any(|e| e.task == *task)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}
