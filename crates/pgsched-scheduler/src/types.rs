use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Family a task belongs to. Ids are only unique within a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Cron,
    At,
    Runner,
    Generic,
}

impl TaskKind {
    /// Kinds that have a definition table and can be materialised locally.
    pub const CALENDAR: [TaskKind; 3] = [TaskKind::Cron, TaskKind::At, TaskKind::Runner];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Cron => "cron",
            TaskKind::At => "at",
            TaskKind::Runner => "runner",
            TaskKind::Generic => "generic",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cron" => Ok(TaskKind::Cron),
            "at" => Ok(TaskKind::At),
            "runner" => Ok(TaskKind::Runner),
            "generic" => Ok(TaskKind::Generic),
            other => Err(format!("unknown task kind: {other}")),
        }
    }
}

/// Identity of a task: `(kind, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub kind: TaskKind,
    pub id: i64,
}

impl TaskKey {
    pub fn new(kind: TaskKind, id: i64) -> Self {
        Self { kind, id }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} task {}", self.kind, self.id)
    }
}

/// Lifecycle of a dispatched task. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Running,
    Done,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Waiting => "waiting",
            TaskState::Running => "running",
            TaskState::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// One row of `next_task()`.
///
/// When nothing is due only `wait` is meaningful (or no row comes back at
/// all); the task columns are filled once `wait` drops to zero or below.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NextTaskRow {
    /// Seconds until the next task is due. `None` means nothing is pending.
    pub wait: Option<f64>,
    pub kind: Option<String>,
    pub id: Option<i64>,
    pub job: Option<String>,
    pub role: Option<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub retroactive: Option<bool>,
}

/// A CRON / AT / RUNNER definition loaded from its table.
///
/// Equality is the change test used when a refresh diffs against the
/// previously loaded set.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarRow {
    pub kind: TaskKind,
    pub id: i64,
    pub job: String,
    pub role: String,
    /// Cron expression (CRON only).
    pub schedule: Option<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Repeat interval in seconds (RUNNER only).
    pub interval_secs: Option<f64>,
    pub retroactive: bool,
}

impl CalendarRow {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.kind, self.id)
    }
}

/// Payload of a change-channel notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
    /// Set when the listener reconnected and notifications may have been lost.
    pub resync: bool,
}

impl Notification {
    /// Wake-up sent after the listener reconnected.
    pub fn resync() -> Self {
        Self {
            channel: String::new(),
            payload: String::new(),
            resync: true,
        }
    }
}
