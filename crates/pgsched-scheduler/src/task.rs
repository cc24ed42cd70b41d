use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    book::FiredOccurrence,
    error::{Result, SchedulerError},
    store::{Connector, StoreConnection},
    types::{NextTaskRow, TaskKey, TaskKind, TaskState},
};

/// How a task run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `run_task` returned a non-negative code.
    Succeeded(i64),
    /// `run_task` returned a negative failure code.
    Failed(i64),
    /// The database layer failed before a result code came back.
    Error(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }

    /// The result code, when `run_task` produced one.
    pub fn code(&self) -> Option<i64> {
        match self {
            Outcome::Succeeded(c) | Outcome::Failed(c) => Some(*c),
            Outcome::Error(_) => None,
        }
    }
}

/// Delivered to the owning dispatcher exactly once per task.
#[derive(Debug)]
pub struct TaskReport {
    pub task: Task,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// The unit of dispatch.
///
/// A task holds a database handle only inside [`Task::execute`], so it owns
/// one exactly while it is running.
#[derive(Debug, Clone)]
pub struct Task {
    pub database: String,
    pub key: TaskKey,
    pub job: String,
    pub role: String,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub retroactive: bool,
    state: TaskState,
}

impl Task {
    pub fn new(database: &str, key: TaskKey, job: &str, role: &str) -> Self {
        Self {
            database: database.to_string(),
            key,
            job: job.to_string(),
            role: role.to_string(),
            scheduled_time: None,
            retroactive: false,
            state: TaskState::Waiting,
        }
    }

    /// Materialise a due row from `next_task()`.
    pub fn from_row(database: &str, row: &NextTaskRow) -> Result<Self> {
        let kind_text = row.kind.as_deref().ok_or_else(|| {
            SchedulerError::UnknownKind("next_task returned a due row without a kind".to_string())
        })?;
        let kind: TaskKind = kind_text.parse().map_err(SchedulerError::UnknownKind)?;
        let id = row.id.ok_or_else(|| {
            SchedulerError::Connection(format!("next_task returned a due {kind} row without an id"))
        })?;

        let mut task = Task::new(
            database,
            TaskKey::new(kind, id),
            row.job.as_deref().unwrap_or_default(),
            row.role.as_deref().unwrap_or_default(),
        );
        task.scheduled_time = row.scheduled_time;
        task.retroactive = row.retroactive.unwrap_or(false);
        Ok(task)
    }

    /// Materialise a fired calendar occurrence.
    pub fn from_occurrence(database: &str, occurrence: &FiredOccurrence) -> Self {
        let mut task = Task::new(database, occurrence.key, &occurrence.job, &occurrence.role);
        task.scheduled_time = Some(occurrence.due);
        task.retroactive = occurrence.retroactive;
        task
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Open a dedicated handle and run the task to completion.
    ///
    /// A handle that cannot be opened is reported as a database error.
    pub async fn run<C: Connector>(self, connector: &C) -> TaskReport {
        let started = Instant::now();
        if self.state != TaskState::Waiting {
            warn!(database = %self.database, task = %self.key, state = %self.state, "task run requested twice");
            return self.finish(Outcome::Error("task was already started".to_string()), started);
        }
        match connector.connect(&self.database).await {
            Ok(conn) => self.execute(conn).await,
            Err(e) => self.finish(Outcome::Error(format!("cannot open task connection: {e}")), started),
        }
    }

    /// Run the task on `conn`, release it, and report.
    pub async fn execute<S: StoreConnection>(mut self, mut conn: S) -> TaskReport {
        let started = Instant::now();
        self.state = TaskState::Running;
        debug!(database = %self.database, task = %self.key, "RUN {} job {} as {}", self.key, self.job, self.role);

        let outcome = match conn.run_task(self.key).await {
            Ok(code) if code >= 0 => Outcome::Succeeded(code),
            Ok(code) => Outcome::Failed(code),
            Err(e) => Outcome::Error(e.to_string()),
        };
        if let Err(e) = conn.close().await {
            debug!(database = %self.database, task = %self.key, error = %e, "error releasing task connection");
        }
        self.finish(outcome, started)
    }

    fn finish(mut self, outcome: Outcome, started: Instant) -> TaskReport {
        self.state = TaskState::Done;
        let elapsed = started.elapsed();
        match &outcome {
            Outcome::Succeeded(code) => {
                info!(database = %self.database, task = %self.key, job = %self.job, code, "task finished: SUCCESS")
            }
            Outcome::Failed(code) => {
                warn!(database = %self.database, task = %self.key, job = %self.job, code, "task finished: FAILURE")
            }
            Outcome::Error(e) => {
                warn!(database = %self.database, task = %self.key, job = %self.job, error = %e, "task finished: database error")
            }
        }
        TaskReport {
            task: self,
            outcome,
            elapsed,
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, job {} with role {}", self.key, self.job, self.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CalendarRow;
    use async_trait::async_trait;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    /// Handle that answers `run_task` with a fixed result and counts releases.
    struct ScriptedConn {
        result: Option<i64>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StoreConnection for ScriptedConn {
        async fn next_task(&mut self) -> Result<Option<NextTaskRow>> {
            Ok(None)
        }
        async fn run_task(&mut self, _key: TaskKey) -> Result<i64> {
            self.result
                .ok_or_else(|| SchedulerError::Connection("server closed the connection".into()))
        }
        async fn has_schema(&mut self) -> Result<bool> {
            Ok(true)
        }
        async fn list_databases(&mut self, _exclude: &[String]) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn load_calendar(&mut self, _kind: TaskKind) -> Result<Vec<CalendarRow>> {
            Ok(Vec::new())
        }
        async fn delete_at(&mut self, _id: i64) -> Result<()> {
            Ok(())
        }
        async fn close(self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn task() -> Task {
        Task::new("tenant", TaskKey::new(TaskKind::Generic, 3), "vacuum", "sched")
    }

    async fn execute_with(result: Option<i64>) -> (TaskReport, usize) {
        let closed = Arc::new(AtomicUsize::new(0));
        let conn = ScriptedConn {
            result,
            closed: Arc::clone(&closed),
        };
        let report = task().execute(conn).await;
        (report, closed.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn success_releases_handle_once() {
        let (report, closed) = execute_with(Some(0)).await;
        assert_eq!(report.outcome, Outcome::Succeeded(0));
        assert_eq!(report.task.state(), TaskState::Done);
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn negative_code_is_business_failure() {
        let (report, closed) = execute_with(Some(-3)).await;
        assert_eq!(report.outcome, Outcome::Failed(-3));
        assert!(!report.outcome.is_success());
        assert_eq!(report.outcome.code(), Some(-3));
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn transport_error_is_distinct_from_failure_code() {
        let (report, closed) = execute_with(None).await;
        assert!(matches!(report.outcome, Outcome::Error(ref e) if e.contains("server closed")));
        assert_eq!(report.outcome.code(), None);
        assert_eq!(report.task.state(), TaskState::Done);
        assert_eq!(closed, 1);
    }

    #[test]
    fn due_row_becomes_waiting_task() {
        let row = NextTaskRow {
            wait: Some(0.0),
            kind: Some("RUNNER".into()),
            id: Some(11),
            job: Some("rollup".into()),
            role: Some("reporting".into()),
            scheduled_time: None,
            retroactive: Some(true),
        };
        let task = Task::from_row("tenant", &row).unwrap();
        assert_eq!(task.key, TaskKey::new(TaskKind::Runner, 11));
        assert_eq!(task.state(), TaskState::Waiting);
        assert!(task.retroactive);
        assert_eq!(task.to_string(), "runner task 11, job rollup with role reporting");
    }

    #[test]
    fn row_with_unknown_kind_is_rejected() {
        let row = NextTaskRow {
            wait: Some(0.0),
            kind: Some("weekly".into()),
            id: Some(1),
            ..NextTaskRow::default()
        };
        assert!(matches!(
            Task::from_row("tenant", &row),
            Err(SchedulerError::UnknownKind(_))
        ));
    }
}
