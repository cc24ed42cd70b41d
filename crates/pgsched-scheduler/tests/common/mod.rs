//! In-memory store shared by the integration tests.
//!
//! The lock is never held across an await point.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use pgsched_scheduler::{
    CalendarRow, Connector, NextTaskRow, Notification, Result, SchedulerError, StoreConnection,
    TaskKey, TaskKind,
};
use tokio::{sync::mpsc, time::Instant};

/// One scripted answer to `next_task()`.
#[derive(Debug, Clone)]
pub enum Reply {
    /// No row at all.
    NoRow,
    /// A row carrying only a wait value (`None` = SQL NULL).
    Wait(Option<f64>),
    /// A due generic task with this id.
    Due(i64),
    /// A due task of another kind.
    DueOf(TaskKind, i64),
    /// A due generic task with a fresh id on every call.
    DueFresh,
    /// A transport error.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaCheck {
    Present,
    Missing,
    Hang,
}

pub struct FakeState {
    pub script: VecDeque<Reply>,
    /// Answer once the script is exhausted.
    pub fallback: Reply,
    next_id: i64,
    pub polls: Vec<Instant>,
    pub runs: Vec<(String, TaskKey)>,
    pub run_duration: Duration,
    pub run_code: i64,
    pub running: usize,
    pub max_running: usize,
    pub connects: usize,
    pub open_connections: usize,
    pub connect_failures: usize,
    pub schemas: HashMap<String, SchemaCheck>,
    pub databases: Vec<String>,
    pub last_exclude: Vec<String>,
    pub calendar: HashMap<TaskKind, Vec<CalendarRow>>,
    /// `load_calendar` calls, one per kind per refresh.
    pub calendar_loads: usize,
    pub deleted_at: Vec<i64>,
    notify: Vec<mpsc::Sender<Notification>>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            script: VecDeque::new(),
            fallback: Reply::NoRow,
            next_id: 1000,
            polls: Vec::new(),
            runs: Vec::new(),
            run_duration: Duration::ZERO,
            run_code: 0,
            running: 0,
            max_running: 0,
            connects: 0,
            open_connections: 0,
            connect_failures: 0,
            schemas: HashMap::new(),
            databases: Vec::new(),
            last_exclude: Vec::new(),
            calendar: HashMap::new(),
            calendar_loads: 0,
            deleted_at: Vec::new(),
            notify: Vec::new(),
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn script(&self, replies: impl IntoIterator<Item = Reply>, fallback: Reply) {
        self.with(|s| {
            s.script = replies.into_iter().collect();
            s.fallback = fallback;
        });
    }

    /// Seconds between consecutive polls, measured from `origin`.
    pub fn poll_offsets(&self, origin: Instant) -> Vec<f64> {
        self.with(|s| {
            s.polls
                .iter()
                .map(|p| p.duration_since(origin).as_secs_f64())
                .collect()
        })
    }

    /// Deliver a notification to every live subscriber.
    pub fn notify(&self, payload: &str) {
        let senders = self.with(|s| s.notify.clone());
        for tx in senders {
            let _ = tx.try_send(Notification {
                channel: "pgs_tasks_change".into(),
                payload: payload.into(),
                resync: false,
            });
        }
    }

    fn next_reply(&self) -> Reply {
        self.with(|s| {
            s.polls.push(Instant::now());
            let reply = s.script.pop_front().unwrap_or_else(|| s.fallback.clone());
            match reply {
                Reply::DueFresh => {
                    s.next_id += 1;
                    Reply::Due(s.next_id)
                }
                other => other,
            }
        })
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Conn = FakeConn;

    async fn connect(&self, database: &str) -> Result<FakeConn> {
        self.with(|s| {
            if s.connect_failures > 0 {
                s.connect_failures -= 1;
                return Err(SchedulerError::Connection(format!("cannot reach {database}")));
            }
            s.connects += 1;
            s.open_connections += 1;
            Ok(())
        })?;
        Ok(FakeConn {
            database: database.to_string(),
            store: self.clone(),
        })
    }

    async fn subscribe(&self, _database: &str, _channel: &str) -> Result<mpsc::Receiver<Notification>> {
        let (tx, rx) = mpsc::channel(16);
        self.with(|s| s.notify.push(tx));
        Ok(rx)
    }
}

pub struct FakeConn {
    pub database: String,
    store: FakeConnector,
}

impl Drop for FakeConn {
    fn drop(&mut self) {
        self.store.with(|s| s.open_connections -= 1);
    }
}

fn due_row(kind: TaskKind, id: i64) -> NextTaskRow {
    NextTaskRow {
        wait: Some(0.0),
        kind: Some(kind.to_string()),
        id: Some(id),
        job: Some(format!("job-{id}")),
        role: Some("sched".into()),
        scheduled_time: None,
        retroactive: Some(false),
    }
}

#[async_trait]
impl StoreConnection for FakeConn {
    async fn next_task(&mut self) -> Result<Option<NextTaskRow>> {
        match self.store.next_reply() {
            Reply::NoRow => Ok(None),
            Reply::Wait(wait) => Ok(Some(NextTaskRow {
                wait,
                ..NextTaskRow::default()
            })),
            Reply::Due(id) => Ok(Some(due_row(TaskKind::Generic, id))),
            Reply::DueOf(kind, id) => Ok(Some(due_row(kind, id))),
            Reply::DueFresh => unreachable!("resolved in next_reply"),
            Reply::Fail => Err(SchedulerError::Connection("connection reset by peer".into())),
        }
    }

    async fn run_task(&mut self, key: TaskKey) -> Result<i64> {
        let duration = self.store.with(|s| {
            s.runs.push((self.database.clone(), key));
            s.running += 1;
            s.max_running = s.max_running.max(s.running);
            s.run_duration
        });
        tokio::time::sleep(duration).await;
        Ok(self.store.with(|s| {
            s.running -= 1;
            s.run_code
        }))
    }

    async fn has_schema(&mut self) -> Result<bool> {
        let check = self
            .store
            .with(|s| s.schemas.get(&self.database).copied().unwrap_or(SchemaCheck::Present));
        match check {
            SchemaCheck::Present => Ok(true),
            SchemaCheck::Missing => Ok(false),
            SchemaCheck::Hang => std::future::pending().await,
        }
    }

    async fn list_databases(&mut self, exclude: &[String]) -> Result<Vec<String>> {
        Ok(self.store.with(|s| {
            s.last_exclude = exclude.to_vec();
            s.databases
                .iter()
                .filter(|d| !exclude.contains(d))
                .cloned()
                .collect()
        }))
    }

    async fn load_calendar(&mut self, kind: TaskKind) -> Result<Vec<CalendarRow>> {
        Ok(self.store.with(|s| {
            s.calendar_loads += 1;
            s.calendar.get(&kind).cloned().unwrap_or_default()
        }))
    }

    async fn delete_at(&mut self, id: i64) -> Result<()> {
        self.store.with(|s| {
            s.deleted_at.push(id);
            if let Some(rows) = s.calendar.get_mut(&TaskKind::At) {
                rows.retain(|r| r.id != id);
            }
        });
        Ok(())
    }

    async fn close(self) -> Result<()> {
        Ok(())
    }
}
