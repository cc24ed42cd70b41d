//! The per-database fetch → dispatch → wait cycle.
//!
//! A [`Dispatcher`] owns one polling handle, the set of running tasks and a
//! single wake-up slot. Everything it does happens on its own `run` loop:
//!
//! | Wake-up source          | Action                                        |
//! |-------------------------|-----------------------------------------------|
//! | next-check timer        | `request_next()`                              |
//! | change notification     | re-arm next-check at zero, reload calendar    |
//! | task completion         | drop from active set, delete retired AT rows  |
//! | calendar timer          | reload if due, fire due events, dispatch      |
//! | shutdown                | close the polling handle and return           |

use std::{
    collections::HashMap,
    future::pending,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use pgsched_core::PgschedConfig;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    book::CalendarBook,
    error::{Result, SchedulerError},
    store::{Connector, StoreConnection},
    task::{Outcome, Task, TaskReport},
    timer::WakeTimer,
    types::{CalendarRow, NextTaskRow, Notification, TaskKey, TaskKind},
};

/// Tuning for one dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherSettings {
    /// Connection budget: one polling handle plus `max_conn - 1` tasks.
    pub max_conn: u32,
    pub check_period: Duration,
    pub retry_interval: Duration,
    pub notify_channel: String,
    /// Reload interval of the calendar layer; `None` disables the layer.
    pub calendar_refresh: Option<Duration>,
}

impl DispatcherSettings {
    pub fn from_config(config: &PgschedConfig) -> Self {
        Self {
            max_conn: config.scheduler.max_conn,
            check_period: config.scheduler.check_period(),
            retry_interval: config.scheduler.retry_interval(),
            notify_channel: config.scheduler.notify_channel.clone(),
            calendar_refresh: config
                .calendar
                .enabled
                .then(|| config.calendar.refresh_interval()),
        }
    }

    /// Maximum number of simultaneously running tasks.
    pub fn ceiling(&self) -> usize {
        self.max_conn.saturating_sub(1) as usize
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from_config(&PgschedConfig::default())
    }
}

/// Counters returned when a dispatcher stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub polls: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub errored: u64,
    pub store_errors: u64,
    pub backpressure: u64,
    pub notifications: u64,
    pub calendar_fires: u64,
}

/// Wall clock the calendar layer schedules against.
type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

struct CalendarLayer {
    book: CalendarBook,
    timer: WakeTimer,
    refresh_every: Duration,
    next_refresh: Instant,
    refresh_due: bool,
}

/// Drives task dispatch for one database.
pub struct Dispatcher<C: Connector> {
    database: String,
    connector: Arc<C>,
    conn: Option<C::Conn>,
    settings: DispatcherSettings,
    /// Running tasks and when they were dispatched.
    active: HashMap<TaskKey, Instant>,
    next_check: WakeTimer,
    calendar: Option<CalendarLayer>,
    clock: Clock,
    done_tx: mpsc::UnboundedSender<TaskReport>,
    done_rx: mpsc::UnboundedReceiver<TaskReport>,
    stats: DispatcherStats,
}

impl<C: Connector> Dispatcher<C> {
    /// `conn` becomes the polling handle; with `None` one is opened on the
    /// first poll.
    pub fn new(
        database: impl Into<String>,
        connector: Arc<C>,
        conn: Option<C::Conn>,
        settings: DispatcherSettings,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let calendar = settings.calendar_refresh.map(|every| CalendarLayer {
            book: CalendarBook::new(),
            timer: WakeTimer::new(),
            refresh_every: every,
            next_refresh: Instant::now(),
            refresh_due: true,
        });
        Self {
            database: database.into(),
            connector,
            conn,
            settings,
            active: HashMap::new(),
            next_check: WakeTimer::new(),
            calendar,
            clock: Arc::new(Utc::now),
            done_tx,
            done_rx,
            stats: DispatcherStats::default(),
        }
    }

    /// Replace the system clock used by the calendar layer.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> DispatcherStats {
        info!(
            database = %self.database,
            max_conn = self.settings.max_conn,
            calendar = self.calendar.is_some(),
            "dispatcher started"
        );

        let mut notifications = match self
            .connector
            .subscribe(&self.database, &self.settings.notify_channel)
            .await
        {
            Ok(rx) => {
                debug!(database = %self.database, channel = %self.settings.notify_channel, "listening for changes");
                Some(rx)
            }
            Err(e) => {
                warn!(database = %self.database, error = %e, "cannot listen for changes, relying on polling");
                None
            }
        };

        self.next_check.arm(Duration::ZERO);
        if let Some(layer) = self.calendar.as_mut() {
            layer.timer.arm(Duration::ZERO);
        }

        while !*shutdown.borrow() {
            tokio::select! {
                _ = self.next_check.fired() => self.request_next().await,
                _ = calendar_wake(&mut self.calendar) => self.service_calendar().await,
                Some(report) = self.done_rx.recv() => self.task_finished(report).await,
                note = next_notification(&mut notifications) => match note {
                    Some(note) => self.notified(note),
                    None => {
                        warn!(database = %self.database, "change listener closed, relying on polling");
                        notifications = None;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.stop().await
    }

    /// Ask the store for the next due task and act on the answer.
    async fn request_next(&mut self) {
        if self.active.len() >= self.settings.ceiling() {
            self.stats.backpressure += 1;
            debug!(
                database = %self.database,
                active = self.active.len(),
                "connection ceiling reached, retrying later"
            );
            self.arm(self.settings.retry_interval);
            return;
        }

        self.stats.polls += 1;
        match self.poll_store().await {
            Ok(None) | Ok(Some(NextTaskRow { wait: None, .. })) => {
                debug!(database = %self.database, "no task pending");
                self.arm(self.settings.check_period);
            }
            Ok(Some(NextTaskRow { wait: Some(w), .. })) if w.is_nan() => {
                self.store_error(SchedulerError::Connection("next_task returned a NaN wait".to_string()));
            }
            Ok(Some(NextTaskRow { wait: Some(w), .. })) if w > 0.0 => {
                let delay = Duration::try_from_secs_f64(w)
                    .unwrap_or(self.settings.check_period)
                    .min(self.settings.check_period);
                debug!(database = %self.database, wait_secs = w, sleep_secs = delay.as_secs_f64(), "next task not yet due");
                self.arm(delay);
            }
            Ok(Some(row)) => match Task::from_row(&self.database, &row) {
                Ok(task) if self.calendar.is_some() && task.key.kind != TaskKind::Generic => {
                    // owned by the calendar layer
                    warn!(
                        database = %self.database,
                        task = %task.key,
                        "next_task returned a calendar task while the calendar layer is on, not dispatched"
                    );
                    self.arm(self.settings.check_period);
                }
                Ok(task) if self.active.contains_key(&task.key) => {
                    warn!(database = %self.database, task = %task.key, "due task is still running, retrying later");
                    self.arm(self.settings.retry_interval);
                }
                Ok(task) => {
                    self.dispatch(task);
                    // More tasks may be due at the same time.
                    self.arm(Duration::ZERO);
                }
                Err(e) => self.store_error(e),
            },
            Err(e) => self.store_error(e),
        }
    }

    async fn poll_store(&mut self) -> Result<Option<NextTaskRow>> {
        let mut conn = self.take_conn().await?;
        let row = conn.next_task().await;
        if row.is_ok() {
            self.conn = Some(conn);
        } else {
            debug!(database = %self.database, "dropping polling connection");
        }
        row
    }

    /// The polling handle, reconnecting when it was dropped after an error.
    async fn take_conn(&mut self) -> Result<C::Conn> {
        match self.conn.take() {
            Some(conn) => Ok(conn),
            None => {
                let conn = self.connector.connect(&self.database).await?;
                debug!(database = %self.database, "polling connection opened");
                Ok(conn)
            }
        }
    }

    fn store_error(&mut self, error: SchedulerError) {
        self.stats.store_errors += 1;
        warn!(
            database = %self.database,
            error = %error,
            retry_secs = self.settings.retry_interval.as_secs_f64(),
            "store error, retrying"
        );
        self.arm(self.settings.retry_interval);
    }

    /// Arm the next-check slot from inside the poll cycle.
    ///
    /// The slot is always empty here since only its own expiry starts a poll;
    /// finding it armed means two wake-ups were in flight.
    fn arm(&mut self, delay: Duration) {
        if self.next_check.arm(delay) {
            warn!(database = %self.database, "BUG: next-check timer was already armed, replaced");
        }
    }

    fn dispatch(&mut self, task: Task) {
        let key = task.key;
        self.active.insert(key, Instant::now());
        self.stats.dispatched += 1;
        info!(
            database = %self.database,
            task = %key,
            job = %task.job,
            role = %task.role,
            active = self.active.len(),
            "dispatching task"
        );

        let connector = Arc::clone(&self.connector);
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let report = task.run(&*connector).await;
            // The receiver only goes away with the dispatcher itself.
            let _ = done.send(report);
        });
    }

    async fn task_finished(&mut self, report: TaskReport) {
        let key = report.task.key;
        let Some(started) = self.active.remove(&key) else {
            warn!(database = %self.database, task = %key, "completion for a task that is not active");
            return;
        };
        match report.outcome {
            Outcome::Succeeded(_) => self.stats.succeeded += 1,
            Outcome::Failed(_) => self.stats.failed += 1,
            Outcome::Error(_) => self.stats.errored += 1,
        }
        debug!(
            database = %self.database,
            task = %key,
            active = self.active.len(),
            run_ms = report.elapsed.as_millis() as u64,
            held_ms = started.elapsed().as_millis() as u64,
            "task removed from active set"
        );

        let needs_delete = self
            .calendar
            .as_mut()
            .is_some_and(|layer| layer.book.complete(&key));
        if needs_delete {
            self.delete_retired().await;
        }
    }

    fn notified(&mut self, note: Notification) {
        self.stats.notifications += 1;
        let cancelled = self.next_check.arm(Duration::ZERO);
        info!(
            database = %self.database,
            channel = %note.channel,
            payload = %note.payload,
            resync = note.resync,
            cancelled_wait = cancelled,
            "change notification"
        );
        if let Some(layer) = self.calendar.as_mut() {
            layer.refresh_due = true;
            layer.timer.arm(Duration::ZERO);
        }
    }

    // -----------------------------------------------------------------------
    // Calendar layer
    // -----------------------------------------------------------------------

    async fn service_calendar(&mut self) {
        let Some(layer) = self.calendar.as_ref() else {
            return;
        };
        if layer.refresh_due || Instant::now() >= layer.next_refresh {
            self.refresh_calendar().await;
        }

        let now = (self.clock)();
        if let Some(layer) = self.calendar.as_mut() {
            let fired = layer.book.collect_due(now);
            if fired > 0 {
                self.stats.calendar_fires += fired as u64;
                debug!(database = %self.database, fired, queued = layer.book.queued(), "calendar events fired");
            }
        }
        self.dispatch_fired();
        self.arm_calendar();
    }

    async fn refresh_calendar(&mut self) {
        let loaded = match self.load_calendar().await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(database = %self.database, error = %e, "calendar refresh failed, retrying");
                let retry = self.settings.retry_interval;
                if let Some(layer) = self.calendar.as_mut() {
                    layer.refresh_due = false;
                    layer.next_refresh = Instant::now() + retry;
                }
                return;
            }
        };

        let now = (self.clock)();
        if let Some(layer) = self.calendar.as_mut() {
            for (kind, rows) in loaded {
                let summary = layer.book.refresh(kind, rows, now);
                if summary.changed() {
                    info!(
                        database = %self.database,
                        kind = %kind,
                        added = summary.added,
                        updated = summary.updated,
                        removed = summary.removed,
                        expired = summary.expired,
                        "calendar refreshed"
                    );
                }
            }
            layer.refresh_due = false;
            layer.next_refresh = Instant::now() + layer.refresh_every;
        }
        self.delete_retired().await;
    }

    async fn load_calendar(&mut self) -> Result<Vec<(TaskKind, Vec<CalendarRow>)>> {
        let mut conn = self.take_conn().await?;
        let mut loaded = Vec::with_capacity(TaskKind::CALENDAR.len());
        for kind in TaskKind::CALENDAR {
            // On error the handle is dropped and reopened on next use.
            loaded.push((kind, conn.load_calendar(kind).await?));
        }
        self.conn = Some(conn);
        Ok(loaded)
    }

    /// Delete the rows of AT tasks whose one-shot run completed. Failures are
    /// retried after the next refresh.
    async fn delete_retired(&mut self) {
        let pending = match self.calendar.as_ref() {
            Some(layer) => layer.book.pending_deletions(),
            None => return,
        };
        if pending.is_empty() {
            return;
        }
        let mut conn = match self.take_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(database = %self.database, error = %e, "cannot delete fired AT tasks");
                return;
            }
        };
        for key in pending {
            if let Err(e) = conn.delete_at(key.id).await {
                warn!(database = %self.database, task = %key, error = %e, "cannot delete fired AT task");
                return;
            }
            info!(database = %self.database, task = %key, "fired AT task deleted");
            if let Some(layer) = self.calendar.as_mut() {
                layer.book.confirm_deleted(&key);
            }
        }
        self.conn = Some(conn);
    }

    /// Dispatch queued occurrences within the shared ceiling.
    fn dispatch_fired(&mut self) {
        let room = self.settings.ceiling().saturating_sub(self.active.len());
        let Some(layer) = self.calendar.as_mut() else {
            return;
        };
        if !layer.book.fire_pending() {
            return;
        }
        let active = &self.active;
        let batch = layer.book.take_dispatchable(room, |key| active.contains_key(key));
        let held = layer.book.queued();
        if held > 0 {
            debug!(database = %self.database, held, "fired occurrences waiting for a connection");
        }
        for occurrence in batch {
            let task = Task::from_occurrence(&self.database, &occurrence);
            self.dispatch(task);
        }
    }

    fn arm_calendar(&mut self) {
        let retry = self.settings.retry_interval;
        let now = (self.clock)();
        let Some(layer) = self.calendar.as_mut() else {
            return;
        };
        let mut delay = layer.next_refresh.saturating_duration_since(Instant::now());
        if layer.book.fire_pending() {
            delay = delay.min(retry);
        }
        if let Some(due) = layer.book.next_due() {
            let until = (due - now).to_std().unwrap_or(Duration::ZERO);
            delay = delay.min(until);
        }
        layer.timer.arm(delay);
    }

    async fn stop(mut self) -> DispatcherStats {
        self.next_check.cancel();
        if let Some(layer) = self.calendar.as_mut() {
            layer.timer.cancel();
        }
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                debug!(database = %self.database, error = %e, "error closing polling connection");
            }
        }
        info!(
            database = %self.database,
            still_running = self.active.len(),
            dispatched = self.stats.dispatched,
            "dispatcher stopped"
        );
        self.stats
    }
}

async fn calendar_wake(layer: &mut Option<CalendarLayer>) {
    match layer {
        Some(layer) => layer.timer.fired().await,
        None => pending::<()>().await,
    }
}

async fn next_notification(rx: &mut Option<mpsc::Receiver<Notification>>) -> Option<Notification> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

/// Spawn every dispatcher; each task yields its database name and final
/// counters.
pub fn launch<C: Connector>(
    dispatchers: Vec<Dispatcher<C>>,
    shutdown: &watch::Receiver<bool>,
) -> JoinSet<(String, DispatcherStats)> {
    let mut set = JoinSet::new();
    for dispatcher in dispatchers {
        let name = dispatcher.database().to_string();
        let rx = shutdown.clone();
        set.spawn(async move {
            let stats = dispatcher.run(rx).await;
            (name, stats)
        });
    }
    set
}
