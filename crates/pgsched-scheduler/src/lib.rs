//! `pgsched-scheduler`: database-resident task dispatch.
//!
//! # Overview
//!
//! Tasks live as rows in a Postgres schema. A [`dispatcher::Dispatcher`]
//! repeatedly asks the store for the next due task, runs it through the
//! schema's `run_task` procedure on a dedicated connection, and sleeps until
//! the next task is due. A `LISTEN` subscription on the change channel cuts
//! that sleep short whenever the task table changes.
//!
//! In multi-tenant deployments the [`seeker::DatabaseSeeker`] discovers every
//! database hosting the schema and starts one dispatcher per database.
//!
//! # Calendar layer
//!
//! Optionally, CRON / AT / RUNNER definitions are loaded into a local
//! [`calendar::EventCalendar`] and fired from there:
//!
//! | Kind     | Behaviour                                               |
//! |----------|---------------------------------------------------------|
//! | `At`     | One shot at an absolute instant, row deleted afterwards |
//! | `Cron`   | Cron expression, evaluated in UTC                       |
//! | `Runner` | Repeat every N seconds from its scheduled time          |

pub mod book;
pub mod calendar;
pub mod calendar_task;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod postgres;
pub mod schedule;
pub mod seeker;
pub mod store;
pub mod task;
pub mod timer;
pub mod types;

pub use book::{CalendarBook, FiredOccurrence, RefreshSummary};
pub use dispatcher::{launch, Dispatcher, DispatcherSettings, DispatcherStats};
pub use error::{Result, SchedulerError};
pub use postgres::PgConnector;
pub use seeker::{DatabaseSeeker, Registration};
pub use store::{Connector, StoreConnection};
pub use task::{Outcome, Task, TaskReport};
pub use types::{CalendarRow, NextTaskRow, Notification, TaskKey, TaskKind, TaskState};
