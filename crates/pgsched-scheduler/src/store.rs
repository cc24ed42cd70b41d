use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::Result,
    types::{CalendarRow, NextTaskRow, Notification, TaskKey, TaskKind},
};

/// Opens handles to the databases of one server.
///
/// Each handle is exclusive to its holder: a dispatcher keeps one for polling
/// and every running task gets its own.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: StoreConnection;

    /// Open a new handle to `database`.
    async fn connect(&self, database: &str) -> Result<Self::Conn>;

    /// Subscribe to `channel` on `database`.
    ///
    /// The returned receiver yields one [`Notification`] per event for as long
    /// as the receiver is held. Dropping it ends the subscription.
    async fn subscribe(
        &self,
        database: &str,
        channel: &str,
    ) -> Result<mpsc::Receiver<Notification>>;
}

/// A single open database handle.
#[async_trait]
pub trait StoreConnection: Send + Sized + 'static {
    /// Ask the schema for the next due task. `None` when no row came back.
    async fn next_task(&mut self) -> Result<Option<NextTaskRow>>;

    /// Execute a task through `run_task(kind, id)` and return its result code.
    ///
    /// An `Err` is a transport failure; a negative `Ok` is the task's own
    /// failure code.
    async fn run_task(&mut self, key: TaskKey) -> Result<i64>;

    /// Whether the scheduling schema exists in this database.
    async fn has_schema(&mut self) -> Result<bool>;

    /// Names of connectable, non-template databases not listed in `exclude`.
    async fn list_databases(&mut self, exclude: &[String]) -> Result<Vec<String>>;

    /// Every definition of a calendar kind.
    async fn load_calendar(&mut self, kind: TaskKind) -> Result<Vec<CalendarRow>>;

    /// Delete the persisted AT definition `id`.
    async fn delete_at(&mut self, id: i64) -> Result<()>;

    /// Release the handle.
    async fn close(self) -> Result<()>;
}
