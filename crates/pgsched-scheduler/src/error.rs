use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying sqlx / Postgres error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store could not be reached or dropped the connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The store reported a task kind this scheduler does not know.
    #[error("Unknown task kind: {0}")]
    UnknownKind(String),

    /// A calendar task definition cannot be scheduled.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// `EventCalendar::remove` was called with neither a task nor a kind.
    #[error("Calendar removal needs a task or a kind filter")]
    MissingFilter,

    /// Listing candidate databases failed during discovery.
    #[error("Database discovery failed: {0}")]
    Discovery(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
