use thiserror::Error;

#[derive(Debug, Error)]
pub enum PgschedError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("pgsched is already running (pid {pid}, see {path})")]
    AlreadyRunning { pid: u32, path: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PgschedError {
    /// Short error code used in startup log lines.
    pub fn code(&self) -> &'static str {
        match self {
            PgschedError::Config(_) => "CONFIG_ERROR",
            PgschedError::InvalidSetting { .. } => "INVALID_SETTING",
            PgschedError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            PgschedError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, PgschedError>;
