//! `pgsched-core`: configuration and process-level errors shared by the
//! scheduler library and the `pgsched` daemon.

pub mod config;
pub mod error;

pub use config::PgschedConfig;
pub use error::{PgschedError, Result};
