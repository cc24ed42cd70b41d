use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{PgschedError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/pgsched/pgsched.toml";
pub const DEFAULT_SCHEMA: &str = "pgsched";
pub const DEFAULT_NOTIFY_CHANNEL: &str = "pgs_tasks_change";
pub const DEFAULT_PID_FILE: &str = "/var/run/pgsched.pid";
pub const DEFAULT_MAX_CONN: u32 = 5;
pub const DEFAULT_CHECK_PERIOD_SECS: f64 = 30.0;
pub const DEFAULT_RETRY_SECS: f64 = 1.0;
pub const DEFAULT_SEEK_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CALENDAR_REFRESH_SECS: u64 = 60;
/// Upper bound for `check_period_secs` and `retry_secs`.
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Top-level config (pgsched.toml + PGSCHED_* env overrides).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PgschedConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Where the scheduling schema lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL. The database part is replaced per tenant.
    #[serde(default = "default_url")]
    pub url: String,
    /// Database the seeker connects to for discovery. Never scheduled itself.
    #[serde(default = "default_bootstrap")]
    pub bootstrap: String,
    /// Single-tenant mode: schedule only this database and skip discovery.
    #[serde(default)]
    pub target: Option<String>,
    /// Additional databases the seeker must ignore.
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_schema")]
    pub schema: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            bootstrap: default_bootstrap(),
            target: None,
            exclude: Vec::new(),
            schema: default_schema(),
        }
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Connection budget per database: one polling handle plus
    /// `max_conn - 1` running tasks.
    #[serde(default = "default_max_conn")]
    pub max_conn: u32,
    /// Fallback polling interval, also the cap on any store-reported wait.
    #[serde(default = "default_check_period")]
    pub check_period_secs: f64,
    /// Retry interval after a store error or when the ceiling is reached.
    #[serde(default = "default_retry")]
    pub retry_secs: f64,
    #[serde(default = "default_notify_channel")]
    pub notify_channel: String,
    /// Upper bound on the whole database discovery phase.
    #[serde(default = "default_seek_timeout")]
    pub seek_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_conn: DEFAULT_MAX_CONN,
            check_period_secs: DEFAULT_CHECK_PERIOD_SECS,
            retry_secs: DEFAULT_RETRY_SECS,
            notify_channel: default_notify_channel(),
            seek_timeout_secs: DEFAULT_SEEK_TIMEOUT_SECS,
        }
    }
}

impl SchedulerConfig {
    /// Falls back to the default for a value `validate` would reject.
    pub fn check_period(&self) -> Duration {
        Duration::try_from_secs_f64(self.check_period_secs)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_CHECK_PERIOD_SECS))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_secs)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_RETRY_SECS))
    }

    pub fn seek_timeout(&self) -> Duration {
        Duration::from_secs(self.seek_timeout_secs)
    }
}

/// Local calendar layer for CRON / AT / RUNNER tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_refresh")]
    pub refresh_secs: u64,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            refresh_secs: DEFAULT_CALENDAR_REFRESH_SECS,
        }
    }
}

impl CalendarConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
    /// Default tracing filter; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_filter: default_log_filter(),
        }
    }
}

fn default_url() -> String {
    "postgres://localhost".to_string()
}
fn default_bootstrap() -> String {
    "postgres".to_string()
}
fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}
fn default_max_conn() -> u32 {
    DEFAULT_MAX_CONN
}
fn default_check_period() -> f64 {
    DEFAULT_CHECK_PERIOD_SECS
}
fn default_retry() -> f64 {
    DEFAULT_RETRY_SECS
}
fn default_notify_channel() -> String {
    DEFAULT_NOTIFY_CHANNEL.to_string()
}
fn default_seek_timeout() -> u64 {
    DEFAULT_SEEK_TIMEOUT_SECS
}
fn default_refresh() -> u64 {
    DEFAULT_CALENDAR_REFRESH_SECS
}
fn default_pid_file() -> String {
    DEFAULT_PID_FILE.to_string()
}
fn default_log_filter() -> String {
    "pgsched=info".to_string()
}

/// Commented configuration written by `pgsched -C FILE`.
pub const EXAMPLE_CONFIG: &str = r#"# pgsched configuration
#
# Every key is optional; the values below are the built-in defaults.
# Any key can be overridden from the environment, e.g.
#   PGSCHED_SCHEDULER__MAX_CONN=10

[database]
# Connection parameters. The database name is replaced for each tenant.
url = "postgres://localhost"
# Database used to list candidate tenants.
bootstrap = "postgres"
# Uncomment to schedule a single database and skip discovery.
# target = "mydb"
# Databases the seeker should never touch.
exclude = []
schema = "pgsched"

[scheduler]
# One polling connection plus up to max_conn - 1 running tasks per database.
max_conn = 5
check_period_secs = 30.0
retry_secs = 1.0
notify_channel = "pgs_tasks_change"
seek_timeout_secs = 30

[calendar]
# Materialise cron / at / runner tasks locally and fire them from a calendar.
enabled = false
refresh_secs = 60

[daemon]
pid_file = "/var/run/pgsched.pid"
log_filter = "pgsched=info"
"#;

impl PgschedConfig {
    /// Load config from a TOML file with PGSCHED_* env var overrides.
    ///
    /// An explicitly requested file must exist. The default path is optional:
    /// when it is absent the built-in defaults apply.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(PgschedError::Config(format!(
                    "config file not found: {path}"
                )));
            }
        }
        let path = config_path.unwrap_or(DEFAULT_CONFIG_PATH);
        if !Path::new(path).exists() {
            tracing::debug!(path, "no config file, using defaults and environment");
        }

        let config: PgschedConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PGSCHED_").split("__"))
            .extract()
            .map_err(|e| PgschedError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the dispatcher cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_conn < 2 {
            return Err(PgschedError::InvalidSetting {
                key: "scheduler.max_conn",
                reason: format!(
                    "must be at least 2 (one polling connection plus one task), got {}",
                    self.scheduler.max_conn
                ),
            });
        }
        interval("scheduler.check_period_secs", self.scheduler.check_period_secs)?;
        interval("scheduler.retry_secs", self.scheduler.retry_secs)?;
        if self.scheduler.seek_timeout_secs == 0 {
            return Err(positive("scheduler.seek_timeout_secs"));
        }
        if self.calendar.refresh_secs == 0 {
            return Err(positive("calendar.refresh_secs"));
        }
        if self.database.schema.trim().is_empty() {
            return Err(PgschedError::InvalidSetting {
                key: "database.schema",
                reason: "must not be empty".to_string(),
            });
        }
        if self.scheduler.notify_channel.trim().is_empty() {
            return Err(PgschedError::InvalidSetting {
                key: "scheduler.notify_channel",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Seconds that must form a positive, finite interval no longer than a day.
fn interval(key: &'static str, secs: f64) -> Result<Duration> {
    if !(secs > 0.0) {
        return Err(positive(key));
    }
    match Duration::try_from_secs_f64(secs) {
        Ok(d) if d <= MAX_INTERVAL => Ok(d),
        _ => Err(PgschedError::InvalidSetting {
            key,
            reason: format!(
                "must be at most {} seconds, got {secs}",
                MAX_INTERVAL.as_secs()
            ),
        }),
    }
}

fn positive(key: &'static str) -> PgschedError {
    PgschedError::InvalidSetting {
        key,
        reason: "must be greater than zero".to_string(),
    }
}
