//! Multi-tenant discovery: find every database hosting the scheduling schema
//! and build one [`Dispatcher`] per database.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::{
    task::JoinSet,
    time::{timeout_at, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    dispatcher::{Dispatcher, DispatcherSettings},
    error::{Result, SchedulerError},
    store::{Connector, StoreConnection},
};

/// Where a candidate database stands during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// Schema check in flight.
    Pending,
    /// Schema present; a dispatcher was built.
    Active,
    /// Excluded, with the reason.
    Failed(String),
}

impl std::fmt::Display for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Registration::Pending => f.write_str("pending"),
            Registration::Active => f.write_str("active"),
            Registration::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

pub struct DatabaseSeeker<C: Connector> {
    connector: Arc<C>,
    bootstrap: String,
    exclude: Vec<String>,
    timeout: Duration,
    settings: DispatcherSettings,
    registrations: BTreeMap<String, Registration>,
}

impl<C: Connector> DatabaseSeeker<C> {
    pub fn new(
        connector: Arc<C>,
        bootstrap: impl Into<String>,
        exclude: Vec<String>,
        timeout: Duration,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            connector,
            bootstrap: bootstrap.into(),
            exclude,
            timeout,
            settings,
            registrations: BTreeMap::new(),
        }
    }

    /// Outcome of the last discovery, by database name.
    pub fn registrations(&self) -> &BTreeMap<String, Registration> {
        &self.registrations
    }

    /// List candidates through the bootstrap database, check each one for the
    /// schema concurrently, and return a dispatcher per database that has it.
    ///
    /// The whole phase is bounded by the seek timeout: checks still pending
    /// when it elapses are aborted and their handles dropped. Only a failure
    /// to list candidates is returned as an error.
    pub async fn discover(&mut self) -> Result<Vec<Dispatcher<C>>> {
        let deadline = Instant::now() + self.timeout;
        self.registrations.clear();

        let candidates = self.list_candidates(deadline).await?;
        info!(bootstrap = %self.bootstrap, candidates = candidates.len(), "candidate databases listed");

        let mut checks = JoinSet::new();
        for name in candidates {
            self.registrations.insert(name.clone(), Registration::Pending);
            let connector = Arc::clone(&self.connector);
            checks.spawn(async move {
                let checked = check_database(&*connector, &name).await;
                (name, checked)
            });
        }

        let mut dispatchers = Vec::new();
        loop {
            match timeout_at(deadline, checks.join_next()).await {
                Ok(Some(Ok((name, Ok(conn))))) => {
                    info!(database = %name, "scheduling schema found, starting dispatcher");
                    self.registrations.insert(name.clone(), Registration::Active);
                    dispatchers.push(Dispatcher::new(
                        name,
                        Arc::clone(&self.connector),
                        Some(conn),
                        self.settings.clone(),
                    ));
                }
                Ok(Some(Ok((name, Err(e))))) => {
                    debug!(database = %name, reason = %e, "database skipped");
                    self.registrations.insert(name, Registration::Failed(e.to_string()));
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "schema check aborted");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        abandoned = checks.len(),
                        timeout_secs = self.timeout.as_secs(),
                        "database discovery timed out"
                    );
                    checks.shutdown().await;
                    break;
                }
            }
        }

        for registration in self.registrations.values_mut() {
            if *registration == Registration::Pending {
                *registration = Registration::Failed("schema check did not complete".to_string());
            }
        }
        info!(active = dispatchers.len(), "database discovery finished");
        Ok(dispatchers)
    }

    async fn list_candidates(&self, deadline: Instant) -> Result<Vec<String>> {
        let mut conn = timeout_at(deadline, self.connector.connect(&self.bootstrap))
            .await
            .map_err(|_| {
                SchedulerError::Discovery(format!("timed out connecting to {}", self.bootstrap))
            })??;

        let mut exclude = self.exclude.clone();
        exclude.push(self.bootstrap.clone());

        let listed = timeout_at(deadline, conn.list_databases(&exclude)).await;
        match listed {
            Ok(Ok(names)) => {
                if let Err(e) = conn.close().await {
                    debug!(bootstrap = %self.bootstrap, error = %e, "error closing bootstrap connection");
                }
                Ok(names)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SchedulerError::Discovery(format!(
                "timed out listing databases on {}",
                self.bootstrap
            ))),
        }
    }

    /// Single-tenant mode: check `database` and build its dispatcher without
    /// listing anything. A missing schema is an error.
    pub async fn promote(&mut self, database: &str) -> Result<Dispatcher<C>> {
        self.registrations.insert(database.to_string(), Registration::Pending);
        let checked = timeout_at(
            Instant::now() + self.timeout,
            check_database(&*self.connector, database),
        )
        .await
        .unwrap_or_else(|_| {
            Err(SchedulerError::Discovery(format!("timed out checking {database}")))
        });

        match checked {
            Ok(conn) => {
                info!(database, "scheduling schema found, starting dispatcher");
                self.registrations.insert(database.to_string(), Registration::Active);
                Ok(Dispatcher::new(
                    database,
                    Arc::clone(&self.connector),
                    Some(conn),
                    self.settings.clone(),
                ))
            }
            Err(e) => {
                self.registrations
                    .insert(database.to_string(), Registration::Failed(e.to_string()));
                Err(e)
            }
        }
    }
}

/// Open a handle to `database` and keep it only if the schema is present.
async fn check_database<C: Connector>(connector: &C, database: &str) -> Result<C::Conn> {
    let mut conn = connector.connect(database).await?;
    let present = conn.has_schema().await;
    match present {
        Ok(true) => Ok(conn),
        Ok(false) => {
            let _ = conn.close().await;
            Err(SchedulerError::Discovery("scheduling schema not present".to_string()))
        }
        Err(e) => {
            let _ = conn.close().await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_display() {
        assert_eq!(Registration::Pending.to_string(), "pending");
        assert_eq!(
            Registration::Failed("no schema".into()).to_string(),
            "failed: no schema"
        );
    }
}
