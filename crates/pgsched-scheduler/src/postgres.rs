//! Postgres implementation of the store ports, built on sqlx.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use sqlx::{
    postgres::{PgConnectOptions, PgListener, PgPool, PgPoolOptions, PgRow},
    Connection, PgConnection, Row,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    db,
    error::{Result, SchedulerError},
    store::{Connector, StoreConnection},
    types::{CalendarRow, NextTaskRow, Notification, TaskKey, TaskKind},
};

const APPLICATION_NAME: &str = "pgsched";
/// Notifications buffered between the listener task and its dispatcher.
const NOTIFY_BUFFER: usize = 64;

/// Opens sqlx connections to any database reachable with one set of
/// connection parameters.
#[derive(Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
    schema: Arc<str>,
    /// Pause before the listener retries after losing its connection.
    listen_retry: Duration,
}

impl fmt::Debug for PgConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnector")
            .field("host", &self.options.get_host())
            .field("port", &self.options.get_port())
            .field("schema", &self.schema)
            .finish()
    }
}

impl PgConnector {
    /// Parse `url` once; the database part is replaced on every connect.
    pub fn new(url: &str, schema: &str, listen_retry: Duration) -> Result<Self> {
        let options = PgConnectOptions::from_str(url)?.application_name(APPLICATION_NAME);
        Ok(Self {
            options,
            schema: Arc::from(schema),
            listen_retry,
        })
    }

    fn options_for(&self, database: &str) -> PgConnectOptions {
        self.options.clone().database(database)
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Conn = PgStoreConnection;

    async fn connect(&self, database: &str) -> Result<PgStoreConnection> {
        let conn = PgConnection::connect_with(&self.options_for(database)).await?;
        debug!(database = %database, "connection opened");
        Ok(PgStoreConnection {
            conn,
            next_task_sql: db::next_task_sql(&self.schema),
            schema: Arc::clone(&self.schema),
        })
    }

    async fn subscribe(
        &self,
        database: &str,
        channel: &str,
    ) -> Result<mpsc::Receiver<Notification>> {
        // PgListener needs a pool; a lazy single-connection pool keeps the
        // listener on its own dedicated handle.
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy_with(self.options_for(database));
        let listener = listen_on(&pool, channel).await?;
        info!(database = %database, channel = %channel, "listening for task changes");

        let (tx, rx) = mpsc::channel(NOTIFY_BUFFER);
        let feed = PgChangeFeed {
            listener: Some(listener),
            pool,
            channel: channel.to_string(),
        };
        tokio::spawn(forward_notifications(
            feed,
            tx,
            database.to_string(),
            self.listen_retry,
        ));
        Ok(rx)
    }
}

async fn listen_on(pool: &PgPool, channel: &str) -> Result<PgListener> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(channel).await?;
    Ok(listener)
}

/// Source of change notifications that can lose its connection.
#[async_trait]
trait ChangeFeed: Send {
    /// Next notification, or `Ok(None)` when the connection dropped.
    async fn next(&mut self) -> Result<Option<Notification>>;

    /// Open a fresh connection and listen again.
    async fn reconnect(&mut self) -> Result<()>;
}

struct PgChangeFeed {
    /// `None` between dropping a broken listener and reconnecting.
    listener: Option<PgListener>,
    pool: PgPool,
    channel: String,
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn next(&mut self) -> Result<Option<Notification>> {
        let Some(listener) = self.listener.as_mut() else {
            return Ok(None);
        };
        // `recv` would reconnect silently; `try_recv` reports the drop.
        let received = listener.try_recv().await?;
        Ok(received.map(|n| Notification {
            channel: n.channel().to_string(),
            payload: n.payload().to_string(),
            resync: false,
        }))
    }

    async fn reconnect(&mut self) -> Result<()> {
        // The pool holds a single connection: release it first.
        self.listener = None;
        self.listener = Some(listen_on(&self.pool, &self.channel).await?);
        Ok(())
    }
}

/// Pump notifications from `feed` into `tx` until the receiver goes away.
///
/// After a lost connection the feed is re-established, retrying every
/// `retry`, and a resync wake-up is sent: anything published while
/// disconnected is gone.
async fn forward_notifications<F: ChangeFeed>(
    mut feed: F,
    tx: mpsc::Sender<Notification>,
    database: String,
    retry: Duration,
) {
    loop {
        let note = match feed.next().await {
            Ok(Some(note)) => note,
            Ok(None) => {
                warn!(database = %database, "listener connection lost, reconnecting");
                if !relisten(&mut feed, &tx, &database, retry).await {
                    break;
                }
                Notification::resync()
            }
            Err(e) => {
                warn!(database = %database, error = %e, "listener failed, reconnecting");
                tokio::time::sleep(retry).await;
                if !relisten(&mut feed, &tx, &database, retry).await {
                    break;
                }
                Notification::resync()
            }
        };
        if tx.send(note).await.is_err() {
            debug!(database = %database, "notification receiver dropped, listener stopping");
            break;
        }
    }
}

/// Reconnect `feed`, retrying until it works. `false` when the receiver went
/// away in the meantime.
async fn relisten<F: ChangeFeed>(
    feed: &mut F,
    tx: &mpsc::Sender<Notification>,
    database: &str,
    retry: Duration,
) -> bool {
    loop {
        if tx.is_closed() {
            return false;
        }
        match feed.reconnect().await {
            Ok(()) => {
                info!(database = %database, "listener reconnected");
                return true;
            }
            Err(e) => {
                warn!(database = %database, error = %e, "listener reconnect failed");
                tokio::time::sleep(retry).await;
            }
        }
    }
}

/// One open Postgres connection bound to the scheduling schema.
pub struct PgStoreConnection {
    conn: PgConnection,
    schema: Arc<str>,
    next_task_sql: String,
}

impl fmt::Debug for PgStoreConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgStoreConnection")
            .field("schema", &self.schema)
            .finish()
    }
}

#[async_trait]
impl StoreConnection for PgStoreConnection {
    async fn next_task(&mut self) -> Result<Option<NextTaskRow>> {
        let row = sqlx::query(&self.next_task_sql)
            .fetch_optional(&mut self.conn)
            .await?;
        row.map(|r| decode_next_task(&r)).transpose()
    }

    async fn run_task(&mut self, key: TaskKey) -> Result<i64> {
        let code: Option<i64> = sqlx::query_scalar(&db::run_task_sql(&self.schema, key))
            .fetch_one(&mut self.conn)
            .await?;
        // A NULL result carries no failure code; treat it as success.
        Ok(code.unwrap_or(0))
    }

    async fn has_schema(&mut self) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(db::SCHEMA_CHECK_SQL)
            .bind(&*self.schema)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(count == 1)
    }

    async fn list_databases(&mut self, exclude: &[String]) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(db::LIST_DATABASES_SQL)
            .bind(exclude.to_vec())
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| SchedulerError::Discovery(e.to_string()))?;
        Ok(names)
    }

    async fn load_calendar(&mut self, kind: TaskKind) -> Result<Vec<CalendarRow>> {
        let Some(sql) = db::load_calendar_sql(&self.schema, kind) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(&sql).fetch_all(&mut self.conn).await?;
        rows.iter().map(|r| decode_calendar_row(kind, r)).collect()
    }

    async fn delete_at(&mut self, id: i64) -> Result<()> {
        sqlx::query(&db::delete_at_sql(&self.schema))
            .bind(id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn close(self) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

fn decode_next_task(row: &PgRow) -> Result<NextTaskRow> {
    Ok(NextTaskRow {
        wait: row.try_get(0)?,
        kind: row.try_get(1)?,
        id: row.try_get(2)?,
        job: row.try_get(3)?,
        role: row.try_get(4)?,
        scheduled_time: row.try_get(5)?,
        retroactive: row.try_get(6)?,
    })
}

fn decode_calendar_row(kind: TaskKind, row: &PgRow) -> Result<CalendarRow> {
    Ok(CalendarRow {
        kind,
        id: row.try_get(0)?,
        job: row.try_get::<Option<String>, _>(1)?.unwrap_or_default(),
        role: row.try_get::<Option<String>, _>(2)?.unwrap_or_default(),
        schedule: row.try_get(3)?,
        scheduled_time: row.try_get(4)?,
        interval_secs: row.try_get(5)?,
        retroactive: row.try_get::<Option<bool>, _>(6)?.unwrap_or(false),
    })
}
