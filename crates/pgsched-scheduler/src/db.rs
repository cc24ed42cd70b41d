//! SQL text for the scheduling schema.
//!
//! The schema name comes from configuration, so statements are built per
//! connection with the name quoted as an identifier.

use crate::types::{TaskKey, TaskKind};

/// Quote `name` as a Postgres identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `next_task()` with every column cast to the type the decoder expects.
///
/// Column order: wait, kind, id, job, role, scheduled_time, retroactive.
pub fn next_task_sql(schema: &str) -> String {
    format!(
        "SELECT t.wait::float8, t.kind::text, t.id::int8, t.job::text, t.role::text,
                t.scheduled_time::timestamptz, t.retroactive::bool
         FROM {}.next_task() AS t(wait, kind, id, job, role, scheduled_time, retroactive)",
        quote_ident(schema)
    )
}

/// `run_task(kind, id)` with literal arguments so the server resolves the
/// function's own parameter types.
///
/// Both values are safe to inline: the kind comes from a closed enum and the
/// id is an integer.
pub fn run_task_sql(schema: &str, key: TaskKey) -> String {
    format!(
        "SELECT ({}.run_task('{}', {}))::int8",
        quote_ident(schema),
        key.kind.as_str(),
        key.id
    )
}

pub const SCHEMA_CHECK_SQL: &str =
    "SELECT count(nspname)::int8 FROM pg_namespace WHERE nspname = $1";

pub const LIST_DATABASES_SQL: &str = "SELECT datname::text FROM pg_database
     WHERE datallowconn AND datname NOT LIKE 'template%' AND datname <> ALL($1)
     ORDER BY datname";

/// Load every definition of a calendar kind as uniform rows.
///
/// Columns: id, job, role, schedule, scheduled_time, interval_secs, retroactive.
/// Returns `None` for [`TaskKind::Generic`], which has no table.
pub fn load_calendar_sql(schema: &str, kind: TaskKind) -> Option<String> {
    let schema = quote_ident(schema);
    let sql = match kind {
        TaskKind::Cron => format!(
            "SELECT id::int8, job::text, role::text, schedule::text,
                    scheduled_time::timestamptz, NULL::float8, retroactive::bool
             FROM {schema}.cron ORDER BY id"
        ),
        TaskKind::At => format!(
            "SELECT id::int8, job::text, role::text, NULL::text,
                    scheduled_time::timestamptz, NULL::float8, retroactive::bool
             FROM {schema}.at ORDER BY id"
        ),
        TaskKind::Runner => format!(
            "SELECT id::int8, job::text, role::text, NULL::text,
                    scheduled_time::timestamptz, interval_secs::float8, retroactive::bool
             FROM {schema}.runner ORDER BY id"
        ),
        TaskKind::Generic => return None,
    };
    Some(sql)
}

pub fn delete_at_sql(schema: &str) -> String {
    format!("DELETE FROM {}.at WHERE id = $1", quote_ident(schema))
}
