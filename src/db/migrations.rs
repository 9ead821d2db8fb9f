use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use super::schema;

const SCHEMA_VERSION: i32 = 1;

/// Brings the database up to the current schema version. Safe to call on
/// every open; already-migrated databases are left untouched.
pub fn migrate(conn: &Connection) -> Result<()> {
    schema::create_schema(conn)?;

    let current = current_version(conn)?;
    if current < SCHEMA_VERSION {
        info!(from = current, to = SCHEMA_VERSION, "migrating database schema");
        set_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

fn current_version(conn: &Connection) -> Result<i32> {
    let version: Option<Option<String>> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    Ok(version
        .flatten()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

fn set_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
        [version.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("first migration");
        migrate(&conn).expect("second migration");

        let version = current_version(&conn).expect("read version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn migrate_creates_all_tables() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migration");

        for table in ["tenants", "message_traces", "pull_history", "meta"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .expect("query sqlite_master");
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
