//! Schema versioning for the quota governor's SQLite store.
//!
//! `init_sqlite_schema` creates the `quota_meta` bookkeeping table and the
//! base v1 schema in one shot for a fresh database. `run_migrations` then
//! brings an existing database up to the latest schema version, applying
//! each pending migration's SQL and any `ADD COLUMN` statements in order.
//! Every migration is idempotent (`CREATE TABLE IF NOT EXISTS`, guarded
//! `ADD COLUMN`), so re-running `run_migrations` on an up-to-date database
//! is a no-op.

mod v1_0_0;

use crate::{CoreError, Result};
use rusqlite::Connection;

/// One schema migration: a version number, human description, the SQL to
/// run, and a list of `(table, column, type)` additions applied via
/// `ALTER TABLE ... ADD COLUMN` (skipped if the column already exists).
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub add_columns: &'static [(&'static str, &'static str, &'static str)],
}

fn all_migrations() -> Vec<Migration> {
    vec![v1_0_0::migration()]
}

/// Create the bookkeeping table and apply the full migration sequence to a
/// fresh (or existing) connection.
pub fn init_sqlite_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS quota_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        INSERT OR IGNORE INTO quota_meta (key, value) VALUES ('schema_version', '0');",
    )?;
    run_migrations(conn)?;
    Ok(())
}

/// Apply every migration whose version is greater than the database's
/// current recorded version. Returns the number of migrations applied.
pub fn run_migrations(conn: &Connection) -> Result<usize> {
    let current = schema_version(conn)?;
    let mut applied = 0;

    for migration in all_migrations() {
        if migration.version <= current {
            continue;
        }

        conn.execute_batch(migration.sql)?;

        for (table, column, column_type) in migration.add_columns {
            if !column_exists(conn, table, column)? {
                conn.execute(
                    &format!("ALTER TABLE {table} ADD COLUMN {column} {column_type}"),
                    [],
                )?;
            }
        }

        conn.execute(
            "UPDATE quota_meta SET value = ?1 WHERE key = 'schema_version'",
            [migration.version.to_string()],
        )?;

        tracing::info!(version = migration.version, description = migration.description, "applied schema migration");
        applied += 1;
    }

    Ok(applied)
}

fn schema_version(conn: &Connection) -> Result<i64> {
    let version: String = conn.query_row(
        "SELECT value FROM quota_meta WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    version
        .parse()
        .map_err(|e| CoreError::InvalidInput(format!("invalid schema_version value: {e}")))
}

/// Whether `column` exists on `table`, via `PRAGMA table_info`.
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_lands_on_latest_version() {
        let conn = Connection::open_in_memory().unwrap();
        init_sqlite_schema(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), v1_0_0::VERSION);
    }

    #[test]
    fn running_migrations_twice_applies_nothing_the_second_time() {
        let conn = Connection::open_in_memory().unwrap();
        init_sqlite_schema(&conn).unwrap();
        let applied = run_migrations(&conn).unwrap();
        assert_eq!(applied, 0);
    }

    #[test]
    fn base_tables_exist_after_init() {
        let conn = Connection::open_in_memory().unwrap();
        init_sqlite_schema(&conn).unwrap();
        for table in [
            "tenants",
            "limit_configs",
            "windows",
            "queue_entries",
            "events",
            "patterns",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "expected table {table} to exist");
        }
    }
}
