//! Schema migrations and connection setup.
//!
//! The format version of a file is the set of named migration steps
//! recorded in its `migrations` table. Steps are monotonic: each either
//! runs or is already recorded as applied. A file recording a name this
//! build does not know is from a newer build and must not be touched.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, params};

use crate::core::now_ms;
use crate::store::error::StoreError;

const BUSY_TIMEOUT_MS: u64 = 5_000;

struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// The monotonic migration history. Append-only.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_initial",
        // The original format: tombstones uniquely keyed by
        // (scope, key, deleter, deleting usn).
        sql: "CREATE TABLE entry (
                scope TEXT NOT NULL,
                key TEXT NOT NULL,
                author_id BLOB NOT NULL,
                usn INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                type TEXT NOT NULL,
                text TEXT,
                json TEXT,
                blob_mime TEXT,
                blob BLOB,
                PRIMARY KEY (scope, key, author_id)
              );
              CREATE INDEX entry_by_author ON entry (author_id, usn);
              CREATE TABLE author (
                id BLOB PRIMARY KEY,
                name TEXT NOT NULL,
                usn INTEGER NOT NULL,
                timestamp INTEGER NOT NULL
              );
              CREATE TABLE tombstone (
                scope TEXT NOT NULL,
                key TEXT NOT NULL,
                author_id BLOB NOT NULL,
                usn INTEGER NOT NULL,
                deleting_author_id BLOB NOT NULL,
                deleting_usn INTEGER NOT NULL,
                PRIMARY KEY (scope, key, deleting_author_id, deleting_usn)
              );
              CREATE VIRTUAL TABLE entry_full_text
                USING fts5(text, content='entry', content_rowid='rowid');
              CREATE TABLE application_identifier (
                id TEXT PRIMARY KEY,
                major INTEGER NOT NULL,
                minor INTEGER NOT NULL,
                description TEXT
              );",
    },
    Migration {
        name: "0002_tombstone_rebuild",
        // The unique key forbade two deleters from recording the same
        // prior entry. Rebuild without it; index deleters non-uniquely.
        sql: "ALTER TABLE tombstone RENAME TO tombstone_old;
              CREATE TABLE tombstone (
                scope TEXT NOT NULL,
                key TEXT NOT NULL,
                author_id BLOB NOT NULL,
                usn INTEGER NOT NULL,
                deleting_author_id BLOB NOT NULL,
                deleting_usn INTEGER NOT NULL
              );
              INSERT INTO tombstone
                SELECT scope, key, author_id, usn, deleting_author_id, deleting_usn
                FROM tombstone_old;
              DROP TABLE tombstone_old;
              CREATE INDEX tombstone_by_deleter
                ON tombstone (deleting_author_id, deleting_usn);
              CREATE INDEX tombstone_by_slot
                ON tombstone (scope, key, author_id);",
    },
];

pub(crate) fn open_connection(path: &Path, read_only: bool) -> Result<Connection, StoreError> {
    let flags = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
    };
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    if !read_only {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
    }
    Ok(conn)
}

fn applied_names(conn: &Connection) -> Result<BTreeSet<String>, StoreError> {
    let table_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'migrations'",
        [],
        |row| row.get(0),
    )?;
    if table_count == 0 {
        return Ok(BTreeSet::new());
    }
    let mut stmt = conn.prepare("SELECT name FROM migrations")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(names)
}

/// Fail `schema-too-new` if the file records a migration outside the
/// known set. Safe on read-only connections.
pub(crate) fn check_known(conn: &Connection) -> Result<(), StoreError> {
    let applied = applied_names(conn)?;
    let known: BTreeSet<&str> = MIGRATIONS.iter().map(|m| m.name).collect();
    for name in &applied {
        if !known.contains(name.as_str()) {
            return Err(StoreError::SchemaTooNew {
                migration: name.clone(),
            });
        }
    }
    Ok(())
}

/// Bring the file up to the current schema: reject unknown steps, then
/// run every unapplied known step, in order, inside one transaction.
pub(crate) fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    check_known(conn)?;
    let applied = applied_names(conn)?;

    let tx = conn.transaction()?;
    tx.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
           name TEXT PRIMARY KEY,
           applied_at INTEGER NOT NULL
         )",
        [],
    )?;
    for migration in MIGRATIONS {
        if applied.contains(migration.name) {
            continue;
        }
        tracing::info!(name = migration.name, "applying schema migration");
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO migrations (name, applied_at) VALUES (?1, ?2)",
            params![migration.name, now_ms()],
        )?;
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_conn() -> Connection {
        Connection::open_in_memory().expect("open in-memory db")
    }

    #[test]
    fn fresh_file_applies_all_migrations() {
        let mut conn = memory_conn();
        migrate(&mut conn).expect("migrate");
        let applied = applied_names(&conn).expect("applied names");
        assert!(applied.contains("0001_initial"));
        assert!(applied.contains("0002_tombstone_rebuild"));
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut conn = memory_conn();
        migrate(&mut conn).expect("first migrate");
        migrate(&mut conn).expect("second migrate");
    }

    #[test]
    fn tombstone_rows_are_not_unique_after_rebuild() {
        let mut conn = memory_conn();
        migrate(&mut conn).expect("migrate");
        let blob = vec![0u8; 16];
        for _ in 0..2 {
            conn.execute(
                "INSERT INTO tombstone \
                 (scope, key, author_id, usn, deleting_author_id, deleting_usn) \
                 VALUES ('', 'k', ?1, 1, ?1, 2)",
                params![blob],
            )
            .expect("insert tombstone twice");
        }
    }

    #[test]
    fn unknown_migration_fails_schema_too_new() {
        let mut conn = memory_conn();
        migrate(&mut conn).expect("migrate");
        conn.execute(
            "INSERT INTO migrations (name, applied_at) VALUES ('9999_from_the_future', 0)",
            [],
        )
        .expect("insert future migration");
        let err = migrate(&mut conn).unwrap_err();
        assert!(matches!(
            err,
            StoreError::SchemaTooNew { migration } if migration == "9999_from_the_future"
        ));
    }
}
