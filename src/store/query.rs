//! Read-side query surface: key listing, bulk reads, full-text
//! search, statistics.

use std::collections::BTreeMap;

use rusqlite::{Connection, params};
use serde::Serialize;

use crate::core::{EntryKey, Key, Scope, Version, Versions};
use crate::store::error::StoreError;
use crate::store::rows;

/// Equality filter over `(scope, key)`. An unset field matches
/// everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    pub scope: Option<Scope>,
    pub key: Option<Key>,
}

impl Filter {
    pub fn in_scope(mut self, scope: impl Into<Scope>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn matches(&self, key: &EntryKey) -> bool {
        self.scope.as_ref().is_none_or(|s| *s == key.scope)
            && self.key.as_ref().is_none_or(|k| *k == key.key)
    }
}

/// Store-level counters plus the consistency verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub entries: u64,
    pub authors: u64,
    pub tombstones: u64,
    pub consistent: bool,
}

fn filter_clause(filter: &Filter, sql: &mut String, args: &mut Vec<String>) {
    if let Some(scope) = &filter.scope {
        sql.push_str(" AND scope = ?");
        args.push(scope.as_str().to_string());
    }
    if let Some(key) = &filter.key {
        sql.push_str(" AND key = ?");
        args.push(key.as_str().to_string());
    }
}

/// All `(scope, key)` slots holding at least one non-null entry.
pub(crate) fn keys(conn: &Connection, filter: &Filter) -> Result<Vec<EntryKey>, StoreError> {
    let mut sql = String::from(
        "SELECT DISTINCT scope, key FROM entry WHERE type != 'null'",
    );
    let mut args = Vec::new();
    filter_clause(filter, &mut sql, &mut args);
    sql.push_str(" ORDER BY scope, key");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
        Ok(EntryKey::new(
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
        ))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn collect_versions(
    conn: &Connection,
    sql: &str,
    args: &[String],
) -> Result<BTreeMap<EntryKey, Versions>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Vec<u8>>(2)?,
            row.get::<_, u64>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
            row.get::<_, Option<Vec<u8>>>(8)?,
        ))
    })?;

    let mut grouped: BTreeMap<EntryKey, Vec<Version>> = BTreeMap::new();
    for row in rows {
        let (scope, key, author, timestamp, kind, text, json, mime, blob) = row?;
        let version = Version {
            author: rows::blob_author(author)?,
            timestamp,
            value: rows::value_from_columns(kind, text, json, mime, blob)?,
        };
        grouped
            .entry(EntryKey::new(scope, key))
            .or_default()
            .push(version);
    }
    Ok(grouped
        .into_iter()
        .map(|(key, versions)| (key, Versions::new(versions)))
        .collect())
}

const BULK_SELECT: &str = "SELECT scope, key, author_id, timestamp, type, text, json, \
                           blob_mime, blob FROM entry WHERE 1=1";

/// Dictionary from slot to version list, filtered server-side.
pub(crate) fn bulk_read(
    conn: &Connection,
    filter: &Filter,
) -> Result<BTreeMap<EntryKey, Versions>, StoreError> {
    let mut sql = String::from(BULK_SELECT);
    let mut args = Vec::new();
    filter_clause(filter, &mut sql, &mut args);
    sql.push_str(" ORDER BY scope, key, author_id");
    collect_versions(conn, &sql, &args)
}

/// Bulk read restricted to keys sharing a prefix.
pub(crate) fn bulk_read_prefix(
    conn: &Connection,
    scope: Option<&Scope>,
    prefix: &str,
) -> Result<BTreeMap<EntryKey, Versions>, StoreError> {
    let mut sql = String::from(BULK_SELECT);
    let mut args = Vec::new();
    if let Some(scope) = scope {
        sql.push_str(" AND scope = ?");
        args.push(scope.as_str().to_string());
    }
    sql.push_str(" AND key LIKE ? ESCAPE '\\'");
    let escaped = prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    args.push(format!("{escaped}%"));
    sql.push_str(" ORDER BY scope, key, author_id");
    collect_versions(conn, &sql, &args)
}

/// Bulk read of an explicit key list. Never-written slots are absent
/// from the result.
pub(crate) fn bulk_read_keys(
    conn: &Connection,
    keys: &[EntryKey],
) -> Result<BTreeMap<EntryKey, Versions>, StoreError> {
    let mut result = BTreeMap::new();
    for key in keys {
        let versions = rows::read_versions(conn, key)?;
        if !versions.is_empty() {
            result.insert(key.clone(), versions);
        }
    }
    Ok(result)
}

/// Bulk read with a caller predicate, evaluated per slot.
pub(crate) fn bulk_read_where(
    conn: &Connection,
    mut predicate: impl FnMut(&EntryKey) -> bool,
) -> Result<BTreeMap<EntryKey, Versions>, StoreError> {
    let mut all = bulk_read(conn, &Filter::default())?;
    all.retain(|key, _| predicate(key));
    Ok(all)
}

/// Slots whose text payload matches the full-text query.
pub(crate) fn search_text(conn: &Connection, query: &str) -> Result<Vec<EntryKey>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT e.scope, e.key \
         FROM entry_full_text JOIN entry e ON e.rowid = entry_full_text.rowid \
         WHERE entry_full_text MATCH ?1 \
         ORDER BY e.scope, e.key",
    )?;
    let rows = stmt.query_map(params![query], |row| {
        Ok(EntryKey::new(
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
        ))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub(crate) fn statistics(conn: &Connection) -> Result<Statistics, StoreError> {
    let entries: u64 = conn.query_row("SELECT COUNT(*) FROM entry", [], |row| row.get(0))?;
    let authors: u64 = conn.query_row("SELECT COUNT(*) FROM author", [], |row| row.get(0))?;
    let tombstones: u64 =
        conn.query_row("SELECT COUNT(*) FROM tombstone", [], |row| row.get(0))?;
    let consistent = rows::verify_author_table(conn).is_ok();
    Ok(Statistics {
        entries,
        authors,
        tombstones,
        consistent,
    })
}
