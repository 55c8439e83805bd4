//! Row-level persistence for the five relations.
//!
//! Everything here runs inside a caller-owned transaction. The
//! full-text index is an external-content FTS5 table over `entry.text`
//! and is kept in lockstep manually: every entry insert, update, or
//! delete that touches a text payload mirrors it here.

use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::core::{
    AuthorId, AuthorRecord, EntryKey, Key, Scope, Tombstone, Value, ValueKind, Version,
    VersionVector, Versions,
};
use crate::store::error::StoreError;

/// One persisted entry: the primary identity `(scope, key, author_id)`
/// plus the write stamp and payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct EntryRow {
    pub scope: Scope,
    pub key: Key,
    pub author_id: AuthorId,
    pub usn: u64,
    pub timestamp: u64,
    pub value: Value,
}

impl EntryRow {
    pub fn entry_key(&self) -> EntryKey {
        EntryKey {
            scope: self.scope.clone(),
            key: self.key.clone(),
        }
    }
}

/// A slot occupant located for supersession: enough to tombstone and
/// remove it.
pub(crate) struct SlotEntry {
    pub rowid: i64,
    pub author_id: AuthorId,
    pub usn: u64,
    pub text: Option<String>,
}

pub(crate) fn author_blob(author: &AuthorId) -> Vec<u8> {
    author.as_bytes().to_vec()
}

pub(crate) fn blob_author(blob: Vec<u8>) -> Result<AuthorId, StoreError> {
    let uuid = Uuid::from_slice(&blob).map_err(|_| StoreError::RowDecode {
        reason: "author id blob wrong length".to_string(),
    })?;
    Ok(AuthorId::from_uuid(uuid))
}

fn usn_from_i64(raw: i64) -> Result<u64, StoreError> {
    u64::try_from(raw).map_err(|_| StoreError::RowDecode {
        reason: "usn out of range".to_string(),
    })
}

pub(crate) fn value_from_columns(
    kind: String,
    text: Option<String>,
    json: Option<String>,
    blob_mime: Option<String>,
    blob: Option<Vec<u8>>,
) -> Result<Value, StoreError> {
    let kind = ValueKind::parse(&kind).ok_or_else(|| StoreError::RowDecode {
        reason: format!("unknown entry type {kind:?}"),
    })?;
    match kind {
        ValueKind::Null => Ok(Value::Null),
        ValueKind::Text => text.map(Value::Text).ok_or_else(|| StoreError::RowDecode {
            reason: "text entry missing text payload".to_string(),
        }),
        ValueKind::Json => json.map(Value::Json).ok_or_else(|| StoreError::RowDecode {
            reason: "json entry missing json payload".to_string(),
        }),
        ValueKind::Blob => match (blob_mime, blob) {
            (Some(mime), Some(bytes)) => Ok(Value::Blob { mime, bytes }),
            _ => Err(StoreError::RowDecode {
                reason: "blob entry missing payload".to_string(),
            }),
        },
    }
}

fn fts_insert(conn: &Connection, rowid: i64, text: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO entry_full_text (rowid, text) VALUES (?1, ?2)",
        params![rowid, text],
    )?;
    Ok(())
}

fn fts_delete(conn: &Connection, rowid: i64, text: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO entry_full_text (entry_full_text, rowid, text) VALUES ('delete', ?1, ?2)",
        params![rowid, text],
    )?;
    Ok(())
}

/// All live versions at a slot, ordered by author id.
pub(crate) fn read_versions(conn: &Connection, key: &EntryKey) -> Result<Versions, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT author_id, timestamp, type, text, json, blob_mime, blob \
         FROM entry WHERE scope = ?1 AND key = ?2 ORDER BY author_id",
    )?;
    let rows = stmt.query_map(params![key.scope.as_str(), key.key.as_str()], |row| {
        Ok((
            row.get::<_, Vec<u8>>(0)?,
            row.get::<_, u64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<Vec<u8>>>(6)?,
        ))
    })?;

    let mut versions = Vec::new();
    for row in rows {
        let (author, timestamp, kind, text, json, mime, blob) = row?;
        versions.push(Version {
            author: blob_author(author)?,
            timestamp,
            value: value_from_columns(kind, text, json, mime, blob)?,
        });
    }
    Ok(Versions::new(versions))
}

/// Slot occupants, optionally excluding one author.
pub(crate) fn slot_entries(
    conn: &Connection,
    key: &EntryKey,
    exclude: Option<&AuthorId>,
) -> Result<Vec<SlotEntry>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT rowid, author_id, usn, text FROM entry WHERE scope = ?1 AND key = ?2",
    )?;
    let rows = stmt.query_map(params![key.scope.as_str(), key.key.as_str()], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (rowid, author, usn, text) = row?;
        let author_id = blob_author(author)?;
        if exclude.is_some_and(|local| *local == author_id) {
            continue;
        }
        entries.push(SlotEntry {
            rowid,
            author_id,
            usn: usn_from_i64(usn)?,
            text,
        });
    }
    Ok(entries)
}

/// One author's occupant at a slot.
pub(crate) fn slot_entry(
    conn: &Connection,
    key: &EntryKey,
    author: &AuthorId,
) -> Result<Option<SlotEntry>, StoreError> {
    let row = conn
        .query_row(
            "SELECT rowid, usn, text FROM entry \
             WHERE scope = ?1 AND key = ?2 AND author_id = ?3",
            params![key.scope.as_str(), key.key.as_str(), author_blob(author)],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;
    match row {
        Some((rowid, usn, text)) => Ok(Some(SlotEntry {
            rowid,
            author_id: *author,
            usn: usn_from_i64(usn)?,
            text,
        })),
        None => Ok(None),
    }
}

/// Remove an entry row, mirroring the full-text index.
pub(crate) fn delete_entry(conn: &Connection, entry: &SlotEntry) -> Result<(), StoreError> {
    delete_entry_by_rowid(conn, entry.rowid, entry.text.as_deref())
}

pub(crate) fn delete_entry_by_rowid(
    conn: &Connection,
    rowid: i64,
    text: Option<&str>,
) -> Result<(), StoreError> {
    if let Some(text) = text {
        fts_delete(conn, rowid, text)?;
    }
    conn.execute("DELETE FROM entry WHERE rowid = ?1", params![rowid])?;
    Ok(())
}

/// Insert or replace the entry at `(scope, key, author_id)`, keeping
/// the full-text index in lockstep.
pub(crate) fn upsert_entry(conn: &Connection, row: &EntryRow) -> Result<(), StoreError> {
    let key = row.entry_key();
    let existing = slot_entry(conn, &key, &row.author_id)?;

    let kind = row.value.kind().as_str();
    let (text, json, mime, blob): (Option<&str>, Option<&str>, Option<&str>, Option<&[u8]>) =
        match &row.value {
            Value::Null => (None, None, None, None),
            Value::Text(s) => (Some(s.as_str()), None, None, None),
            Value::Json(s) => (None, Some(s.as_str()), None, None),
            Value::Blob { mime, bytes } => {
                (None, None, Some(mime.as_str()), Some(bytes.as_slice()))
            }
        };

    let rowid = match existing {
        Some(old) => {
            if let Some(old_text) = &old.text {
                fts_delete(conn, old.rowid, old_text)?;
            }
            conn.execute(
                "UPDATE entry SET usn = ?1, timestamp = ?2, type = ?3, \
                 text = ?4, json = ?5, blob_mime = ?6, blob = ?7 WHERE rowid = ?8",
                params![row.usn, row.timestamp, kind, text, json, mime, blob, old.rowid],
            )?;
            old.rowid
        }
        None => {
            conn.execute(
                "INSERT INTO entry \
                 (scope, key, author_id, usn, timestamp, type, text, json, blob_mime, blob) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    row.scope.as_str(),
                    row.key.as_str(),
                    author_blob(&row.author_id),
                    row.usn,
                    row.timestamp,
                    kind,
                    text,
                    json,
                    mime,
                    blob,
                ],
            )?;
            conn.last_insert_rowid()
        }
    };
    if let Some(text) = text {
        fts_insert(conn, rowid, text)?;
    }
    Ok(())
}

pub(crate) fn insert_tombstone(conn: &Connection, tombstone: &Tombstone) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO tombstone \
         (scope, key, author_id, usn, deleting_author_id, deleting_usn) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            tombstone.scope.as_str(),
            tombstone.key.as_str(),
            author_blob(&tombstone.author_id),
            tombstone.usn,
            author_blob(&tombstone.deleting_author_id),
            tombstone.deleting_usn,
        ],
    )?;
    Ok(())
}

/// Garbage-collect tombstones made obsolete by a newer entry at the
/// same author slot.
pub(crate) fn gc_tombstones(
    conn: &Connection,
    key: &EntryKey,
    author: &AuthorId,
    below_usn: u64,
) -> Result<usize, StoreError> {
    let removed = conn.execute(
        "DELETE FROM tombstone \
         WHERE scope = ?1 AND key = ?2 AND author_id = ?3 AND usn < ?4",
        params![
            key.scope.as_str(),
            key.key.as_str(),
            author_blob(author),
            below_usn
        ],
    )?;
    Ok(removed)
}

pub(crate) fn load_authors(conn: &Connection) -> Result<Vec<AuthorRecord>, StoreError> {
    let mut stmt =
        conn.prepare_cached("SELECT id, name, usn, timestamp FROM author ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, Vec<u8>>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, u64>(3)?,
        ))
    })?;

    let mut authors = Vec::new();
    for row in rows {
        let (id, name, usn, timestamp) = row?;
        authors.push(AuthorRecord {
            id: blob_author(id)?,
            name,
            usn: usn_from_i64(usn)?,
            timestamp,
        });
    }
    Ok(authors)
}

pub(crate) fn upsert_author(conn: &Connection, record: &AuthorRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO author (id, name, usn, timestamp) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(id) DO UPDATE SET \
           name = excluded.name, usn = excluded.usn, timestamp = excluded.timestamp",
        params![
            author_blob(&record.id),
            record.name,
            record.usn,
            record.timestamp
        ],
    )?;
    Ok(())
}

/// The vector implied by the entry table: max usn per author.
pub(crate) fn entry_vector(conn: &Connection) -> Result<VersionVector, StoreError> {
    let mut stmt =
        conn.prepare_cached("SELECT author_id, MAX(usn) FROM entry GROUP BY author_id")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut vector = VersionVector::new();
    for row in rows {
        let (author, usn) = row?;
        vector.observe(blob_author(author)?, usn_from_i64(usn)?);
    }
    Ok(vector)
}

pub(crate) fn author_vector(conn: &Connection) -> Result<VersionVector, StoreError> {
    Ok(VersionVector::from_authors(&load_authors(conn)?))
}

/// The author-table consistency invariant: the author vector must
/// dominate the entry vector.
pub(crate) fn verify_author_table(conn: &Connection) -> Result<(), StoreError> {
    let authors = author_vector(conn)?;
    let entries = entry_vector(conn)?;
    if authors.dominates(&entries) {
        return Ok(());
    }
    for (author, max_entry_usn) in entries.iter() {
        let author_usn = authors.get(author);
        if author_usn < max_entry_usn {
            return Err(StoreError::AuthorTableInconsistency {
                author: *author,
                author_usn: (author_usn > 0).then_some(author_usn),
                max_entry_usn,
            });
        }
    }
    unreachable!("entry vector not dominated yet no offending author found")
}
