//! Merge: pull from a source replica into the destination.
//!
//! The transfer is need-driven: the destination's author vector is
//! compared against the source's, and only records past the local
//! high-water marks move. Tombstones apply before entries so a fetched
//! tombstone that a fetched entry supersedes ends up garbage-collected
//! rather than resurrected.

use std::collections::BTreeSet;
use std::path::Path;

use rusqlite::{Connection, params};

use crate::core::{AuthorRecord, EntryKey, Need, Tombstone, VersionVector};
use crate::store::error::StoreError;
use crate::store::gate::{self, ApplicationId};
use crate::store::rows::{self, EntryRow};
use crate::store::schema;

/// Everything a merge would apply, computed under a read transaction
/// on the source. A dry run stops here.
pub(crate) struct MergePlan {
    pub source_authors: Vec<AuthorRecord>,
    pub entries: Vec<EntryRow>,
    pub tombstones: Vec<Tombstone>,
    /// Slots whose read result the merge changes.
    pub changed: BTreeSet<EntryKey>,
}

fn fetch_entries(src: &Connection, needs: &[Need]) -> Result<Vec<EntryRow>, StoreError> {
    let mut entries = Vec::new();
    for need in needs {
        let mut stmt = src.prepare_cached(
            "SELECT scope, key, author_id, usn, timestamp, type, text, json, blob_mime, blob \
             FROM entry WHERE author_id = ?1 AND usn > ?2",
        )?;
        let rows_iter = stmt.query_map(
            params![
                rows::author_blob(&need.author),
                need.local_usn.unwrap_or(0)
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, u64>(3)?,
                    row.get::<_, u64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<Vec<u8>>>(9)?,
                ))
            },
        )?;
        for row in rows_iter {
            let (scope, key, author, usn, timestamp, kind, text, json, mime, blob) = row?;
            entries.push(EntryRow {
                scope: scope.into(),
                key: key.into(),
                author_id: rows::blob_author(author)?,
                usn,
                timestamp,
                value: rows::value_from_columns(kind, text, json, mime, blob)?,
            });
        }
    }
    Ok(entries)
}

fn fetch_tombstones(src: &Connection, needs: &[Need]) -> Result<Vec<Tombstone>, StoreError> {
    let mut tombstones = Vec::new();
    for need in needs {
        let mut stmt = src.prepare_cached(
            "SELECT scope, key, author_id, usn, deleting_author_id, deleting_usn \
             FROM tombstone WHERE deleting_author_id = ?1 AND deleting_usn > ?2",
        )?;
        let rows_iter = stmt.query_map(
            params![
                rows::author_blob(&need.author),
                need.local_usn.unwrap_or(0)
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, u64>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, u64>(5)?,
                ))
            },
        )?;
        for row in rows_iter {
            let (scope, key, author, usn, deleter, deleting_usn) = row?;
            tombstones.push(Tombstone {
                scope: scope.into(),
                key: key.into(),
                author_id: rows::blob_author(author)?,
                usn,
                deleting_author_id: rows::blob_author(deleter)?,
                deleting_usn,
            });
        }
    }
    Ok(tombstones)
}

/// Steps 1-7 of the merge protocol: verify both sides, gate the
/// source, compute the need list, and fetch what the destination is
/// missing. Read-only on both connections.
pub(crate) fn plan(
    dest: &Connection,
    expected: Option<&ApplicationId>,
    source_path: &Path,
) -> Result<MergePlan, StoreError> {
    rows::verify_author_table(dest)?;
    let dest_vector = rows::author_vector(dest)?;

    let mut src_conn = schema::open_connection(source_path, true)?;
    schema::check_known(&src_conn)?;
    let src_stored = gate::read_stored(&src_conn)?;
    if let Some(expected) = expected {
        gate::check_merge_source(src_stored.as_ref(), expected)?;
    }

    let src_tx = src_conn.transaction()?;
    rows::verify_author_table(&src_tx)?;
    let source_vector = rows::author_vector(&src_tx)?;
    let needs = dest_vector.need_list(&source_vector);

    let entries = fetch_entries(&src_tx, &needs)?;
    let tombstones = fetch_tombstones(&src_tx, &needs)?;
    let source_authors = rows::load_authors(&src_tx)?;
    src_tx.finish()?;

    let mut changed = BTreeSet::new();
    for entry in &entries {
        changed.insert(entry.entry_key());
    }
    for tombstone in &tombstones {
        let key = tombstone.entry_key();
        if changed.contains(&key) {
            continue;
        }
        // A tombstone changes the read result only when it removes a
        // live entry.
        if let Some(existing) = rows::slot_entry(dest, &key, &tombstone.author_id)?
            && existing.usn <= tombstone.usn
        {
            changed.insert(key);
        }
    }

    tracing::debug!(
        needs = needs.len(),
        entries = entries.len(),
        tombstones = tombstones.len(),
        changed = changed.len(),
        "merge plan computed"
    );

    Ok(MergePlan {
        source_authors,
        entries,
        tombstones,
        changed,
    })
}

/// Steps 8-10: union the author vectors, apply tombstones, then apply
/// entries and garbage-collect superseded tombstones. Runs inside the
/// destination's write transaction; `local` is the engine's cached
/// session record and is refreshed in place if the union touches it.
pub(crate) fn apply(
    dest: &Connection,
    plan: &MergePlan,
    local: &mut AuthorRecord,
) -> Result<(), StoreError> {
    let existing: Vec<AuthorRecord> = rows::load_authors(dest)?;
    let mut merged = VersionVector::from_authors(&existing);
    merged.union(&VersionVector::from_authors(&plan.source_authors));

    for source_record in &plan.source_authors {
        if source_record.id == local.id {
            // The union rewrote the local session's row; refresh the
            // cache within the same transaction.
            if source_record.usn > local.usn {
                local.usn = source_record.usn;
                local.timestamp = source_record.timestamp;
            }
            rows::upsert_author(dest, local)?;
            continue;
        }
        let unioned_usn = merged.get(&source_record.id);
        let record = existing
            .iter()
            .find(|r| r.id == source_record.id)
            .filter(|r| r.usn >= source_record.usn)
            .unwrap_or(source_record);
        rows::upsert_author(
            dest,
            &AuthorRecord {
                id: record.id,
                name: record.name.clone(),
                usn: unioned_usn,
                timestamp: record.timestamp,
            },
        )?;
    }

    for tombstone in &plan.tombstones {
        let key = tombstone.entry_key();
        match rows::slot_entry(dest, &key, &tombstone.author_id)? {
            // A newer local entry supersedes the tombstone; it would
            // be garbage-collected immediately, so never insert it.
            Some(existing) if existing.usn > tombstone.usn => continue,
            Some(existing) => {
                rows::delete_entry(dest, &existing)?;
                rows::insert_tombstone(dest, tombstone)?;
            }
            None => rows::insert_tombstone(dest, tombstone)?,
        }
    }

    for entry in &plan.entries {
        rows::upsert_entry(dest, entry)?;
        rows::gc_tombstones(dest, &entry.entry_key(), &entry.author_id, entry.usn)?;
    }

    Ok(())
}
