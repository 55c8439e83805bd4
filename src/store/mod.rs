//! The reconciliation engine over the SQLite substrate.
//!
//! Single-writer, multi-reader within one process: all mutating
//! operations take `&mut self` and serialize on the file's write lock;
//! reads run against a consistent snapshot. The engine spawns no
//! workers, and change notifications are delivered synchronously after
//! commit on the committing thread.

pub mod error;
pub mod gate;
mod merge;
pub mod observe;
pub mod query;
mod rows;
mod schema;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior, params};

use crate::core::{
    AuthorRecord, EntryKey, Scope, Tombstone, Value, Version, VersionVector, Versions, now_ms,
};
use error::StoreError;
use gate::{ApplicationId, GateOutcome};
use observe::{ChangeEvent, ChangeSubscription, Observers, ReadSubscription};
use query::{Filter, Statistics};
use rows::EntryRow;

/// Runs while the application-version gate upgrades a file: the store
/// is open and migrated, `stored` is the stamp found in the file
/// (`None` for a fresh file). After the hook returns the file is
/// stamped with the expected identifier.
pub type UpgradeHook = Box<dyn FnMut(&mut Store, Option<&ApplicationId>) -> Result<(), StoreError>>;

/// The caller's side of the application-version gate.
pub struct ApplicationCheck {
    pub expected: ApplicationId,
    pub on_upgrade: Option<UpgradeHook>,
}

impl ApplicationCheck {
    pub fn new(expected: ApplicationId) -> Self {
        Self {
            expected,
            on_upgrade: None,
        }
    }

    pub fn on_upgrade(
        mut self,
        hook: impl FnMut(&mut Store, Option<&ApplicationId>) -> Result<(), StoreError> + 'static,
    ) -> Self {
        self.on_upgrade = Some(Box::new(hook));
        self
    }
}

/// Open-time configuration.
///
/// Without an [`ApplicationCheck`] the gate is skipped and the file is
/// never stamped - the tooling mode the CLI uses to inspect arbitrary
/// files.
pub struct OpenOptions {
    author_name: String,
    application: Option<ApplicationCheck>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            author_name: "oxbow".to_string(),
            application: None,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Human-readable hint stored on the session's author record.
    pub fn author_name(mut self, name: impl Into<String>) -> Self {
        self.author_name = name.into();
        self
    }

    pub fn application(mut self, check: ApplicationCheck) -> Self {
        self.application = Some(check);
        self
    }
}

/// One open of an oxbow database file.
///
/// Every open is a fresh write session: a new author id is drawn and
/// its record is persisted by the first write. The engine caches the
/// session's author row and keeps it equal to the persisted row after
/// every commit.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    path: PathBuf,
    author: AuthorRecord,
    expected_application: Option<ApplicationId>,
    observers: Observers,
}

impl Store {
    /// Open (creating if absent) and gate a database file.
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<Store, StoreError> {
        let path = path.as_ref().to_path_buf();
        let OpenOptions {
            author_name,
            application,
        } = options;

        let mut conn = schema::open_connection(&path, false)?;
        schema::migrate(&mut conn)?;

        let (expected, mut hook) = match application {
            Some(check) => (Some(check.expected), check.on_upgrade),
            None => (None, None),
        };

        let mut store = Store {
            conn,
            path,
            author: AuthorRecord::new_session(author_name, now_ms()),
            expected_application: expected,
            observers: Observers::default(),
        };

        if let Some(expected) = store.expected_application.clone() {
            match gate::check_open(&store.conn, &expected)? {
                GateOutcome::Open => {}
                GateOutcome::Upgrade { stored } => {
                    if let Some(hook) = hook.as_mut() {
                        hook(&mut store, stored.as_ref())?;
                    }
                    gate::stamp(&store.conn, &expected)?;
                }
            }
        }

        tracing::debug!(path = %store.path.display(), author = %store.author.id, "store opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The cached local session record.
    pub fn author(&self) -> &AuthorRecord {
        &self.author
    }

    pub fn application_identifier(&self) -> Result<Option<ApplicationId>, StoreError> {
        gate::read_stored(&self.conn)
    }

    /// The replica's version vector, read from the author table.
    pub fn version_vector(&self) -> Result<VersionVector, StoreError> {
        rows::author_vector(&self.conn)
    }

    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, err)| StoreError::Sqlite(err))
    }

    // ----- write path -----

    /// Write a value at a slot, superseding every other author's entry
    /// there. One atomic transaction; the new version is returned and
    /// broadcast to observers after commit.
    pub fn write(&mut self, key: &EntryKey, value: Value) -> Result<Version, StoreError> {
        let mut versions = self.write_many(vec![(key.clone(), value)])?;
        Ok(versions.pop().expect("one write yields one version"))
    }

    /// A deletion is a write of the null value: readers see a version
    /// whose value is `Null` until a later write supersedes it.
    pub fn delete(&mut self, key: &EntryKey) -> Result<Version, StoreError> {
        self.write(key, Value::Null)
    }

    pub fn write_text(
        &mut self,
        key: &EntryKey,
        text: impl Into<String>,
    ) -> Result<Version, StoreError> {
        self.write(key, Value::Text(text.into()))
    }

    pub fn write_json(
        &mut self,
        key: &EntryKey,
        json: impl Into<String>,
    ) -> Result<Version, StoreError> {
        self.write(key, Value::Json(json.into()))
    }

    pub fn write_blob(
        &mut self,
        key: &EntryKey,
        mime: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<Version, StoreError> {
        self.write(
            key,
            Value::Blob {
                mime: mime.into(),
                bytes,
            },
        )
    }

    /// Bulk write: every input gets its own usn, supersession of other
    /// authors happens once per distinct key, and the whole batch is
    /// one transaction.
    pub fn write_many(
        &mut self,
        writes: Vec<(EntryKey, Value)>,
    ) -> Result<Vec<Version>, StoreError> {
        // Validation precedes any mutation.
        for (_, value) in &writes {
            value.validate()?;
        }

        let now = now_ms();
        let mut local = self.author.clone();
        let mut superseded: BTreeSet<EntryKey> = BTreeSet::new();
        let mut versions = Vec::with_capacity(writes.len());
        let mut changed: Vec<EntryKey> = Vec::new();

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for (key, value) in writes {
            let usn = local.next_usn();
            local.usn = usn;
            local.timestamp = now;
            rows::upsert_author(&tx, &local)?;

            if superseded.insert(key.clone()) {
                for other in rows::slot_entries(&tx, &key, Some(&local.id))? {
                    rows::insert_tombstone(
                        &tx,
                        &Tombstone {
                            scope: key.scope.clone(),
                            key: key.key.clone(),
                            author_id: other.author_id,
                            usn: other.usn,
                            deleting_author_id: local.id,
                            deleting_usn: usn,
                        },
                    )?;
                    rows::delete_entry(&tx, &other)?;
                }
                changed.push(key.clone());
            }

            rows::upsert_entry(
                &tx,
                &EntryRow {
                    scope: key.scope.clone(),
                    key: key.key.clone(),
                    author_id: local.id,
                    usn,
                    timestamp: now,
                    value: value.clone(),
                },
            )?;
            // Tombstones below the slot's new usn are obsolete.
            rows::gc_tombstones(&tx, &key, &local.id, usn)?;

            versions.push(Version {
                author: local.id,
                timestamp: now,
                value,
            });
        }
        tx.commit()?;
        self.author = local;

        tracing::debug!(writes = versions.len(), usn = self.author.usn, "write committed");
        rows::verify_author_table(&self.conn)?;
        self.notify_committed(&changed, false)?;
        Ok(versions)
    }

    // ----- read path -----

    /// Every live version at a slot: empty means never written, a
    /// single null version means deleted, several versions mean
    /// conflict.
    pub fn read(&self, key: &EntryKey) -> Result<Versions, StoreError> {
        rows::read_versions(&self.conn, key)
    }

    pub fn keys(&self, filter: &Filter) -> Result<Vec<EntryKey>, StoreError> {
        query::keys(&self.conn, filter)
    }

    pub fn bulk_read(&self, filter: &Filter) -> Result<BTreeMap<EntryKey, Versions>, StoreError> {
        query::bulk_read(&self.conn, filter)
    }

    pub fn bulk_read_prefix(
        &self,
        scope: Option<&Scope>,
        prefix: &str,
    ) -> Result<BTreeMap<EntryKey, Versions>, StoreError> {
        query::bulk_read_prefix(&self.conn, scope, prefix)
    }

    pub fn bulk_read_keys(
        &self,
        keys: &[EntryKey],
    ) -> Result<BTreeMap<EntryKey, Versions>, StoreError> {
        query::bulk_read_keys(&self.conn, keys)
    }

    pub fn bulk_read_where(
        &self,
        predicate: impl FnMut(&EntryKey) -> bool,
    ) -> Result<BTreeMap<EntryKey, Versions>, StoreError> {
        query::bulk_read_where(&self.conn, predicate)
    }

    /// Full-text query over text payloads.
    pub fn search_text(&self, needle: &str) -> Result<Vec<EntryKey>, StoreError> {
        query::search_text(&self.conn, needle)
    }

    pub fn statistics(&self) -> Result<Statistics, StoreError> {
        query::statistics(&self.conn)
    }

    // ----- observers -----

    /// Cold stream of per-key deltas for committed writes, bulk
    /// writes, and merges.
    pub fn change_observer(&mut self) -> ChangeSubscription {
        self.observers.subscribe_cold()
    }

    /// Hot observer: yields the current matched set immediately, then
    /// the full matched set after every commit touching the region.
    pub fn read_observer(&mut self, filter: Filter) -> Result<ReadSubscription, StoreError> {
        let initial = query::bulk_read(&self.conn, &filter)?;
        Ok(self.observers.subscribe_hot(filter, initial))
    }

    // ----- merge -----

    /// Pull everything this replica is missing from `source`. Returns
    /// the slots whose read results changed.
    pub fn merge_from(&mut self, source: impl AsRef<Path>) -> Result<BTreeSet<EntryKey>, StoreError> {
        let source = source.as_ref();
        let expected = self.merge_expectation()?;
        let mut local = self.author.clone();

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let plan = merge::plan(&tx, expected.as_ref(), source)?;
        merge::apply(&tx, &plan, &mut local)?;
        tx.commit()?;
        self.author = local;

        tracing::info!(
            source = %source.display(),
            entries = plan.entries.len(),
            tombstones = plan.tombstones.len(),
            changed = plan.changed.len(),
            "merge committed"
        );
        // As on the write path, the consistency check runs against the
        // committed state: a violation is reported to the caller but
        // never rolls the merge back.
        rows::verify_author_table(&self.conn)?;
        let changed: Vec<EntryKey> = plan.changed.iter().cloned().collect();
        self.notify_committed(&changed, false)?;
        Ok(plan.changed)
    }

    /// Compute what a merge would change without applying it.
    pub fn merge_dry_run(
        &self,
        source: impl AsRef<Path>,
    ) -> Result<BTreeSet<EntryKey>, StoreError> {
        let expected = self.merge_expectation()?;
        let tx = self.conn.unchecked_transaction()?;
        let plan = merge::plan(&tx, expected.as_ref(), source.as_ref())?;
        drop(tx);
        Ok(plan.changed)
    }

    /// True iff this replica's vector dominates the on-disk source's -
    /// i.e. the source carries nothing new.
    pub fn dominates(&self, source: impl AsRef<Path>) -> Result<bool, StoreError> {
        let src = schema::open_connection(source.as_ref(), true)?;
        schema::check_known(&src)?;
        let source_vector = rows::author_vector(&src)?;
        Ok(self.version_vector()?.dominates(&source_vector))
    }

    fn merge_expectation(&self) -> Result<Option<ApplicationId>, StoreError> {
        match &self.expected_application {
            Some(app) => Ok(Some(app.clone())),
            // Tooling opens carry no expectation; the file's own stamp
            // stands in so cross-application merges still fail.
            None => gate::read_stored(&self.conn),
        }
    }

    // ----- history -----

    /// Collapse the replica to a single-author database with no
    /// history: drop all tombstones, rewrite every entry to the local
    /// session at one fresh usn, and delete all other author records.
    /// Conflicted slots keep their newest version.
    pub fn erase_version_history(&mut self) -> Result<(), StoreError> {
        let now = now_ms();
        let mut local = self.author.clone();
        let usn = local.next_usn();
        local.usn = usn;
        local.timestamp = now;

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM tombstone", [])?;

        // Conflicting versions cannot all move to one author slot;
        // keep the newest per key (author id breaks timestamp ties).
        let losers: Vec<(i64, Option<String>)> = {
            let mut stmt = tx.prepare(
                "SELECT rowid, text FROM entry AS e WHERE EXISTS (
                   SELECT 1 FROM entry AS w
                   WHERE w.scope = e.scope AND w.key = e.key
                     AND (w.timestamp > e.timestamp
                          OR (w.timestamp = e.timestamp AND w.author_id > e.author_id)))",
            )?;
            let found = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            found.collect::<Result<Vec<_>, _>>()?
        };
        for (rowid, text) in losers {
            rows::delete_entry_by_rowid(&tx, rowid, text.as_deref())?;
        }

        tx.execute(
            "UPDATE entry SET author_id = ?1, usn = ?2",
            params![rows::author_blob(&local.id), usn],
        )?;
        tx.execute("DELETE FROM author", [])?;
        rows::upsert_author(&tx, &local)?;
        tx.commit()?;
        self.author = local;

        tracing::info!(author = %self.author.id, usn, "version history erased");
        // Every region was touched; hot observers re-emit, the cold
        // stream stays quiet (erase is not a write, bulk write, or
        // merge).
        self.notify_committed(&[], true)
    }

    /// Byte-for-byte copy of the store to `dest` via an atomic file
    /// replace. The copy keeps the source's author identity.
    pub fn backup_to(&self, dest: impl AsRef<Path>) -> Result<(), StoreError> {
        let dest = dest.as_ref();
        let mut tmp_name = dest.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut dst_conn = Connection::open(&tmp)?;
        {
            let backup = rusqlite::backup::Backup::new(&self.conn, &mut dst_conn)?;
            backup.run_to_completion(512, Duration::from_millis(0), None)?;
        }
        dst_conn.close().map_err(|(_, err)| StoreError::Sqlite(err))?;
        std::fs::rename(&tmp, dest).map_err(|source| StoreError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    // ----- notifications -----

    fn notify_committed(
        &mut self,
        changed: &[EntryKey],
        touch_all: bool,
    ) -> Result<(), StoreError> {
        if self.observers.is_empty() {
            return Ok(());
        }

        if !touch_all {
            for key in changed {
                let versions = rows::read_versions(&self.conn, key)?;
                self.observers.publish_delta(&ChangeEvent {
                    key: key.clone(),
                    versions,
                });
            }
        }

        let matched = self.observers.hot_matches(changed, touch_all);
        let mut dead = Vec::new();
        for (token, filter) in matched {
            let snapshot = query::bulk_read(&self.conn, &filter)?;
            if !self.observers.publish_snapshot(token, snapshot) {
                dead.push(token);
            }
        }
        self.observers.detach_hot(dead);
        Ok(())
    }
}
