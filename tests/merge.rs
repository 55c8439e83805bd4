//! Cross-replica reconciliation: merge, convergence, dominance,
//! erase-version-history.

mod fixtures;

use std::collections::BTreeMap;

use fixtures::ReplicaDir;
use oxbow::store::error::StoreError;
use oxbow::{AuthorId, EntryKey, Filter, Store, Value};

/// The observable state of a replica: per slot, the set of
/// `(author, value)` pairs.
fn observable(store: &Store) -> BTreeMap<EntryKey, Vec<(AuthorId, Value)>> {
    store
        .bulk_read(&Filter::default())
        .expect("bulk read")
        .into_iter()
        .map(|(key, versions)| {
            let mut pairs: Vec<(AuthorId, Value)> = versions
                .into_iter()
                .map(|v| (v.author, v.value))
                .collect();
            pairs.sort_by_key(|(author, _)| *author);
            (key, pairs)
        })
        .collect()
}

#[test]
fn concurrent_writes_surface_as_two_versions() {
    let dir = ReplicaDir::new();
    let mut a = dir.open("a");
    let mut b = dir.open("b");
    a.write_text(&"k".into(), "a").expect("write a");
    b.write_text(&"k".into(), "b").expect("write b");

    let changed = a.merge_from(dir.path("b")).expect("merge");
    assert_eq!(changed.len(), 1);

    let versions = a.read(&"k".into()).expect("read");
    assert_eq!(versions.len(), 2);
    let mut payloads: Vec<&str> = versions
        .iter()
        .filter_map(|v| match &v.value {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        })
        .collect();
    payloads.sort();
    assert_eq!(payloads, ["a", "b"]);
    // The conflict is an error only through single-value accessors.
    assert!(versions.text().is_err());
}

#[test]
fn overwrite_resolves_conflict_everywhere() {
    let dir = ReplicaDir::new();
    let mut a = dir.open("a");
    let mut b = dir.open("b");
    a.write_text(&"k".into(), "a").expect("write a");
    b.write_text(&"k".into(), "b").expect("write b");
    a.merge_from(dir.path("b")).expect("merge");

    a.write_text(&"k".into(), "resolved").expect("resolve");
    let versions = a.read(&"k".into()).expect("read");
    assert_eq!(versions.len(), 1);
    assert_eq!(versions.text().expect("resolved"), Some("resolved"));

    // Merging the resolution collapses the peer's conflict too.
    b.merge_from(dir.path("a")).expect("merge back");
    let versions = b.read(&"k".into()).expect("read");
    assert_eq!(versions.len(), 1);
    assert_eq!(versions.text().expect("resolved"), Some("resolved"));
}

#[test]
fn delete_vs_remote_write_keeps_both_outcomes() {
    let dir = ReplicaDir::new();
    let mut a = dir.open("a");
    let mut b = dir.open("b");

    a.write_text(&"k".into(), "v1").expect("write v1");
    b.merge_from(dir.path("a")).expect("b pulls v1");
    b.delete(&"k".into()).expect("b deletes");
    a.write_text(&"k".into(), "v2").expect("a rewrites");

    a.merge_from(dir.path("b")).expect("a pulls the delete");
    let versions = a.read(&"k".into()).expect("read");
    assert_eq!(versions.len(), 2);
    let mut kinds: Vec<bool> = versions.iter().map(|v| v.value.is_null()).collect();
    kinds.sort();
    assert_eq!(kinds, [false, true]);

    // The key stays listed while a live version remains.
    assert_eq!(a.keys(&Filter::default()).expect("keys").len(), 1);

    // Resolving by overwrite clears the null version.
    a.write_text(&"k".into(), "v3").expect("resolve");
    assert_eq!(a.read(&"k".into()).expect("read").len(), 1);
}

#[test]
fn bidirectional_merge_converges() {
    let dir = ReplicaDir::new();
    let mut a = dir.open("a");
    let mut b = dir.open("b");

    a.write_text(&"shared".into(), "from-a").expect("write");
    a.write_text(&("s", "only-a").into(), "1").expect("write");
    b.write_text(&"shared".into(), "from-b").expect("write");
    b.write_json(&("s", "only-b").into(), "[1, 2]").expect("write");
    b.delete(&("s", "only-b").into()).expect("delete");

    a.merge_from(dir.path("b")).expect("a <- b");
    b.merge_from(dir.path("a")).expect("b <- a");

    assert_eq!(observable(&a), observable(&b));
    assert_eq!(a.statistics().expect("stats"), b.statistics().expect("stats"));
}

#[test]
fn tombstones_flow_through_intermediary_replicas() {
    let dir = ReplicaDir::new();
    let mut a = dir.open("a");
    let mut b = dir.open("b");
    let mut c = dir.open("c");

    a.write_text(&"k".into(), "v1").expect("a writes");
    b.merge_from(dir.path("a")).expect("b pulls");
    b.delete(&"k".into()).expect("b deletes");

    // C never saw A's entry, only B's deletion and its tombstone.
    c.merge_from(dir.path("b")).expect("c pulls from b");
    assert!(c.read(&"k".into()).expect("read").is_deleted().expect("one version"));

    // A must learn through C that its entry was superseded.
    a.merge_from(dir.path("c")).expect("a pulls from c");
    assert!(a.read(&"k".into()).expect("read").is_deleted().expect("one version"));
    assert_eq!(observable(&a), observable(&c));
}

#[test]
fn replica_dominates_itself_and_merged_sources() {
    let dir = ReplicaDir::new();
    let mut a = dir.open("a");
    let mut b = dir.open("b");
    a.write_text(&"k".into(), "a").expect("write");
    b.write_text(&"k".into(), "b").expect("write");

    assert!(a.dominates(dir.path("a")).expect("self dominance"));
    assert!(!a.dominates(dir.path("b")).expect("dominance"));

    a.merge_from(dir.path("b")).expect("merge");
    assert!(a.dominates(dir.path("b")).expect("dominance after merge"));
    assert!(!b.dominates(dir.path("a")).expect("b lags"));
}

#[test]
fn fast_forward_merge_equals_source_and_reverse_is_noop() {
    let dir = ReplicaDir::new();
    let mut a = dir.open("a");
    a.write_text(&"k".into(), "v1").expect("write");

    // Derive B from A by copying, then write on B only.
    let b_path = dir.path("b");
    a.backup_to(&b_path).expect("copy");
    let mut b = Store::open(&b_path, oxbow::OpenOptions::new().author_name("b")).expect("open b");
    b.write_text(&"k".into(), "v2").expect("write on b");

    let changed = a.merge_from(&b_path).expect("fast forward");
    assert_eq!(changed.len(), 1);
    assert_eq!(observable(&a), observable(&b));

    // The reverse direction carries nothing.
    let changed = b.merge_from(dir.path("a")).expect("reverse");
    assert!(changed.is_empty());
    assert_eq!(observable(&a), observable(&b));
}

#[test]
fn merge_is_idempotent() {
    let dir = ReplicaDir::new();
    let mut a = dir.open("a");
    let mut b = dir.open("b");
    a.write_text(&"k".into(), "a").expect("write");
    b.write_text(&"k".into(), "b").expect("write");
    b.delete(&"other".into()).expect("tombstoneless delete");

    let first = a.merge_from(dir.path("b")).expect("first merge");
    assert!(!first.is_empty());
    let before = observable(&a);
    let stats_before = a.statistics().expect("stats");

    let second = a.merge_from(dir.path("b")).expect("second merge");
    assert!(second.is_empty());
    assert_eq!(observable(&a), before);
    assert_eq!(a.statistics().expect("stats"), stats_before);
}

#[test]
fn dry_run_reports_changes_without_applying() {
    let dir = ReplicaDir::new();
    let mut a = dir.open("a");
    let mut b = dir.open("b");
    a.write_text(&"k".into(), "a").expect("write");
    b.write_text(&"k".into(), "b").expect("write");

    let planned = a.merge_dry_run(dir.path("b")).expect("dry run");
    assert_eq!(planned.len(), 1);
    // Nothing moved.
    assert_eq!(a.read(&"k".into()).expect("read").len(), 1);
    assert_eq!(a.statistics().expect("stats").authors, 1);

    let applied = a.merge_from(dir.path("b")).expect("real merge");
    assert_eq!(planned, applied);
}

#[test]
fn merge_emits_change_notifications() {
    let dir = ReplicaDir::new();
    let mut a = dir.open("a");
    let mut b = dir.open("b");
    a.write_text(&"k".into(), "a").expect("write");
    b.write_text(&"k".into(), "b").expect("write");

    let sub = a.change_observer();
    a.merge_from(dir.path("b")).expect("merge");
    let events = sub.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].key, "k".into());
    assert_eq!(events[0].versions.len(), 2);
}

#[test]
fn erase_version_history_collapses_to_single_author() {
    let dir = ReplicaDir::new();
    let mut a = dir.open("a");
    let mut b = dir.open("b");
    a.write_text(&"k".into(), "a").expect("write");
    a.write_text(&"keep".into(), "kept").expect("write");
    b.write_text(&"k".into(), "b").expect("write");
    a.merge_from(dir.path("b")).expect("merge");
    assert_eq!(a.read(&"k".into()).expect("read").len(), 2);

    a.erase_version_history().expect("erase");

    // Single author, no tombstones, values carried forward.
    let stats = a.statistics().expect("stats");
    assert_eq!(stats.authors, 1);
    assert_eq!(stats.tombstones, 0);
    assert!(stats.consistent);
    assert_eq!(
        a.read(&"keep".into()).expect("read").text().expect("single"),
        Some("kept")
    );
    // The conflicted slot keeps exactly one version.
    assert_eq!(a.read(&"k".into()).expect("read").len(), 1);

    let vector = a.version_vector().expect("vector");
    assert_eq!(vector.len(), 1);
    assert_eq!(vector.get(&a.author().id), a.author().usn);

    // Erase consumed one usn; the next write takes the one after.
    let erase_usn = a.author().usn;
    a.write_text(&"k".into(), "after").expect("write");
    assert_eq!(a.author().usn, erase_usn + 1);
}

#[test]
fn erase_under_fresh_session_starts_at_usn_one() {
    let dir = ReplicaDir::new();
    let path = dir.path("a");
    let mut first = Store::open(&path, oxbow::OpenOptions::new().author_name("first"))
        .expect("open");
    first.write_text(&"k".into(), "v").expect("write");
    first.close().expect("close");

    let mut second = Store::open(&path, oxbow::OpenOptions::new().author_name("second"))
        .expect("reopen");
    second.erase_version_history().expect("erase");
    assert_eq!(second.author().usn, 1);

    second.write_text(&"k2".into(), "w").expect("write");
    assert_eq!(second.author().usn, 2);
    assert_eq!(second.statistics().expect("stats").authors, 1);
}

#[test]
fn two_deleters_of_the_same_entry_both_record_tombstones() {
    let dir = ReplicaDir::new();
    let mut a = dir.open("a");
    let mut b = dir.open("b");
    let mut c = dir.open("c");

    a.write_text(&"k".into(), "v1").expect("a writes");
    b.merge_from(dir.path("a")).expect("b pulls");
    c.merge_from(dir.path("a")).expect("c pulls");

    // Both peers independently delete A's entry: two tombstones for
    // the same prior entry, different deleters.
    b.delete(&"k".into()).expect("b deletes");
    c.delete(&"k".into()).expect("c deletes");

    a.merge_from(dir.path("b")).expect("a <- b");
    a.merge_from(dir.path("c")).expect("a <- c");

    let versions = a.read(&"k".into()).expect("read");
    assert_eq!(versions.len(), 2);
    assert!(versions.iter().all(|v| v.value.is_null()));
    // Two concurrent deletions are still a conflict to single-value
    // accessors.
    assert!(versions.is_deleted().is_err());

    let stats = a.statistics().expect("stats");
    assert_eq!(stats.tombstones, 2);
    assert!(stats.consistent);

    // Overwriting resolves as usual.
    a.write_text(&"k".into(), "restored").expect("resolve");
    assert_eq!(a.read(&"k".into()).expect("read").len(), 1);
}

#[test]
fn three_replica_mesh_converges() {
    let dir = ReplicaDir::new();
    let mut a = dir.open("a");
    let mut b = dir.open("b");
    let mut c = dir.open("c");

    a.write_text(&"k".into(), "from-a").expect("write");
    b.write_text(&"k".into(), "from-b").expect("write");
    b.write_text(&("cfg", "lang").into(), "en").expect("write");
    c.delete(&"k".into()).expect("delete unseen key");
    c.write_json(&"doc".into(), r#"{"pages": 3}"#).expect("write");

    // Two rounds of full-mesh merges reach a fixed point.
    for _ in 0..2 {
        a.merge_from(dir.path("b")).expect("a <- b");
        a.merge_from(dir.path("c")).expect("a <- c");
        b.merge_from(dir.path("a")).expect("b <- a");
        b.merge_from(dir.path("c")).expect("b <- c");
        c.merge_from(dir.path("a")).expect("c <- a");
        c.merge_from(dir.path("b")).expect("c <- b");
    }

    assert_eq!(observable(&a), observable(&b));
    assert_eq!(observable(&b), observable(&c));
    // "k" carries one version per concurrent writer, including the
    // independent delete.
    assert_eq!(a.read(&"k".into()).expect("read").len(), 3);

    // Another merge round moves nothing.
    assert!(a.merge_from(dir.path("b")).expect("fixed point").is_empty());
    assert!(c.merge_from(dir.path("a")).expect("fixed point").is_empty());
}

#[test]
fn inconsistent_author_table_is_reported_and_blocks_merge() {
    let dir = ReplicaDir::new();
    let mut a = dir.open("a");
    a.write_text(&"k".into(), "v").expect("write");
    a.close().expect("close");

    // Corrupt the invariant: entries outrun their author record.
    let conn = rusqlite::Connection::open(dir.path("a")).expect("raw open");
    conn.execute("UPDATE entry SET usn = 99", []).expect("corrupt usn");
    conn.close().expect("raw close");

    let mut a = dir.open("a");
    assert!(!a.statistics().expect("stats").consistent);

    // The post-commit check surfaces the violation; the write itself
    // has already committed.
    let err = a.write_text(&"k2".into(), "w").unwrap_err();
    assert!(matches!(err, StoreError::AuthorTableInconsistency { .. }));
    assert_eq!(a.read(&"k2".into()).expect("read").len(), 1);

    // A merge refuses an inconsistent source up front.
    let mut b = dir.open("b");
    let err = b.merge_from(dir.path("a")).unwrap_err();
    assert!(matches!(err, StoreError::AuthorTableInconsistency { .. }));

    // An inconsistent destination is likewise refused before any data
    // moves.
    let err = a.merge_from(dir.path("b")).unwrap_err();
    assert!(matches!(err, StoreError::AuthorTableInconsistency { .. }));

    // Erase-version-history is the recovery path.
    a.erase_version_history().expect("recover");
    assert!(a.statistics().expect("stats").consistent);
}

#[test]
fn destination_inconsistency_after_merge_surfaces_post_commit() {
    let dir = ReplicaDir::new();
    let mut a = dir.open("a");
    let mut b = dir.open("b");
    a.write_text(&"k".into(), "a").expect("write");
    b.write_text(&"k".into(), "b").expect("write");
    a.close().expect("close");

    // Simulate a foreign writer corrupting the destination's author
    // table while the merge transaction is applying entries: the
    // up-front destination check still passes, only the post-commit
    // check can catch it.
    let conn = rusqlite::Connection::open(dir.path("a")).expect("raw open");
    conn.execute_batch(
        "CREATE TRIGGER corrupt_authors AFTER INSERT ON entry
         BEGIN UPDATE author SET usn = 0; END",
    )
    .expect("install trigger");
    conn.close().expect("raw close");

    let mut a = dir.open("a");
    let err = a.merge_from(dir.path("b")).unwrap_err();
    assert!(matches!(err, StoreError::AuthorTableInconsistency { .. }));

    // The merge itself has already committed: the pulled entry is
    // retained and statistics report the damage.
    let versions = a.read(&"k".into()).expect("read");
    assert_eq!(versions.len(), 2);
    assert!(!a.statistics().expect("stats").consistent);
}

#[test]
fn merge_after_erase_reestablishes_a_compatible_vector() {
    let dir = ReplicaDir::new();
    let mut a = dir.open("a");
    let mut b = dir.open("b");
    a.write_text(&"k".into(), "a").expect("write");
    b.merge_from(dir.path("a")).expect("b pulls");

    a.erase_version_history().expect("erase");
    a.write_text(&"k2".into(), "new").expect("write");

    // B still holds the old author in its vector; merging works and
    // picks up the rewritten state.
    b.merge_from(dir.path("a")).expect("merge after erase");
    let versions = b.read(&"k2".into()).expect("read");
    assert_eq!(versions.text().expect("single"), Some("new"));
}
