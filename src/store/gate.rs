//! Application-version gate.
//!
//! Every open compares the caller's expected application identifier
//! against the one stamped into the file, and either opens, upgrades
//! then stamps, or refuses. Merge enforces the same gate against the
//! source file.

use std::fmt;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::store::error::StoreError;

/// The file format stamp: `(id, major, minor, description?)`.
///
/// `id` names the application; `(major, minor)` orders its data
/// formats. A larger stored major than expected is unreadable; a
/// smaller stored pair is upgradable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationId {
    pub id: String,
    pub major: u32,
    pub minor: u32,
    pub description: Option<String>,
}

impl ApplicationId {
    pub fn new(id: impl Into<String>, major: u32, minor: u32) -> Self {
        Self {
            id: id.into(),
            major,
            minor,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn version(&self) -> (u32, u32) {
        (self.major, self.minor)
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}.{}", self.id, self.major, self.minor)
    }
}

/// What the gate decided for an open.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum GateOutcome {
    /// Stored data is compatible as-is.
    Open,
    /// The upgrade hook must run, after which the file is stamped with
    /// the expected identifier. `stored` is `None` for unstamped files.
    Upgrade { stored: Option<ApplicationId> },
}

/// The at-most-one stored stamp.
pub(crate) fn read_stored(conn: &Connection) -> Result<Option<ApplicationId>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, major, minor, description FROM application_identifier",
            [],
            |row| {
                Ok(ApplicationId {
                    id: row.get(0)?,
                    major: row.get(1)?,
                    minor: row.get(2)?,
                    description: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub(crate) fn stamp(conn: &Connection, app: &ApplicationId) -> Result<(), StoreError> {
    conn.execute("DELETE FROM application_identifier", [])?;
    conn.execute(
        "INSERT INTO application_identifier (id, major, minor, description) \
         VALUES (?1, ?2, ?3, ?4)",
        params![app.id, app.major, app.minor, app.description],
    )?;
    Ok(())
}

/// The open-time gate table.
pub(crate) fn check_open(
    conn: &Connection,
    expected: &ApplicationId,
) -> Result<GateOutcome, StoreError> {
    let stored = read_stored(conn)?;
    let Some(stored) = stored else {
        return Ok(GateOutcome::Upgrade { stored: None });
    };

    if stored.id != expected.id {
        return Err(StoreError::IncompatibleApplications {
            stored: stored.id,
            expected: expected.id.clone(),
        });
    }
    if stored.major > expected.major {
        return Err(StoreError::ApplicationDataTooNew {
            stored,
            expected: expected.clone(),
        });
    }
    if stored.version() < expected.version() {
        tracing::debug!(%stored, %expected, "application data needs upgrade");
        return Ok(GateOutcome::Upgrade {
            stored: Some(stored),
        });
    }
    Ok(GateOutcome::Open)
}

/// The merge-time gate: the source must be readable under `expected`
/// as-is. Older sources are refused with a distinct error so the
/// caller can upgrade them first.
pub(crate) fn check_merge_source(
    stored: Option<&ApplicationId>,
    expected: &ApplicationId,
) -> Result<(), StoreError> {
    let Some(stored) = stored else {
        return Err(StoreError::MergeSourceRequiresUpgrade {
            stored: None,
            expected: expected.clone(),
        });
    };
    if stored.id != expected.id || stored.major > expected.major {
        return Err(StoreError::MergeSourceIncompatible {
            stored: Some(stored.clone()),
            expected: expected.clone(),
        });
    }
    if stored.version() < expected.version() {
        return Err(StoreError::MergeSourceRequiresUpgrade {
            stored: Some(stored.clone()),
            expected: expected.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema;

    fn migrated_conn() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        schema::migrate(&mut conn).expect("migrate");
        conn
    }

    fn app(id: &str, major: u32, minor: u32) -> ApplicationId {
        ApplicationId::new(id, major, minor)
    }

    #[test]
    fn stamp_replaces_the_single_row() {
        let conn = migrated_conn();
        assert_eq!(read_stored(&conn).expect("read"), None);

        stamp(&conn, &app("a", 1, 0)).expect("stamp");
        stamp(&conn, &app("a", 1, 2).with_description("second"))
            .expect("restamp");

        let stored = read_stored(&conn).expect("read").expect("stamped");
        assert_eq!((stored.major, stored.minor), (1, 2));
        assert_eq!(stored.description.as_deref(), Some("second"));
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM application_identifier", [], |r| {
                r.get(0)
            })
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn open_gate_decision_table() {
        let conn = migrated_conn();

        // Unstamped: upgrade with no stored identifier.
        assert_eq!(
            check_open(&conn, &app("a", 1, 0)).expect("gate"),
            GateOutcome::Upgrade { stored: None }
        );

        stamp(&conn, &app("a", 2, 1)).expect("stamp");

        // Equal or newer-compatible stored data opens as-is.
        assert_eq!(check_open(&conn, &app("a", 2, 1)).expect("gate"), GateOutcome::Open);
        assert_eq!(check_open(&conn, &app("a", 2, 0)).expect("gate"), GateOutcome::Open);

        // Older stored data upgrades.
        assert!(matches!(
            check_open(&conn, &app("a", 2, 5)).expect("gate"),
            GateOutcome::Upgrade { stored: Some(_) }
        ));
        assert!(matches!(
            check_open(&conn, &app("a", 3, 0)).expect("gate"),
            GateOutcome::Upgrade { stored: Some(_) }
        ));

        // Newer major or a foreign id refuses.
        assert!(matches!(
            check_open(&conn, &app("a", 1, 9)),
            Err(StoreError::ApplicationDataTooNew { .. })
        ));
        assert!(matches!(
            check_open(&conn, &app("b", 2, 1)),
            Err(StoreError::IncompatibleApplications { .. })
        ));
    }

    #[test]
    fn merge_gate_decision_table() {
        let expected = app("a", 2, 1);

        // Unstamped sources need an upgrade pass first.
        assert!(matches!(
            check_merge_source(None, &expected),
            Err(StoreError::MergeSourceRequiresUpgrade { stored: None, .. })
        ));

        assert!(check_merge_source(Some(&app("a", 2, 1)), &expected).is_ok());
        // Newer-but-compatible source data is readable.
        assert!(check_merge_source(Some(&app("a", 2, 3)), &expected).is_ok());

        assert!(matches!(
            check_merge_source(Some(&app("a", 2, 0)), &expected),
            Err(StoreError::MergeSourceRequiresUpgrade { .. })
        ));
        assert!(matches!(
            check_merge_source(Some(&app("a", 3, 0)), &expected),
            Err(StoreError::MergeSourceIncompatible { .. })
        ));
        assert!(matches!(
            check_merge_source(Some(&app("b", 2, 1)), &expected),
            Err(StoreError::MergeSourceIncompatible { .. })
        ));
    }
}
