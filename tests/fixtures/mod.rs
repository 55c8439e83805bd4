//! Shared test fixtures: a temp directory of replica files.

#![allow(dead_code)]

use std::path::PathBuf;

use tempfile::TempDir;

use oxbow::store::error::StoreError;
use oxbow::{ApplicationCheck, ApplicationId, OpenOptions, Store};

pub struct ReplicaDir {
    dir: TempDir,
}

impl ReplicaDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("temp replica dir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(format!("{name}.oxbow"))
    }

    /// Open a replica with no application expectation; the session
    /// name doubles as the author-name hint.
    pub fn open(&self, name: &str) -> Store {
        Store::open(self.path(name), OpenOptions::new().author_name(name))
            .expect("open replica")
    }

    pub fn open_with_app(
        &self,
        name: &str,
        check: ApplicationCheck,
    ) -> Result<Store, StoreError> {
        Store::open(
            self.path(name),
            OpenOptions::new().author_name(name).application(check),
        )
    }
}

pub fn app(major: u32, minor: u32) -> ApplicationId {
    ApplicationId::new("com.example.notes", major, minor)
}
