//! Command handlers and rendering.
//!
//! Every handler has a human rendering and a `--json` rendering for
//! scripting; both read the same core results.

use std::collections::BTreeSet;
use std::path::Path;

use serde_json::json;

use crate::Result;
use crate::core::{EntryKey, Value, Version};
use crate::store::query::Filter;
use crate::store::{OpenOptions, Store};

const CLI_AUTHOR: &str = "oxbow-cli";

fn open(path: &Path) -> Result<Store> {
    // Tooling mode: no application expectation, the gate is skipped
    // and the file is never stamped.
    Ok(Store::open(
        path,
        OpenOptions::new().author_name(CLI_AUTHOR),
    )?)
}

fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

fn key_list_json(keys: impl IntoIterator<Item = EntryKey>) -> serde_json::Value {
    json!(
        keys.into_iter()
            .map(|k| json!({"scope": k.scope.as_str(), "key": k.key.as_str()}))
            .collect::<Vec<_>>()
    )
}

pub fn stats(file: &Path, json_out: bool) -> Result<()> {
    let store = open(file)?;
    let stats = store.statistics()?;
    if json_out {
        print_json(&json!({
            "entries": stats.entries,
            "authors": stats.authors,
            "tombstones": stats.tombstones,
            "consistent": stats.consistent,
        }));
        return Ok(());
    }
    println!("entries:    {}", stats.entries);
    println!("authors:    {}", stats.authors);
    println!("tombstones: {}", stats.tombstones);
    if !stats.consistent {
        println!(
            "WARNING: author table is inconsistent; run erase-version-history to recover"
        );
    }
    Ok(())
}

pub fn list(
    file: &Path,
    scope: Option<String>,
    key: Option<String>,
    json_out: bool,
) -> Result<()> {
    let store = open(file)?;
    let mut filter = Filter::default();
    if let Some(scope) = scope {
        filter = filter.in_scope(scope);
    }
    if let Some(key) = key {
        filter = filter.with_key(key);
    }
    let keys = store.keys(&filter)?;

    if json_out {
        print_json(&key_list_json(keys));
        return Ok(());
    }

    let scope_width = keys
        .iter()
        .map(|k| k.scope.as_str().len())
        .chain(["SCOPE".len()])
        .max()
        .unwrap_or(0);
    println!("{:<scope_width$}  {}", "SCOPE", "KEY");
    for entry_key in &keys {
        println!(
            "{:<scope_width$}  {}",
            entry_key.scope.as_str(),
            entry_key.key.as_str()
        );
    }
    Ok(())
}

fn version_json(version: &Version) -> serde_json::Value {
    let (kind, value) = match &version.value {
        Value::Null => ("null", serde_json::Value::Null),
        Value::Text(text) => ("text", json!(text)),
        Value::Json(raw) => (
            "json",
            serde_json::from_str(raw).unwrap_or_else(|_| json!(raw)),
        ),
        Value::Blob { mime, bytes } => ("blob", json!({"mime": mime, "bytes": bytes.len()})),
    };
    json!({
        "author": version.author.to_string(),
        "timestamp": version.timestamp,
        "type": kind,
        "value": value,
    })
}

fn render_version(version: &Version) {
    println!("author: {}  timestamp: {}", version.author, version.timestamp);
    match &version.value {
        Value::Null => println!("DELETED"),
        Value::Text(text) => println!("{text}"),
        Value::Json(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(parsed) => println!(
                "{}",
                serde_json::to_string_pretty(&parsed).unwrap_or_else(|_| raw.clone())
            ),
            Err(_) => println!("{raw}"),
        },
        Value::Blob { mime, bytes } => println!("{mime} ({} bytes)", bytes.len()),
    }
}

pub fn get(file: &Path, key: &str, scope: Option<String>, json_out: bool) -> Result<()> {
    let store = open(file)?;
    let entry_key = EntryKey::new(scope.unwrap_or_default(), key);
    let versions = store.read(&entry_key)?;

    if json_out {
        print_json(&json!(versions.iter().map(version_json).collect::<Vec<_>>()));
        return Ok(());
    }

    if versions.is_empty() {
        println!("(not found)");
        return Ok(());
    }
    for (i, version) in versions.iter().enumerate() {
        if i > 0 {
            println!();
        }
        render_version(version);
    }
    Ok(())
}

pub fn search(file: &Path, needle: &str, json_out: bool) -> Result<()> {
    let store = open(file)?;
    let keys = store.search_text(needle)?;
    if json_out {
        print_json(&key_list_json(keys));
        return Ok(());
    }
    for key in &keys {
        println!("{}\t{}", key.scope.as_str(), key.key.as_str());
    }
    Ok(())
}

pub fn erase_version_history(file: &Path, json_out: bool) -> Result<()> {
    let mut store = open(file)?;
    store.erase_version_history()?;
    if json_out {
        print_json(&json!({"ok": true}));
    } else {
        println!("Success");
    }
    Ok(())
}

pub fn merge(source: &Path, dest: &Path, dry_run: bool, json_out: bool) -> Result<()> {
    let changed: BTreeSet<EntryKey> = if dry_run {
        let store = open(dest)?;
        store.merge_dry_run(source)?
    } else {
        let mut store = open(dest)?;
        store.merge_from(source)?
    };

    if json_out {
        print_json(&json!({
            "dry_run": dry_run,
            "changed": key_list_json(changed),
        }));
        return Ok(());
    }
    for key in &changed {
        println!("{}\t{}", key.scope.as_str(), key.key.as_str());
    }
    Ok(())
}

pub fn backup(file: &Path, dest: &Path, json_out: bool) -> Result<()> {
    let store = open(file)?;
    store.backup_to(dest)?;
    if json_out {
        print_json(&json!({"ok": true}));
    }
    Ok(())
}
