//! Decoding and encoding of the persisted `users` blob.
//!
//! The canonical form is a JSON object keyed by normalized username, kept in
//! stored order. Older pages wrote a plain list of records instead; that form
//! is recognized here and upgraded, with keys re-derived from each record's
//! identity fields. Only an unreadable blob as a whole fails open; individual
//! records are never dropped.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::models::{Directory, UserRecord};

/// Lowercase, trimmed form of a username used as the directory key.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredDirectory {
    Mapping(Map<String, Value>),
    Legacy(Vec<Value>),
}

/// Outcome of reading the raw blob.
#[derive(Debug, PartialEq)]
pub enum Decoded {
    /// Already in mapping form.
    Canonical(Directory),
    /// Was a legacy list; must be written back in mapping form.
    Upgraded(Directory),
    /// Nothing usable was stored.
    Empty,
}

impl Decoded {
    pub fn into_directory(self) -> Directory {
        match self {
            Decoded::Canonical(dir) | Decoded::Upgraded(dir) => dir,
            Decoded::Empty => Directory::new(),
        }
    }
}

pub fn decode(raw: Option<&str>) -> Decoded {
    let Some(raw) = raw else {
        return Decoded::Empty;
    };

    match serde_json::from_str::<StoredDirectory>(raw) {
        Ok(StoredDirectory::Mapping(entries)) => decode_mapping(entries),
        Ok(StoredDirectory::Legacy(items)) => Decoded::Upgraded(upgrade_legacy(items)),
        Err(e) => {
            tracing::warn!(error = %e, "users blob is unreadable, treating directory as empty");
            Decoded::Empty
        }
    }
}

/// Every entry is kept, readable or not. Keys that are not in normalized
/// form are renamed when that does not collide with another account; the
/// directory is then reported as upgraded so the new keys get persisted.
fn decode_mapping(entries: Map<String, Value>) -> Decoded {
    let normalized_keys: HashSet<String> = entries
        .keys()
        .filter(|key| normalize_username(key) == **key)
        .cloned()
        .collect();

    let mut directory = Directory::new();
    let mut renamed = 0;
    for (key, value) in entries {
        let normalized = normalize_username(&key);
        let key = if normalized != key
            && !normalized.is_empty()
            && !normalized_keys.contains(&normalized)
            && !directory.contains_key(&normalized)
        {
            tracing::info!(from = %key, to = %normalized, "normalizing user key");
            renamed += 1;
            normalized
        } else {
            if normalized != key {
                tracing::warn!(%key, "user key is not normalized and collides, keeping as is");
            }
            key
        };
        directory.insert(key, UserRecord::from_json(value));
    }

    if renamed > 0 {
        Decoded::Upgraded(directory)
    } else {
        Decoded::Canonical(directory)
    }
}

fn upgrade_legacy(items: Vec<Value>) -> Directory {
    let mut directory = Directory::new();
    for (index, item) in items.into_iter().enumerate() {
        if !item.is_object() {
            tracing::warn!(index, "skipping legacy user entry that is not an object");
            continue;
        }
        let key = legacy_key(&item, index);
        directory.insert(key, UserRecord::from_json(item));
    }
    tracing::info!(users = directory.len(), "upgraded legacy user list to mapping form");
    directory
}

/// First non-blank of `username`, `displayName`, `name`, else `user{index}`.
fn legacy_key(item: &Value, index: usize) -> String {
    ["username", "displayName", "name"]
        .iter()
        .filter_map(|field| item.get(*field))
        .filter_map(|value| match value {
            Value::String(s) => Some(normalize_username(s)),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .find(|key| !key.is_empty())
        .unwrap_or_else(|| format!("user{index}"))
}

pub fn encode(directory: &Directory) -> serde_json::Result<String> {
    serde_json::to_string(directory)
}
