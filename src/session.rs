//! The current-user marker and the session context derived from it.
//!
//! The marker is the display name stored under `currentUser`, which the pages
//! read for their greeting, plus the account key under `currentUsername`.
//! Handlers never read either directly; they receive a [`SessionContext`]
//! that has already been resolved against the user directory.

use std::sync::Arc;

use serde::Serialize;

use crate::models::{Directory, Role, Status};
use crate::storage::{KeyValueStore, Result, keys};

/// Identity of the logged-in user, as seen by a single request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub display_name: String,
    pub username: String,
    pub role: Role,
    pub status: Status,
}

impl SessionContext {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin && self.status == Status::Active
    }
}

/// What the session keys hold: the display name pages greet with, and the
/// account key written next to it at login. Markers set by older pages carry
/// no key.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub display_name: String,
    pub username: Option<String>,
}

pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// The current marker, if anyone is logged in. Unreadable storage counts
    /// as logged out.
    pub async fn current(&self) -> Option<Marker> {
        let display_name = self.read(keys::CURRENT_USER).await?;
        let username = self.read(keys::CURRENT_USERNAME).await;
        Some(Marker {
            display_name,
            username,
        })
    }

    pub async fn begin(&self, display_name: &str, username: &str) -> Result<()> {
        self.write(keys::CURRENT_USER, display_name).await?;
        self.write(keys::CURRENT_USERNAME, username).await?;
        tracing::info!(user = display_name, username, "session started");
        Ok(())
    }

    pub async fn end(&self) -> Result<()> {
        self.kv.remove(keys::CURRENT_USER).await?;
        self.kv.remove(keys::CURRENT_USERNAME).await?;
        tracing::info!("session ended");
        Ok(())
    }

    async fn read(&self, key: &str) -> Option<String> {
        let raw = match self.kv.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to read session marker");
                return None;
            }
        };

        // Pages used to store the bare name without JSON quoting.
        let value = serde_json::from_str::<String>(&raw).unwrap_or(raw);
        if value.trim().is_empty() { None } else { Some(value) }
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        let encoded = serde_json::Value::String(value.to_string()).to_string();
        self.kv.set(key, &encoded).await
    }
}

/// Find the account behind a marker.
///
/// The key written at login wins while that account still goes by the marked
/// name. Otherwise the name must belong to exactly one account: display
/// names are not unique, and a marker shared by several accounts resolves to
/// none of them.
pub fn resolve(marker: &Marker, directory: &Directory) -> Option<SessionContext> {
    let pinned = marker
        .username
        .as_deref()
        .and_then(|key| directory.get_key_value(key))
        .filter(|(key, user)| user.label(key) == marker.display_name);

    let (username, user) = match pinned {
        Some(entry) => entry,
        None => {
            let mut named = directory
                .iter()
                .filter(|(key, user)| user.label(key) == marker.display_name);
            match (named.next(), named.next()) {
                (Some(entry), None) => entry,
                (Some(_), Some(_)) => {
                    tracing::warn!(
                        user = %marker.display_name,
                        "session marker names several accounts"
                    );
                    return None;
                }
                (None, _) => return None,
            }
        }
    };

    Some(SessionContext {
        display_name: marker.display_name.clone(),
        username: username.clone(),
        role: user.role,
        status: user.status,
    })
}
