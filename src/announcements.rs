use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::Announcement;
use crate::models::announcement::default_priority;
use crate::storage::{KeyValueStore, StorageError, keys};

#[derive(Error, Debug)]
pub enum AnnouncementError {
    #[error("Title and message are required")]
    InvalidInput,

    #[error("Announcement {0} not found")]
    NotFound(i64),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AnnouncementError>;

/// Fields an admin supplies when publishing or editing.
#[derive(Debug, Clone)]
pub struct Draft {
    pub title: String,
    pub message: String,
    pub priority: Option<String>,
}

impl Draft {
    fn validated(&self) -> Result<(String, String, String)> {
        let title = self.title.trim();
        let message = self.message.trim();
        if title.is_empty() || message.is_empty() {
            return Err(AnnouncementError::InvalidInput);
        }
        let priority = self
            .priority
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_lowercase)
            .unwrap_or_else(default_priority);
        Ok((title.to_string(), message.to_string(), priority))
    }
}

/// Announcements stored as a list under `announcements`.
pub struct AnnouncementBoard {
    kv: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
}

impl AnnouncementBoard {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            write_lock: Mutex::new(()),
        }
    }

    /// Newest first.
    pub async fn list(&self) -> Vec<Announcement> {
        let mut items = self.load().await;
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        items
    }

    pub async fn publish(&self, draft: &Draft, author: &str) -> Result<Announcement> {
        let (title, message, priority) = draft.validated()?;

        let _guard = self.write_lock.lock().await;
        let mut items = self.load().await;
        let announcement = Announcement {
            title,
            message,
            priority,
            author: Some(author.to_string()),
            timestamp: next_timestamp(&items),
        };
        items.push(announcement.clone());
        self.save(&items).await?;

        tracing::info!(timestamp = announcement.timestamp, author, "announcement published");
        Ok(announcement)
    }

    /// Replace the content of an announcement. The edit moves it to the top
    /// by giving it a fresh timestamp.
    pub async fn edit(&self, timestamp: i64, draft: &Draft, author: &str) -> Result<Announcement> {
        let (title, message, priority) = draft.validated()?;

        let _guard = self.write_lock.lock().await;
        let mut items = self.load().await;
        let fresh = next_timestamp(&items);
        let item = items
            .iter_mut()
            .find(|a| a.timestamp == timestamp)
            .ok_or(AnnouncementError::NotFound(timestamp))?;

        item.title = title;
        item.message = message;
        item.priority = priority;
        item.author = Some(author.to_string());
        item.timestamp = fresh;
        let updated = item.clone();

        self.save(&items).await?;
        tracing::info!(from = timestamp, to = fresh, "announcement edited");
        Ok(updated)
    }

    pub async fn delete(&self, timestamp: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut items = self.load().await;
        let before = items.len();
        items.retain(|a| a.timestamp != timestamp);
        if items.len() == before {
            return Err(AnnouncementError::NotFound(timestamp));
        }

        self.save(&items).await?;
        tracing::info!(timestamp, "announcement deleted");
        Ok(())
    }

    async fn load(&self) -> Vec<Announcement> {
        let raw = match self.kv.get(keys::ANNOUNCEMENTS).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read announcements");
                return Vec::new();
            }
        };

        serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "announcements are unreadable, treating as empty");
            Vec::new()
        })
    }

    async fn save(&self, items: &[Announcement]) -> Result<()> {
        let encoded = serde_json::to_string(items)?;
        self.kv.set(keys::ANNOUNCEMENTS, &encoded).await?;
        Ok(())
    }
}

/// Current time in milliseconds, bumped past every existing timestamp so
/// identities stay unique.
fn next_timestamp(items: &[Announcement]) -> i64 {
    let now = Utc::now().timestamp_millis();
    let latest = items.iter().map(|a| a.timestamp).max().unwrap_or(i64::MIN);
    now.max(latest.saturating_add(1))
}
