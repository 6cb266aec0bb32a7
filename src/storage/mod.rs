//! Key-value persistence for JSON-encoded blobs.
//!
//! Every page of the platform keeps its state under a well-known key (see
//! [`keys`]). Components take an `Arc<dyn KeyValueStore>` so the backend can
//! be SQLite in production and memory in tests.

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryKeyValueStore;
pub use sqlite::SqliteKeyValueStore;

/// Storage keys shared with the front-end pages.
pub mod keys {
    pub const USERS: &str = "users";
    pub const CURRENT_USER: &str = "currentUser";
    pub const CURRENT_USERNAME: &str = "currentUsername";
    pub const ANNOUNCEMENTS: &str = "announcements";
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Raw text stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace the value under `key`.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}
