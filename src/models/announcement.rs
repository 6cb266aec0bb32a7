use serde::{Deserialize, Serialize};

/// A notice published on the announcements page. `timestamp` is milliseconds
/// since the Unix epoch and identifies the announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub title: String,
    pub message: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub author: Option<String>,
    pub timestamp: i64,
}

pub fn default_priority() -> String {
    "normal".to_string()
}
