use std::fmt;
use std::ops::Index;
use std::str::FromStr;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};

/// How recently a login must have happened for a user to count as online.
pub const ONLINE_WINDOW_MINUTES: i64 = 5;

/// User role as stored by the front-end pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Moderator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "moderator" => Ok(Role::Moderator),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Account standing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Active,
    Suspended,
    Banned,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Suspended => "suspended",
            Status::Banned => "banned",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Status::Active),
            "suspended" => Ok(Status::Suspended),
            "banned" => Ok(Status::Banned),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// Persisted user record.
///
/// Fields are read leniently: anything missing or malformed falls back to
/// its default rather than rejecting the record, so accounts written by older
/// pages (no `role`, a `joinDate` of "January 2025") still load. The stored
/// JSON is kept next to the parsed fields and only fields whose value changed
/// are written back; everything else, unknown fields included, keeps its
/// exact stored form.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserRecord {
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub password: String,
    pub role: Role,
    pub status: Status,
    pub suspended_until: Option<DateTime<Utc>>,
    pub join_date: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
    stored: Value,
}

impl UserRecord {
    /// A fresh account, laid out the way the registration page writes it.
    pub fn new(
        display_name: String,
        email: String,
        password: String,
        role: Role,
        now: DateTime<Utc>,
    ) -> Self {
        Self::from_json(json!({
            "displayName": display_name,
            "email": email,
            "password": password,
            "role": role.as_str(),
            "status": Status::Active.as_str(),
            "joinDate": format_timestamp(now),
            "lastLogin": null,
        }))
    }

    /// Parse a stored record. Never fails.
    pub fn from_json(stored: Value) -> Self {
        let fields = stored.as_object();
        let text = |name: &str| {
            fields
                .and_then(|f| f.get(name))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let time = |name: &str| {
            fields
                .and_then(|f| f.get(name))
                .and_then(Value::as_str)
                .and_then(parse_timestamp)
        };
        let role = fields
            .and_then(|f| f.get("role"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let status = fields
            .and_then(|f| f.get("status"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        Self {
            username: text("username"),
            display_name: text("displayName"),
            email: text("email"),
            password: text("password"),
            role,
            status,
            suspended_until: time("suspendedUntil"),
            join_date: time("joinDate"),
            last_login: time("lastLogin"),
            stored,
        }
    }

    /// The record as it should be persisted: the stored JSON with every
    /// changed field patched in.
    pub fn to_json(&self) -> Value {
        let before = Self::from_json(self.stored.clone());
        if self.same_fields(&before) {
            return self.stored.clone();
        }

        let mut fields = self.stored.as_object().cloned().unwrap_or_default();
        let text = |value: &String| Some(Value::from(value.as_str()));
        patch(&mut fields, "username", &self.username, &before.username, |name| {
            (!name.is_empty()).then(|| Value::from(name.as_str()))
        });
        patch(&mut fields, "displayName", &self.display_name, &before.display_name, text);
        patch(&mut fields, "email", &self.email, &before.email, text);
        patch(&mut fields, "password", &self.password, &before.password, text);
        patch(&mut fields, "role", &self.role, &before.role, |role| {
            Some(Value::from(role.as_str()))
        });
        patch(&mut fields, "status", &self.status, &before.status, |status| {
            Some(Value::from(status.as_str()))
        });
        // A lifted suspension drops the field; cleared dates are stored as null.
        patch(
            &mut fields,
            "suspendedUntil",
            &self.suspended_until,
            &before.suspended_until,
            |at| (*at).map(|at| Value::from(format_timestamp(at))),
        );
        for (name, current, stored) in [
            ("joinDate", &self.join_date, &before.join_date),
            ("lastLogin", &self.last_login, &before.last_login),
        ] {
            patch(&mut fields, name, current, stored, |at| {
                Some((*at).map_or(Value::Null, |at| Value::from(format_timestamp(at))))
            });
        }

        Value::Object(fields)
    }

    fn same_fields(&self, other: &Self) -> bool {
        self.username == other.username
            && self.display_name == other.display_name
            && self.email == other.email
            && self.password == other.password
            && self.role == other.role
            && self.status == other.status
            && self.suspended_until == other.suspended_until
            && self.join_date == other.join_date
            && self.last_login == other.last_login
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// An admin who can currently sign in.
    pub fn is_active_admin(&self) -> bool {
        self.is_admin() && self.status == Status::Active
    }

    /// Name shown in greetings and stored in the session marker.
    pub fn label<'a>(&'a self, key: &'a str) -> &'a str {
        if self.display_name.is_empty() {
            key
        } else {
            &self.display_name
        }
    }

    /// Flip an elapsed suspension back to `active`. Returns true when the
    /// record changed.
    pub fn normalize_expired(&mut self, now: DateTime<Utc>) -> bool {
        match (self.status, self.suspended_until) {
            (Status::Suspended, Some(until)) if until <= now => {
                self.status = Status::Active;
                self.suspended_until = None;
                true
            }
            _ => false,
        }
    }

    pub fn suspension_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        match (self.status, self.suspended_until) {
            (Status::Suspended, Some(until)) if until > now => Some(until - now),
            _ => None,
        }
    }

    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        self.last_login
            .is_some_and(|at| now - at < Duration::minutes(ONLINE_WINDOW_MINUTES))
    }
}

fn patch<T: PartialEq>(
    fields: &mut Map<String, Value>,
    name: &str,
    current: &T,
    stored: &T,
    encode: impl FnOnce(&T) -> Option<Value>,
) {
    if current == stored {
        return;
    }
    match encode(current) {
        Some(value) => {
            fields.insert(name.to_string(), value);
        }
        None => fields.retain(|key, _| key != name),
    }
}

/// ISO-8601 with milliseconds, as `Date.toISOString()` writes it.
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

impl Serialize for UserRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for UserRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_json)
    }
}

/// The user directory: username -> record, in stored order.
///
/// Order matters because a directory that is loaded and saved unchanged must
/// produce the same bytes. Lookups scan linearly.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Directory {
    entries: Vec<(String, UserRecord)>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn get(&self, key: &str) -> Option<&UserRecord> {
        self.get_key_value(key).map(|(_, record)| record)
    }

    pub fn get_key_value(&self, key: &str) -> Option<(&String, &UserRecord)> {
        self.position(key).map(|i| (&self.entries[i].0, &self.entries[i].1))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut UserRecord> {
        let i = self.position(key)?;
        Some(&mut self.entries[i].1)
    }

    /// Replace in place, or append a new key at the end.
    pub fn insert(&mut self, key: String, record: UserRecord) -> Option<UserRecord> {
        match self.position(&key) {
            Some(i) => Some(std::mem::replace(&mut self.entries[i].1, record)),
            None => {
                self.entries.push((key, record));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<UserRecord> {
        let i = self.position(key)?;
        Some(self.entries.remove(i).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &UserRecord)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &UserRecord> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut UserRecord> {
        self.entries.iter_mut().map(|(_, v)| v)
    }
}

impl IntoIterator for Directory {
    type Item = (String, UserRecord);
    type IntoIter = std::vec::IntoIter<(String, UserRecord)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(String, UserRecord)> for Directory {
    fn from_iter<I: IntoIterator<Item = (String, UserRecord)>>(iter: I) -> Self {
        let mut directory = Directory::new();
        for (key, record) in iter {
            directory.insert(key, record);
        }
        directory
    }
}

impl Index<&str> for Directory {
    type Output = UserRecord;

    fn index(&self, key: &str) -> &UserRecord {
        match self.get(key) {
            Some(record) => record,
            None => panic!("no user '{key}' in directory"),
        }
    }
}

impl Serialize for Directory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

/// JSON representation of a user for API responses. Never carries the password.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDto {
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub role: Role,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended_until: Option<DateTime<Utc>>,
    pub join_date: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
}

impl UserDto {
    pub fn from_entry(key: &str, user: &UserRecord) -> Self {
        Self {
            username: key.to_string(),
            display_name: user.display_name.clone(),
            email: user.email.clone(),
            role: user.role,
            status: user.status,
            suspended_until: user.suspended_until,
            join_date: user.join_date,
            last_login: user.last_login,
        }
    }
}

impl From<(String, UserRecord)> for UserDto {
    fn from((key, user): (String, UserRecord)) -> Self {
        Self::from_entry(&key, &user)
    }
}

/// Admin "view" of a single account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDetail {
    #[serde(flatten)]
    pub user: UserDto,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspension_remaining_secs: Option<i64>,
}
