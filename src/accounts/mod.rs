//! The account store: sole owner of the persisted user directory.
//!
//! Every operation loads the directory, applies one change and writes the
//! whole mapping back before returning. A single async mutex serializes these
//! load-modify-save sequences across concurrent requests.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};

use crate::models::{Directory, Role, Status, UserDetail, UserDto, UserRecord};
use crate::storage::{KeyValueStore, StorageError, keys};

pub mod clock;
pub mod directory;

pub use clock::{Clock, SystemClock};
pub use directory::normalize_username;

use directory::Decoded;

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Username '{0}' already exists")]
    AlreadyExists(String),

    #[error("User '{0}' not found")]
    NotFound(String),

    #[error("Invalid username or password")]
    WrongPassword,

    #[error("Your account is banned")]
    Banned,

    #[error("Your account is suspended")]
    Suspended,

    #[error("Cannot remove the last admin")]
    LastAdminViolation,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for AccountError {
    fn from(err: StorageError) -> Self {
        AccountError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AccountError {
    fn from(err: serde_json::Error) -> Self {
        AccountError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AccountError>;

/// Published after every write of the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryChanged {
    pub user_count: usize,
}

/// Input for creating an account.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub email: String,
    pub display_name: String,
    pub role: Role,
}

/// Optional filters for [`AccountStore::list_filtered`].
#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    pub query: String,
    pub role: Option<Role>,
    pub status: Option<Status>,
}

pub struct AccountStore {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
    events: broadcast::Sender<DirectoryChanged>,
}

impl AccountStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_clock(kv, Arc::new(SystemClock))
    }

    pub fn with_clock(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            kv,
            clock,
            write_lock: Mutex::new(()),
            events,
        }
    }

    /// Receive a notification after each directory write.
    pub fn subscribe(&self) -> broadcast::Receiver<DirectoryChanged> {
        self.events.subscribe()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Read the directory. Never fails: unreadable data yields an empty
    /// directory, and a legacy list is upgraded and written back.
    pub async fn load(&self) -> Directory {
        let _guard = self.write_lock.lock().await;
        self.load_locked().await
    }

    /// Replace the persisted directory wholesale.
    pub async fn save(&self, directory: &Directory) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.save_locked(directory).await
    }

    async fn load_locked(&self) -> Directory {
        let raw = match self.kv.get(keys::USERS).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read users, treating directory as empty");
                None
            }
        };

        match directory::decode(raw.as_deref()) {
            Decoded::Upgraded(dir) => {
                if let Err(e) = self.save_locked(&dir).await {
                    tracing::warn!(error = %e, "failed to persist upgraded user directory");
                }
                dir
            }
            decoded => decoded.into_directory(),
        }
    }

    async fn save_locked(&self, directory: &Directory) -> Result<()> {
        let encoded = directory::encode(directory)?;
        self.kv.set(keys::USERS, &encoded).await?;

        // No receivers is fine; nobody is watching.
        let _ = self.events.send(DirectoryChanged {
            user_count: directory.len(),
        });
        Ok(())
    }

    /// Self-service registration. Always creates a plain `user`.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: &str,
        display_name: &str,
    ) -> Result<()> {
        self.create_user(NewUser {
            username: username.to_string(),
            password: password.to_string(),
            email: email.to_string(),
            display_name: display_name.to_string(),
            role: Role::User,
        })
        .await
    }

    /// Create an account with a chosen role (admin console).
    pub async fn create_user(&self, new_user: NewUser) -> Result<()> {
        let key = normalize_username(&new_user.username);
        if key.is_empty() || new_user.password.trim().is_empty() {
            return Err(AccountError::InvalidInput(
                "Username and password required".into(),
            ));
        }

        let display_name = match new_user.display_name.trim() {
            "" => new_user.username.trim().to_string(),
            name => name.to_string(),
        };

        let _guard = self.write_lock.lock().await;
        let mut dir = self.load_locked().await;
        if dir.contains_key(&key) {
            return Err(AccountError::AlreadyExists(key));
        }

        let record = UserRecord::new(
            display_name,
            new_user.email.trim().to_string(),
            new_user.password,
            new_user.role,
            self.now(),
        );
        dir.insert(key.clone(), record);
        self.save_locked(&dir).await?;

        tracing::info!(username = %key, role = %new_user.role, "user created");
        Ok(())
    }

    /// Check credentials. Status is only consulted after the password
    /// matches, and an elapsed suspension still counts as suspended here.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<UserRecord> {
        let key = normalize_username(username);
        if key.is_empty() || password.is_empty() {
            return Err(AccountError::InvalidInput(
                "Please enter username and password".into(),
            ));
        }

        let dir = self.load().await;
        let record = dir
            .get(&key)
            .ok_or_else(|| AccountError::NotFound(key.clone()))?;

        if record.password != password {
            return Err(AccountError::WrongPassword);
        }

        match record.status {
            Status::Banned => Err(AccountError::Banned),
            Status::Suspended => Err(AccountError::Suspended),
            Status::Active => Ok(record.clone()),
        }
    }

    /// Stamp `lastLogin` after a successful [`authenticate`](Self::authenticate).
    pub async fn record_login(&self, username: &str) -> Result<UserRecord> {
        let now = self.now();
        self.update(username, |record| {
            record.last_login = Some(now);
            Ok(())
        })
        .await
    }

    pub async fn set_role(&self, username: &str, role: Role) -> Result<()> {
        let key = normalize_username(username);
        let _guard = self.write_lock.lock().await;
        let mut dir = self.load_locked().await;

        let mut updated = dir
            .get(&key)
            .cloned()
            .ok_or_else(|| AccountError::NotFound(key.clone()))?;
        updated.role = role;
        ensure_admins_remain(&dir, &key, Some(&updated))?;

        dir.insert(key.clone(), updated);
        self.save_locked(&dir).await?;
        tracing::info!(username = %key, %role, "role updated");
        Ok(())
    }

    /// Change account standing. Suspensions need a positive duration in
    /// minutes; any other status clears the suspension deadline. The last
    /// active admin cannot be suspended or banned.
    pub async fn set_status(
        &self,
        username: &str,
        status: Status,
        suspension_minutes: Option<u32>,
    ) -> Result<()> {
        let suspended_until = match status {
            Status::Suspended => match suspension_minutes {
                Some(minutes) if minutes > 0 => {
                    Some(self.now() + Duration::minutes(i64::from(minutes)))
                }
                _ => {
                    return Err(AccountError::InvalidInput(
                        "Suspension requires a duration in minutes".into(),
                    ));
                }
            },
            Status::Active | Status::Banned => None,
        };

        let key = normalize_username(username);
        let _guard = self.write_lock.lock().await;
        let mut dir = self.load_locked().await;

        let mut updated = dir
            .get(&key)
            .cloned()
            .ok_or_else(|| AccountError::NotFound(key.clone()))?;
        updated.status = status;
        updated.suspended_until = suspended_until;
        ensure_admins_remain(&dir, &key, Some(&updated))?;

        dir.insert(key.clone(), updated);
        self.save_locked(&dir).await?;
        tracing::info!(username = %key, %status, ?suspended_until, "status updated");
        Ok(())
    }

    pub async fn reset_password(&self, username: &str, new_password: &str) -> Result<()> {
        if new_password.is_empty() {
            return Err(AccountError::InvalidInput("Password required".into()));
        }

        self.update(username, |record| {
            record.password = new_password.to_string();
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn delete_user(&self, username: &str) -> Result<()> {
        let key = normalize_username(username);
        let _guard = self.write_lock.lock().await;
        let mut dir = self.load_locked().await;

        if !dir.contains_key(&key) {
            return Err(AccountError::NotFound(key));
        }
        ensure_admins_remain(&dir, &key, None)?;

        dir.remove(&key);
        self.save_locked(&dir).await?;
        tracing::info!(username = %key, "user deleted");
        Ok(())
    }

    /// Directory listing for display, ordered by key. Elapsed suspensions are
    /// normalized (and persisted) before filtering.
    pub async fn list_filtered(&self, filter: &UserFilter) -> Result<Vec<(String, UserRecord)>> {
        let dir = self.load_for_display().await?;
        let query = filter.query.trim().to_lowercase();

        let mut users: Vec<(String, UserRecord)> = dir
            .into_iter()
            .filter(|(key, user)| {
                query.is_empty()
                    || format!("{} {} {}", key, user.display_name, user.email)
                        .to_lowercase()
                        .contains(&query)
            })
            .filter(|(_, user)| filter.role.is_none_or(|role| user.role == role))
            .filter(|(_, user)| filter.status.is_none_or(|status| user.status == status))
            .collect();
        users.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(users)
    }

    /// Single-account view with presence and remaining suspension.
    pub async fn view_user(&self, username: &str) -> Result<UserDetail> {
        let key = normalize_username(username);
        let dir = self.load_for_display().await?;
        let record = dir
            .get(&key)
            .ok_or_else(|| AccountError::NotFound(key.clone()))?;

        let now = self.now();
        Ok(UserDetail {
            user: UserDto::from_entry(&key, record),
            online: record.is_online(now),
            suspension_remaining_secs: record.suspension_remaining(now).map(|d| d.num_seconds()),
        })
    }

    /// Normalize every elapsed suspension. Returns how many records changed.
    pub async fn refresh_suspensions(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut dir = self.load_locked().await;
        let changed = self.expire_suspensions(&mut dir);
        if changed > 0 {
            self.save_locked(&dir).await?;
            tracing::info!(changed, "suspensions expired");
        }
        Ok(changed)
    }

    pub async fn user_count(&self) -> usize {
        self.load().await.len()
    }

    /// The canonical JSON text of the directory.
    pub async fn export_json(&self) -> Result<String> {
        let dir = self.load().await;
        Ok(directory::encode(&dir)?)
    }

    /// Overwrite the directory from pasted JSON (mapping or legacy list).
    /// Returns the number of users now stored.
    pub async fn import_json(&self, text: &str) -> Result<usize> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| AccountError::InvalidInput(format!("Invalid JSON: {e}")))?;
        if !value.is_object() && !value.is_array() {
            return Err(AccountError::InvalidInput("Invalid users JSON".into()));
        }

        let raw = value.to_string();
        let imported = directory::decode(Some(&raw)).into_directory();

        let _guard = self.write_lock.lock().await;
        let current = self.load_locked().await;
        let (admins, active_admins) = admin_tally(current.values());
        let (imported_admins, imported_active) = admin_tally(imported.values());
        if (admins > 0 && imported_admins == 0) || (active_admins > 0 && imported_active == 0) {
            return Err(AccountError::LastAdminViolation);
        }

        self.save_locked(&imported).await?;
        tracing::info!(users = imported.len(), "user directory imported");
        Ok(imported.len())
    }

    /// Make sure at least one admin can sign in. When none can, the given
    /// account is created as admin, or promoted and reinstated if it already
    /// exists. Returns true when anything changed.
    pub async fn ensure_admin(&self, username: &str, password: &str) -> Result<bool> {
        let key = normalize_username(username);
        if key.is_empty() || password.is_empty() {
            return Err(AccountError::InvalidInput(
                "Username and password required".into(),
            ));
        }

        let _guard = self.write_lock.lock().await;
        let mut dir = self.load_locked().await;
        if admin_tally(dir.values()).1 > 0 {
            return Ok(false);
        }

        match dir.get_mut(&key) {
            Some(record) => {
                record.role = Role::Admin;
                record.status = Status::Active;
                record.suspended_until = None;
            }
            None => {
                let record = UserRecord::new(
                    username.trim().to_string(),
                    String::new(),
                    password.to_string(),
                    Role::Admin,
                    self.now(),
                );
                dir.insert(key.clone(), record);
            }
        }

        self.save_locked(&dir).await?;
        tracing::info!(username = %key, "bootstrap admin ensured");
        Ok(true)
    }

    async fn load_for_display(&self) -> Result<Directory> {
        let _guard = self.write_lock.lock().await;
        let mut dir = self.load_locked().await;
        if self.expire_suspensions(&mut dir) > 0 {
            self.save_locked(&dir).await?;
        }
        Ok(dir)
    }

    fn expire_suspensions(&self, dir: &mut Directory) -> usize {
        let now = self.now();
        dir.values_mut()
            .map(|record| record.normalize_expired(now))
            .filter(|changed| *changed)
            .count()
    }

    async fn update<F>(&self, username: &str, apply: F) -> Result<UserRecord>
    where
        F: FnOnce(&mut UserRecord) -> Result<()>,
    {
        let key = normalize_username(username);
        let _guard = self.write_lock.lock().await;
        let mut dir = self.load_locked().await;

        let record = dir
            .get_mut(&key)
            .ok_or_else(|| AccountError::NotFound(key.clone()))?;
        apply(record)?;
        let updated = record.clone();

        self.save_locked(&dir).await?;
        Ok(updated)
    }
}

/// Number of admins, and of admins who can currently sign in.
fn admin_tally<'a>(users: impl Iterator<Item = &'a UserRecord>) -> (usize, usize) {
    users.fold((0, 0), |(admins, active), user| {
        (
            admins + usize::from(user.is_admin()),
            active + usize::from(user.is_active_admin()),
        )
    })
}

/// Reject a change to `key` (`None` for removal) that would leave the
/// directory with no admin, or with no admin able to sign in.
fn ensure_admins_remain(dir: &Directory, key: &str, updated: Option<&UserRecord>) -> Result<()> {
    let (admins, active) = admin_tally(dir.values());
    let after = dir
        .iter()
        .filter_map(|(k, user)| if k == key { updated } else { Some(user) });
    let (admins_after, active_after) = admin_tally(after);

    if (admins > 0 && admins_after == 0) || (active > 0 && active_after == 0) {
        return Err(AccountError::LastAdminViolation);
    }
    Ok(())
}
