//! persistence of the local user profiles and of the last sync times

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::profile::Users;

/// errors loading or saving the user store
#[derive(Debug, Error)]
pub enum StoreError {
    /// an I/O error
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
    /// the store file could not be parsed
    #[error("Toml deserialization error: {0}")]
    TomlDeError(#[from] toml::de::Error),
    /// the users could not be serialized
    #[error("Toml serialization error: {0}")]
    TomlSerError(#[from] toml::ser::Error),
    /// someone else holds the lock
    #[error("The lock file {0} is held by another process")]
    Locked(PathBuf),
}

/// the local user database
pub trait UserStore: std::fmt::Debug {
    /// all users, optionally taking the exclusive lock until [UserStore::save]
    /// or [UserStore::release_lock]
    fn load(&self, lock: bool) -> Result<Users, StoreError>;

    /// write all users and release the lock
    fn save(&self, users: &Users, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// release the lock without writing
    fn release_lock(&self);

    /// the connection owning the user, None for unknown users
    fn connector_of(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .load(false)?
            .get(user_id)
            .map(|profile| profile.connector.clone()))
    }
}

/// an exclusively created lock file, removed when dropped
#[derive(Debug)]
pub struct LockFile {
    /// the path of the lock file
    path: PathBuf,
}

impl LockFile {
    /// create the lock file, fails with [StoreError::Locked] if it exists
    pub fn acquire(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::Locked(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;
        Ok(LockFile {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}

/// the on-disk format of [FileUserStore]
#[derive(Debug, Default, Serialize, Deserialize)]
struct UserFile {
    /// RFC 3339 time of the last save
    #[serde(default, skip_serializing_if = "Option::is_none")]
    saved_at: Option<String>,
    /// the users
    #[serde(default)]
    users: Users,
}

/// a user store kept in a TOML file
#[derive(Debug)]
pub struct FileUserStore {
    /// the store file
    path: PathBuf,
    /// the lock file
    lock_path: PathBuf,
    /// the lock while held
    lock: Mutex<Option<LockFile>>,
}

impl FileUserStore {
    /// a store in the given file, the lock file lives next to it
    pub fn new(path: PathBuf) -> Self {
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        FileUserStore {
            path,
            lock_path: lock_path.into(),
            lock: Mutex::new(None),
        }
    }

    /// the held lock, a poisoned mutex still holds a valid value
    fn lock_guard(&self) -> std::sync::MutexGuard<'_, Option<LockFile>> {
        self.lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl UserStore for FileUserStore {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn load(&self, lock: bool) -> Result<Users, StoreError> {
        if lock {
            let mut guard = self.lock_guard();
            if guard.is_none() {
                *guard = Some(LockFile::acquire(&self.lock_path)?);
            }
        }
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Users::new()),
            Err(e) => {
                if lock {
                    self.release_lock();
                }
                return Err(e.into());
            }
        };
        match toml::from_str::<UserFile>(&contents) {
            Ok(file) => Ok(file.users),
            Err(e) => {
                if lock {
                    self.release_lock();
                }
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self, users), fields(path = %self.path.display(), users = users.len()))]
    fn save(&self, users: &Users, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = (|| -> Result<(), StoreError> {
            let file = UserFile {
                saved_at: Some(now.to_rfc3339()),
                users: users.clone(),
            };
            let contents = toml::to_string(&file)?;
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut tmp_path = self.path.clone().into_os_string();
            tmp_path.push(".tmp");
            let tmp_path = PathBuf::from(tmp_path);
            std::fs::write(&tmp_path, contents)?;
            std::fs::rename(&tmp_path, &self.path)?;
            Ok(())
        })();
        self.release_lock();
        result
    }

    fn release_lock(&self) {
        self.lock_guard().take();
    }
}

/// the time of the last sync of a connection, kept in a file
#[derive(Debug, Clone)]
pub struct SyncTimeFile {
    /// the file
    path: PathBuf,
}

impl SyncTimeFile {
    /// the file of the connection in the state directory
    pub fn new(state_dir: &Path, connection_id: &str) -> Self {
        SyncTimeFile {
            path: state_dir.join(format!("last_user_sync.{}", connection_id)),
        }
    }

    /// the time of the last sync, None if unknown or unreadable
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        DateTime::parse_from_rfc3339(contents.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// record a sync at the given time
    pub fn touch(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, now.to_rfc3339())?;
        Ok(())
    }

    /// whether at least `livetime` passed since the last sync
    pub fn is_due(&self, livetime: Duration, now: DateTime<Utc>) -> bool {
        match self.last_sync() {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .map(|elapsed| elapsed >= livetime)
                .unwrap_or(false),
        }
    }
}
