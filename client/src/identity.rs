//! Device-local identity: who this participant is, what they are called and
//! which room they were last in.
//!
//! Persistence is best effort. When the backing store cannot be read or
//! written the store drops into degraded mode: a fresh participant id is
//! produced on every call and a warning is logged, but nothing fails.

use chipledger_types::ledger::ParticipantId;
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::{self, ErrorKind},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Key holding the participant id
pub const PARTICIPANT_ID_KEY: &str = "playerId";
/// Key holding the display name
pub const DISPLAY_NAME_KEY: &str = "playerName";
/// Key holding the active room code
pub const ACTIVE_ROOM_KEY: &str = "roomId";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt store: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("store unavailable")]
    Unavailable,
}

/// String key-value persistence that survives a process restart.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

impl<S: LocalStore + ?Sized> LocalStore for &S {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        (**self).remove(key)
    }
}

/// A JSON object on disk. Every write replaces the file through a rename so
/// a crash never leaves a half-written store behind.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update(
        &self,
        apply: impl FnOnce(&mut BTreeMap<String, String>),
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Unavailable)?;
        let mut entries = self.load()?;
        apply(&mut entries);
        self.save(&entries)
    }
}

impl LocalStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Unavailable)?;
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.update(|entries| {
            entries.remove(key);
        })
    }
}

/// Process-local store, for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        self.entries.lock().map_err(|_| StoreError::Unavailable)
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries()?.remove(key);
        Ok(())
    }
}

/// Identity store over a [LocalStore].
pub struct IdentityStore<S: LocalStore> {
    store: S,
    degraded: AtomicBool,
}

impl<S: LocalStore> IdentityStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Whether a persistence failure has been observed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn degrade(&self, op: &'static str, key: &str, err: &StoreError) {
        self.degraded.store(true, Ordering::Relaxed);
        warn!(op, key, error = %err, "local persistence unavailable, identity is not durable");
    }

    /// Return the persisted participant id, creating and persisting one on
    /// first use.
    pub fn participant_id(&self) -> ParticipantId {
        match self.store.get(PARTICIPANT_ID_KEY) {
            Ok(Some(raw)) => match Uuid::parse_str(&raw) {
                Ok(id) => return id,
                Err(e) => warn!(error = %e, "discarding malformed participant id"),
            },
            Ok(None) => {}
            Err(e) => {
                self.degrade("get", PARTICIPANT_ID_KEY, &e);
                return Uuid::new_v4();
            }
        }

        let id = Uuid::new_v4();
        match self.store.set(PARTICIPANT_ID_KEY, &id.to_string()) {
            Ok(()) => debug!(%id, "created participant id"),
            Err(e) => self.degrade("set", PARTICIPANT_ID_KEY, &e),
        }
        id
    }

    fn read(&self, key: &'static str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                self.degrade("get", key, &e);
                None
            }
        }
    }

    fn write(&self, key: &'static str, value: Option<&str>) {
        let result = match value {
            Some(value) => self.store.set(key, value),
            None => self.store.remove(key),
        };
        if let Err(e) = result {
            self.degrade("set", key, &e);
        }
    }

    pub fn display_name(&self) -> Option<String> {
        self.read(DISPLAY_NAME_KEY)
    }

    pub fn set_display_name(&self, name: &str) {
        self.write(DISPLAY_NAME_KEY, Some(name));
    }

    pub fn active_room(&self) -> Option<String> {
        self.read(ACTIVE_ROOM_KEY)
    }

    pub fn set_active_room(&self, room: &str) {
        self.write(ACTIVE_ROOM_KEY, Some(room));
    }

    pub fn clear_active_room(&self) {
        self.write(ACTIVE_ROOM_KEY, None);
    }
}
