//! Session snapshot persistence.
//!
//! A snapshot is enough to come back after a restart: which role this process
//! had, which room, under which name, and the last roster it knew. It is never
//! used to resume a round in progress.

use crate::types::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

pub type PersistResult<T> = Result<T, PersistError>;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("snapshot io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub role: Role,
    pub room_id: RoomId,
    pub display_name: String,
    #[serde(default)]
    pub roster: Vec<Participant>,
    /// When this snapshot was written (ISO8601)
    #[serde(default)]
    pub saved_at: Option<String>,
}

impl SessionSnapshot {
    pub fn new(
        role: Role,
        room_id: impl Into<RoomId>,
        display_name: impl Into<String>,
        roster: Vec<Participant>,
    ) -> Self {
        Self {
            role,
            room_id: room_id.into(),
            display_name: display_name.into(),
            roster,
            saved_at: Some(chrono::Utc::now().to_rfc3339()),
        }
    }
}

pub trait SessionStore: Send + Sync {
    fn save(&self, snapshot: &SessionSnapshot) -> PersistResult<()>;

    /// `Ok(None)` when nothing was saved yet
    fn load(&self) -> PersistResult<Option<SessionSnapshot>>;
}

/// Saved snapshot for `role`, if any. Unreadable or foreign snapshots are
/// logged and ignored.
pub fn resume_snapshot(store: &dyn SessionStore, role: Role) -> Option<SessionSnapshot> {
    match store.load() {
        Ok(Some(snapshot)) if snapshot.role == role => {
            tracing::info!(
                "Resuming room {} as {}",
                snapshot.room_id,
                snapshot.display_name
            );
            Some(snapshot)
        }
        Ok(Some(snapshot)) => {
            tracing::info!("Saved session belongs to a {:?}; starting fresh", snapshot.role);
            None
        }
        Ok(None) => None,
        Err(e) => {
            tracing::warn!("Ignoring saved session: {}", e);
            None
        }
    }
}

/// Snapshot stored as a JSON file, replaced atomically on save
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SessionStore for JsonFileStore {
    fn save(&self, snapshot: &SessionSnapshot) -> PersistResult<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> PersistResult<Option<SessionSnapshot>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<SessionSnapshot>>,
}

impl SessionStore for MemoryStore {
    fn save(&self, snapshot: &SessionSnapshot) -> PersistResult<()> {
        if let Ok(mut slot) = self.snapshot.lock() {
            *slot = Some(snapshot.clone());
        }
        Ok(())
    }

    fn load(&self) -> PersistResult<Option<SessionSnapshot>> {
        Ok(self.snapshot.lock().ok().and_then(|s| s.clone()))
    }
}
