//! Durable snapshot of room histories and passwords.
//!
//! The whole snapshot is rewritten on every mutation: serialized next to the
//! target and renamed over it, so a crash leaves either the old or the new
//! document on disk. Active membership is never persisted.

use std::{
    collections::HashMap,
    io::ErrorKind,
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
};

use anyhow::Context;
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::{protocol::Message, AppResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub history: HashMap<String, Vec<Message>>,
    /// Empty string means the room is open.
    #[serde(default)]
    pub room_passwords: HashMap<String, String>,
}

impl Snapshot {
    /// A room leaves a persisted trace through either map.
    pub fn contains_room(&self, room_id: &str) -> bool {
        self.room_passwords.contains_key(room_id) || self.history.contains_key(room_id)
    }

    pub fn password(&self, room_id: &str) -> &str {
        self.room_passwords.get(room_id).map(String::as_str).unwrap_or("")
    }

    pub fn history(&self, room_id: &str) -> &[Message] {
        self.history.get(room_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

pub struct Store {
    path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

impl Store {
    /// Loads the snapshot at `path`. Any failure leaves the store empty.
    pub async fn load(path: impl Into<PathBuf>) -> Store {
        let path = path.into();

        let snapshot = match tokio::fs::read(&path).await {
            Ok(data) => match serde_json::from_slice::<Snapshot>(&data) {
                Ok(snapshot) => {
                    info!(
                        "loaded {} ({} rooms with passwords, {} histories)",
                        path.display(),
                        snapshot.room_passwords.len(),
                        snapshot.history.len()
                    );
                    snapshot
                }
                Err(e) => {
                    error!("failed to decode {}, starting empty: {e}", path.display());
                    Snapshot::default()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("no snapshot at {}, starting empty", path.display());
                Snapshot::default()
            }
            Err(e) => {
                error!("failed to read {}, starting empty: {e}", path.display());
                Snapshot::default()
            }
        };

        Store {
            path,
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exclusive access to the snapshot. Saves go through the guard, so every
    /// write to disk is serialized with every mutation.
    pub async fn lock(&self) -> StoreGuard<'_> {
        StoreGuard {
            path: &self.path,
            snapshot: self.snapshot.lock().await,
        }
    }

    pub async fn flush(&self) -> AppResult<()> {
        self.lock().await.save().await
    }
}

pub struct StoreGuard<'a> {
    path: &'a Path,
    snapshot: MutexGuard<'a, Snapshot>,
}

impl StoreGuard<'_> {
    pub async fn save(&self) -> AppResult<()> {
        write_snapshot(self.path, &self.snapshot).await
    }

    /// Saves, logging a failure instead of returning it. The in-memory
    /// snapshot is kept either way.
    pub async fn persist(&self) -> bool {
        match self.save().await {
            Ok(()) => true,
            Err(e) => {
                error!("failed to persist snapshot: {e}");
                false
            }
        }
    }

    pub fn append(&mut self, room_id: &str, message: Message) {
        self.snapshot
            .history
            .entry(room_id.to_owned())
            .or_default()
            .push(message);
    }
}

impl Deref for StoreGuard<'_> {
    type Target = Snapshot;

    fn deref(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl DerefMut for StoreGuard<'_> {
    fn deref_mut(&mut self) -> &mut Snapshot {
        &mut self.snapshot
    }
}

async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> AppResult<()> {
    let data = serde_json::to_vec_pretty(snapshot)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, data)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;

    Ok(())
}
