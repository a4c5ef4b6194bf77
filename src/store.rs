//! Crash-safe persistence of the bridge state document.
//!
//! The document holds the install identifier, the session token pair and the
//! per-serial device map. It is rewritten atomically (temp file + rename) so a
//! crash mid-write leaves the previous version intact. A missing or corrupt
//! document is replaced by a fresh one instead of failing the process.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::thermowatt::models::StatusSnapshot;

/// Setpoint used for Manual mode until the user picks one.
pub const DEFAULT_SETPOINT: i64 = 60;

fn default_setpoint() -> i64 {
    DEFAULT_SETPOINT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    #[serde(default = "default_setpoint")]
    pub favorite_setpoint: i64,
    /// Runtime only: status updates before this instant are suppressed.
    #[serde(skip)]
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Runtime only: last status document published for this device.
    #[serde(skip)]
    pub last_status: Option<StatusSnapshot>,
    /// Runtime only: present in the latest cloud inventory.
    #[serde(skip)]
    pub active: bool,
}

impl DeviceRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            favorite_setpoint: DEFAULT_SETPOINT,
            cooldown_until: None,
            last_status: None,
            active: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub install_id: Uuid,
    #[serde(default)]
    pub tokens: Option<SessionTokens>,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceRecord>,
}

impl PersistedState {
    /// Empty registry with a newly generated install identifier.
    pub fn fresh() -> Self {
        Self {
            install_id: Uuid::new_v4(),
            tokens: None,
            devices: BTreeMap::new(),
        }
    }
}

/// Read the state document at `path`.
///
/// Never fails: an absent file yields a fresh state, and an unreadable or
/// corrupt file is logged and replaced by a fresh state.
pub async fn load(path: &Path) -> PersistedState {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No state file yet; starting with a fresh install id");
            return PersistedState::fresh();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "State file unreadable; resetting registry");
            return PersistedState::fresh();
        }
    };

    match serde_json::from_slice::<PersistedState>(&bytes) {
        Ok(state) => {
            debug!(
                path = %path.display(),
                devices = state.devices.len(),
                has_tokens = state.tokens.is_some(),
                "State file loaded"
            );
            state
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "State file corrupt; resetting registry");
            PersistedState::fresh()
        }
    }
}

/// Atomically replace the document at `path` with `state`.
pub async fn save(path: &Path, state: &PersistedState) -> io::Result<()> {
    let content = serde_json::to_vec_pretty(state).map_err(io::Error::other)?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).await?;
    }

    let tmp_path = temp_path(path);
    {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&content).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;
    }
    fs::rename(&tmp_path, path).await
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Shared, lock-guarded handle to the state document.
///
/// Cloning is cheap; every clone sees the same state. All reads and writes go
/// through one mutex, which is the bridge's single critical section.
#[derive(Debug, Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    state: Mutex<PersistedState>,
    /// Serialises file writes so an older snapshot never lands after a newer one.
    persist_lock: Mutex<()>,
}

impl StateStore {
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = load(&path).await;
        Self::with_state(path, state)
    }

    pub fn with_state(path: impl Into<PathBuf>, state: PersistedState) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.into(),
                state: Mutex::new(state),
                persist_lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub async fn read<R>(&self, f: impl FnOnce(&PersistedState) -> R) -> R {
        let guard = self.inner.state.lock().await;
        f(&guard)
    }

    pub async fn update<R>(&self, f: impl FnOnce(&mut PersistedState) -> R) -> R {
        let mut guard = self.inner.state.lock().await;
        f(&mut guard)
    }

    /// Write the current state to disk.
    pub async fn persist(&self) -> io::Result<()> {
        let _write = self.inner.persist_lock.lock().await;
        let snapshot = self.inner.state.lock().await.clone();
        save(&self.inner.path, &snapshot).await?;
        debug!(path = %self.inner.path.display(), "State persisted");
        Ok(())
    }
}
