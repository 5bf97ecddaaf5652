use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::failover::{FailoverState, HostConfiguration};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode device state: {0}")]
    Encode(String),
    #[error("failed to decode device state: {0}")]
    Decode(String),
    #[error("invalid persisted state: {0}")]
    Invalid(String),
    #[error("device state lock poisoned")]
    Poisoned,
    #[error("state writer task failed: {0}")]
    Writer(String),
}

/// Lockdown mode as last committed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockdownRecord {
    pub active: bool,
    pub reason: Option<String>,
    pub engaged_at_ms: Option<u64>,
}

/// Everything that must survive a reboot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub hosts: HostConfiguration,
    pub failover: FailoverState,
    #[serde(default)]
    pub lockdown: LockdownRecord,
}

impl PersistedState {
    pub fn new(hosts: HostConfiguration) -> Self {
        Self {
            hosts,
            failover: FailoverState::default(),
            lockdown: LockdownRecord::default(),
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        self.hosts.validate().map_err(|e| StoreError::Invalid(e.to_string()))?;
        if self.failover.current_host_index > 1 {
            return Err(StoreError::Invalid(format!(
                "host index {} out of range",
                self.failover.current_host_index
            )));
        }
        if self.failover.current_host_index == 1 && !self.hosts.has_secondary() {
            return Err(StoreError::Invalid(
                "active host is secondary but none is configured".to_string(),
            ));
        }
        Ok(())
    }
}

/// Durable backing for [`PersistedState`]. `save` returns only once the write is durable.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<Option<PersistedState>, StoreError>;
    fn save(&self, state: &PersistedState) -> Result<(), StoreError>;
}

/// TOML file written via temp file + fsync + rename, so readers never see a torn write
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<PersistedState>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path).map_err(|e| self.io_err(e))?;
        let state: PersistedState =
            toml::from_str(&text).map_err(|e| StoreError::Decode(e.to_string()))?;
        state.validate()?;
        Ok(Some(state))
    }

    fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        let text = toml::to_string_pretty(state).map_err(|e| StoreError::Encode(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path).map_err(|e| self.io_err(e))?;
            tmp.write_all(text.as_bytes()).map_err(|e| self.io_err(e))?;
            tmp.sync_all().map_err(|e| self.io_err(e))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| self.io_err(e))?;

        #[cfg(unix)]
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

/// In-process store for tests and headless tooling
#[derive(Default)]
pub struct MemoryStateStore {
    saved: Mutex<Option<PersistedState>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            saved: Mutex::new(Some(state)),
            fail_writes: Default::default(),
        }
    }

    /// Make subsequent saves fail, to exercise uncommitted transitions.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Option<PersistedState> {
        self.saved.lock().ok().and_then(|s| s.clone())
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<PersistedState>, StoreError> {
        let saved = self.saved.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(saved.clone())
    }

    fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Io {
                path: PathBuf::from("<memory>"),
                source: std::io::Error::other("simulated write failure"),
            });
        }
        let mut saved = self.saved.lock().map_err(|_| StoreError::Poisoned)?;
        *saved = Some(state.clone());
        Ok(())
    }
}

impl<S: StateStore + ?Sized> StateStore for Arc<S> {
    fn load(&self) -> Result<Option<PersistedState>, StoreError> {
        (**self).load()
    }

    fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        (**self).save(state)
    }
}

/// Single owner of the device's persisted state.
///
/// All mutation goes through the `update_*` accessors, which apply the change to a copy,
/// persist it, and only then publish it in memory. A failed write leaves the previous
/// committed state in place.
pub struct DeviceState {
    current: Mutex<PersistedState>,
    store: Box<dyn StateStore>,
}

impl DeviceState {
    /// Load committed state, or seed it from `default_hosts` on first boot.
    pub fn init(store: Box<dyn StateStore>, default_hosts: HostConfiguration) -> Result<Self, StoreError> {
        let state = match store.load() {
            Ok(Some(state)) => {
                info!(
                    "Restored device state: host index {}, {} consecutive failures",
                    state.failover.current_host_index, state.failover.consecutive_failures
                );
                // Host identity changed in config: keep counters only if still consistent.
                if state.hosts != default_hosts {
                    info!("Host configuration changed; resetting failover state");
                    PersistedState {
                        lockdown: state.lockdown,
                        ..PersistedState::new(default_hosts)
                    }
                } else {
                    state
                }
            }
            Ok(None) => {
                info!("No persisted device state; starting fresh");
                PersistedState::new(default_hosts)
            }
            Err(e) => {
                warn!("Persisted device state unreadable ({}); starting fresh", e);
                PersistedState::new(default_hosts)
            }
        };
        state.validate()?;
        store.save(&state)?;

        Ok(Self {
            current: Mutex::new(state),
            store,
        })
    }

    pub fn snapshot(&self) -> Result<PersistedState, StoreError> {
        Ok(self.current.lock().map_err(|_| StoreError::Poisoned)?.clone())
    }

    pub fn hosts(&self) -> Result<HostConfiguration, StoreError> {
        Ok(self.snapshot()?.hosts)
    }

    pub fn failover(&self) -> Result<FailoverState, StoreError> {
        Ok(self.snapshot()?.failover)
    }

    pub fn lockdown(&self) -> Result<LockdownRecord, StoreError> {
        Ok(self.snapshot()?.lockdown)
    }

    /// Read-decide-write on failover state under one lock, committed only after persistence.
    pub fn update_failover<R>(
        &self,
        f: impl FnOnce(&HostConfiguration, &mut FailoverState) -> R,
    ) -> Result<R, StoreError> {
        let mut current = self.current.lock().map_err(|_| StoreError::Poisoned)?;
        let mut next = current.clone();
        let result = f(&next.hosts, &mut next.failover);
        if next != *current {
            self.store.save(&next)?;
            *current = next;
        }
        Ok(result)
    }

    pub fn update_lockdown<R>(&self, f: impl FnOnce(&mut LockdownRecord) -> R) -> Result<R, StoreError> {
        let mut current = self.current.lock().map_err(|_| StoreError::Poisoned)?;
        let mut next = current.clone();
        let result = f(&mut next.lockdown);
        if next != *current {
            self.store.save(&next)?;
            *current = next;
        }
        Ok(result)
    }

    /// Pick up changes committed by another process (e.g. an operator clearing lockdown).
    pub fn reload_lockdown(&self) -> Result<LockdownRecord, StoreError> {
        let on_disk = self.store.load()?;
        let mut current = self.current.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(state) = on_disk {
            current.lockdown = state.lockdown;
        }
        Ok(current.lockdown.clone())
    }

    /// Write the in-memory state out again (shutdown path).
    pub fn flush(&self) -> Result<(), StoreError> {
        let current = self.current.lock().map_err(|_| StoreError::Poisoned)?;
        self.store.save(&current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> HostConfiguration {
        HostConfiguration::new("primary.example.com", Some("backup.example.com"), 443)
    }

    #[test]
    fn test_file_store_roundtrip_and_atomic_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state").join("device.toml"));
        assert!(store.load().unwrap().is_none());

        let mut state = PersistedState::new(hosts());
        state.failover.consecutive_failures = 2;
        state.failover.backoff_level = 2;
        store.save(&state).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[test]
    fn test_file_store_rejects_inconsistent_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("device.toml"));
        let mut state = PersistedState::new(HostConfiguration::new("primary.example.com", None, 443));
        state.failover.current_host_index = 1;
        store.save(&state).unwrap();
        assert!(matches!(store.load(), Err(StoreError::Invalid(_))));
    }

    #[test]
    fn test_failed_write_does_not_commit() {
        let store = Arc::new(MemoryStateStore::new());
        let device = DeviceState::init(Box::new(store.clone()), hosts()).unwrap();

        store.set_fail_writes(true);
        let result = device.update_failover(|_, f| f.consecutive_failures += 1);
        assert!(result.is_err());
        assert_eq!(device.failover().unwrap().consecutive_failures, 0);

        store.set_fail_writes(false);
        device.update_failover(|_, f| f.consecutive_failures += 1).unwrap();
        assert_eq!(store.snapshot().unwrap().failover.consecutive_failures, 1);
    }

    #[test]
    fn test_init_resumes_committed_state() {
        let mut committed = PersistedState::new(hosts());
        committed.failover.current_host_index = 1;
        committed.failover.is_in_failover_mode = true;
        let store = MemoryStateStore::with_state(committed);

        let device = DeviceState::init(Box::new(store), hosts()).unwrap();
        assert_eq!(device.failover().unwrap().current_host_index, 1);
    }

    #[test]
    fn test_init_resets_failover_when_hosts_change() {
        let mut committed = PersistedState::new(hosts());
        committed.failover.current_host_index = 1;
        committed.lockdown.active = true;
        let store = MemoryStateStore::with_state(committed);

        let changed = HostConfiguration::new("new-primary.example.com", None, 443);
        let device = DeviceState::init(Box::new(store), changed).unwrap();
        assert_eq!(device.failover().unwrap().current_host_index, 0);
        assert!(device.lockdown().unwrap().active);
    }
}
