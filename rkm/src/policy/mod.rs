//! Persisted per-volume mount policies.
//!
//! The store lives in a namespace directory shared by the daemon and the
//! `rkm policy` commands. Reads are lock free; every read-modify-write holds
//! an in-process mutex and an exclusive `flock` on the namespace, so
//! concurrent registrations never lose each other's update.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use common::{MountPolicy, PolicyRecord};
use tracing::{debug, warn};

mod blob;

pub use blob::BlobStore;

pub const RECORDS_KEY: &str = "ConfiguredDisks.json";
pub const DEFAULT_MODE_KEY: &str = "DefaultMountMode";

pub type PolicyMap = BTreeMap<String, PolicyRecord>;

#[derive(Debug, thiserror::Error)]
pub enum PolicyStoreError {
    #[error("policy store i/o error on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to lock policy store: {0}")]
    Lock(#[source] nix::Error),
    #[error("failed to encode policy records: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("policy store mutex poisoned")]
    Poisoned,
}

pub struct PolicyStore {
    blobs: BlobStore,
    write_lock: Mutex<()>,
}

impl PolicyStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PolicyStoreError> {
        Ok(Self {
            blobs: BlobStore::open(dir)?,
            write_lock: Mutex::new(()),
        })
    }

    /// Snapshot of every record. An unreadable or corrupt blob reads as empty.
    pub fn get_all(&self) -> PolicyMap {
        self.load().unwrap_or_else(|e| {
            warn!("failed to read policy records, using an empty store: {e}");
            PolicyMap::new()
        })
    }

    /// Corrupt records read as empty, so the next write replaces them. An
    /// i/o error is returned: writing back an empty map would drop records
    /// that were merely unreadable.
    fn load(&self) -> Result<PolicyMap, PolicyStoreError> {
        let Some(data) = self.blobs.read(RECORDS_KEY)? else {
            return Ok(PolicyMap::new());
        };
        match serde_json::from_slice(&data) {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!("corrupt policy records in {RECORDS_KEY}, using an empty store: {e}");
                Ok(PolicyMap::new())
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<PolicyRecord> {
        self.get_all().remove(key)
    }

    /// Stored policy of `key`, or the default policy as of this call.
    pub fn policy(&self, key: &str) -> MountPolicy {
        self.get(key)
            .map(|record| record.mode)
            .unwrap_or_else(|| self.default_policy())
    }

    /// Record a sighting of `key`.
    ///
    /// Without an explicit `policy` the stored one is kept, or the default
    /// policy is used on first sight. The name is always refreshed and
    /// `lastConnected` never moves backwards.
    pub fn register(
        &self,
        key: &str,
        name: &str,
        policy: Option<MountPolicy>,
    ) -> Result<PolicyRecord, PolicyStoreError> {
        self.modify(|records| {
            let now = Utc::now();
            let record = match records.remove(key) {
                Some(previous) => PolicyRecord {
                    uuid: key.to_string(),
                    name: name.to_string(),
                    mode: policy.unwrap_or(previous.mode),
                    last_connected: now.max(previous.last_connected),
                },
                None => PolicyRecord {
                    uuid: key.to_string(),
                    name: name.to_string(),
                    mode: policy.unwrap_or_else(|| self.default_policy()),
                    last_connected: now,
                },
            };
            records.insert(key.to_string(), record.clone());
            record
        })
    }

    /// Administrative change of a policy. Unlike [`register`](Self::register)
    /// this is not a sighting, so `lastConnected` of an existing record is
    /// left alone.
    pub fn set_policy(
        &self,
        key: &str,
        policy: MountPolicy,
        name: Option<&str>,
    ) -> Result<PolicyRecord, PolicyStoreError> {
        self.modify(|records| {
            let record = records
                .entry(key.to_string())
                .and_modify(|record| {
                    record.mode = policy;
                    if let Some(name) = name {
                        record.name = name.to_string();
                    }
                })
                .or_insert_with(|| PolicyRecord {
                    uuid: key.to_string(),
                    name: name.unwrap_or(key).to_string(),
                    mode: policy,
                    last_connected: Utc::now(),
                });
            record.clone()
        })
    }

    /// Returns whether a record was removed.
    pub fn remove(&self, key: &str) -> Result<bool, PolicyStoreError> {
        self.modify(|records| records.remove(key).is_some())
    }

    pub fn default_policy(&self) -> MountPolicy {
        match self.blobs.read(DEFAULT_MODE_KEY) {
            Ok(Some(data)) => String::from_utf8_lossy(&data)
                .parse()
                .unwrap_or_else(|e| {
                    warn!("{e}, falling back to {}", MountPolicy::default());
                    MountPolicy::default()
                }),
            Ok(None) => MountPolicy::default(),
            Err(e) => {
                warn!("failed to read default policy: {e}");
                MountPolicy::default()
            }
        }
    }

    pub fn set_default_policy(&self, policy: MountPolicy) -> Result<(), PolicyStoreError> {
        let _guard = self.write_lock.lock().map_err(|_| PolicyStoreError::Poisoned)?;
        let _lock = self.blobs.lock()?;
        self.blobs.write(DEFAULT_MODE_KEY, policy.as_str().as_bytes())
    }

    fn modify<T>(&self, f: impl FnOnce(&mut PolicyMap) -> T) -> Result<T, PolicyStoreError> {
        let _guard = self.write_lock.lock().map_err(|_| PolicyStoreError::Poisoned)?;
        let _lock = self.blobs.lock()?;

        let mut records = self.load()?;
        let out = f(&mut records);
        let data = serde_json::to_vec_pretty(&records).map_err(PolicyStoreError::Encode)?;
        self.blobs.write(RECORDS_KEY, &data)?;
        debug!("persisted {} policy records", records.len());
        Ok(out)
    }
}
