//! Trust-relationship storage
//!
//! The manager only talks to the [`TrustStore`] trait. [`JsonTrustStore`]
//! keeps entries in memory and optionally mirrors them to
//! `~/.config/peerbind/trust.json`.

use crate::acl::{AccessControlEntry, AclId, AclLifetime};
use crate::relationship::RelationShipChangeMsg;
use peerbind_core::BindLevel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Access control entry not found: {0}")]
    NotFound(String),
    #[error("Invalid relationship change")]
    InvalidChange,
    #[error("Configuration directory not found")]
    NoConfigDir,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Persistent ACL store and relationship broadcaster
pub trait TrustStore: Send + Sync {
    /// Add or replace an entry
    fn put_access_control_list(&self, entry: AccessControlEntry) -> StorageResult<()>;

    /// Entries linking `local_udid` to `peer_udid`
    fn query_access_control_list(&self, local_udid: &str, peer_udid: &str)
        -> Vec<AccessControlEntry>;

    /// Remove entries for a peer.
    ///
    /// Device level removes every entry with the peer. App and service level
    /// only remove entries of that level owned by `bundle_name`.
    fn delete_access_control_list(
        &self,
        peer_udid: &str,
        bind_level: BindLevel,
        bundle_name: &str,
    ) -> StorageResult<Vec<AccessControlEntry>>;

    /// Remove every entry created under a signed-in account
    fn delete_account_access_control_list(
        &self,
        user_id: i32,
        account_id: &str,
    ) -> StorageResult<Vec<AccessControlEntry>>;

    /// Remove the entries with the given ids, returning those that existed
    fn delete_access_control_entries(
        &self,
        ids: &[AclId],
    ) -> StorageResult<Vec<AccessControlEntry>>;

    /// All stored entries
    fn list_access_control_list(&self) -> Vec<AccessControlEntry>;

    /// Serialize a change for broadcast to the peers it names
    fn sync_trust_relationship(&self, msg: &RelationShipChangeMsg) -> StorageResult<String>;
}

/// Stored data structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredData {
    /// Entries indexed by ACL id
    entries: HashMap<String, AccessControlEntry>,
}

/// JSON-backed trust store
pub struct JsonTrustStore {
    /// Path to the storage file, `None` keeps everything in memory
    path: Option<PathBuf>,
    data: RwLock<StoredData>,
}

impl JsonTrustStore {
    /// Open the store at the default location
    pub fn new() -> StorageResult<Self> {
        let path = Self::default_path()?;
        Self::with_path(path)
    }

    /// A store that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(StoredData::default()),
        }
    }

    /// Open the store at a specific path
    pub fn with_path(path: PathBuf) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Session-scoped entries never outlive the process that made them
        let data = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<StoredData>(&contents) {
                Ok(mut data) => {
                    data.entries
                        .retain(|_, e| e.lifetime == AclLifetime::Permanent);
                    info!("Loaded trust store from {:?}", path);
                    data
                }
                Err(e) => {
                    warn!("Failed to parse trust store, starting fresh: {}", e);
                    StoredData::default()
                }
            }
        } else {
            debug!("No existing trust store, creating new");
            StoredData::default()
        };

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    /// Get the default storage path (~/.config/peerbind/trust.json)
    fn default_path() -> StorageResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(StorageError::NoConfigDir)?;
        Ok(config_dir.join("peerbind").join("trust.json"))
    }

    fn save(&self) -> StorageResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = {
            let data = self.data.read().unwrap_or_else(|e| e.into_inner());
            serde_json::to_string_pretty(&*data)?
        };
        std::fs::write(path, json)?;
        debug!("Saved trust store to {:?}", path);
        Ok(())
    }

    fn remove_where<F>(&self, mut pred: F) -> StorageResult<Vec<AccessControlEntry>>
    where
        F: FnMut(&AccessControlEntry) -> bool,
    {
        let removed = {
            let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = data
                .entries
                .iter()
                .filter(|(_, e)| pred(e))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| data.entries.remove(id))
                .collect::<Vec<_>>()
        };
        if !removed.is_empty() {
            self.save()?;
        }
        Ok(removed)
    }

    /// Number of stored entries
    pub fn entry_count(&self) -> usize {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.entries.len()
    }

    /// Drop every entry
    pub fn clear(&self) -> StorageResult<()> {
        {
            let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
            data.entries.clear();
        }
        self.save()?;
        info!("Cleared all trust relationships");
        Ok(())
    }
}

impl TrustStore for JsonTrustStore {
    fn put_access_control_list(&self, entry: AccessControlEntry) -> StorageResult<()> {
        let id = entry.id.to_string();
        {
            let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
            data.entries.insert(id.clone(), entry);
        }
        self.save()?;
        info!("Saved access control entry {}", id);
        Ok(())
    }

    fn query_access_control_list(
        &self,
        local_udid: &str,
        peer_udid: &str,
    ) -> Vec<AccessControlEntry> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.entries
            .values()
            .filter(|e| e.links(local_udid, peer_udid))
            .cloned()
            .collect()
    }

    fn delete_access_control_list(
        &self,
        peer_udid: &str,
        bind_level: BindLevel,
        bundle_name: &str,
    ) -> StorageResult<Vec<AccessControlEntry>> {
        let removed = self.remove_where(|e| {
            e.remote.udid == peer_udid
                && match bind_level {
                    BindLevel::Device => true,
                    level => e.bind_level == level && e.local.bundle_name == bundle_name,
                }
        })?;
        if removed.is_empty() {
            return Err(StorageError::NotFound(peer_udid.to_string()));
        }
        info!("Removed {} entries for peer {}", removed.len(), peer_udid);
        Ok(removed)
    }

    fn delete_account_access_control_list(
        &self,
        user_id: i32,
        account_id: &str,
    ) -> StorageResult<Vec<AccessControlEntry>> {
        let removed = self
            .remove_where(|e| e.local.user_id == user_id && e.local.account_id == account_id)?;
        info!(
            "Removed {} entries for account of user {}",
            removed.len(),
            user_id
        );
        Ok(removed)
    }

    fn delete_access_control_entries(
        &self,
        ids: &[AclId],
    ) -> StorageResult<Vec<AccessControlEntry>> {
        let removed = self.remove_where(|e| ids.contains(&e.id))?;
        debug!("Removed {} of {} requested entries", removed.len(), ids.len());
        Ok(removed)
    }

    fn list_access_control_list(&self) -> Vec<AccessControlEntry> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.entries.values().cloned().collect()
    }

    fn sync_trust_relationship(&self, msg: &RelationShipChangeMsg) -> StorageResult<String> {
        let payload = msg
            .to_broadcast_payload()
            .map_err(|_| StorageError::InvalidChange)?;
        info!(
            "Broadcasting {:?} to {} peer(s)",
            msg.change_type,
            msg.peer_udids.len()
        );
        Ok(payload)
    }
}
