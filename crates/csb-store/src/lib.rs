//! Durable JSON persistence for reconciliation state and tenant config.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use csb_core::{Category, CategoryConfig, TenantConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "csb-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed store file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Per tenant/category reconciliation state. Present if and only if at
/// least one fully-successful reconciliation has happened for the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub aggregate_hash: u64,
    /// Ordered: position i is the subgroup rendered into detail unit i.
    /// Keeping order makes the per-position skip check sound when a
    /// subgroup appears or disappears and shifts its siblings.
    pub subgroup_hashes: Vec<(String, u64)>,
    pub last_update: DateTime<Utc>,
    pub unit_count: usize,
}

fn state_key(tenant_id: &str, category: Category) -> String {
    format!("{}/{}", tenant_id, category.key())
}

/// Write `bytes` to `path` via a sibling temp file and an atomic rename,
/// so a crash mid-write never leaves a truncated store file behind.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io)?;
    }

    let temp_name = format!(".{}.tmp", Uuid::new_v4());
    let temp_path = path.with_file_name(temp_name);

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io)?;
    file.write_all(bytes).await.map_err(io)?;
    file.flush().await.map_err(io)?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(io(err))
        }
    }
}

async fn read_json_map<T>(path: &Path) -> Result<BTreeMap<String, T>, StoreError>
where
    T: for<'de> Deserialize<'de>,
{
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Malformed {
            path: path.to_path_buf(),
            source,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Durable map of `tenant/category` -> [`SyncState`], backed by one JSON
/// file. Cross-key concurrency is safe; same-key read-modify-write races
/// are excluded upstream by the admission lock.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, SyncState>>,
}

impl StateStore {
    /// Open the store, loading any existing file. A missing file is a
    /// fresh start, not an error.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = read_json_map(&path)
            .await
            .with_context(|| format!("loading state store {}", path.display()))?;
        info!(path = %path.display(), keys = entries.len(), "loaded reconciliation state");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub async fn get(&self, tenant_id: &str, category: Category) -> Option<SyncState> {
        let entries = self.entries.lock().await;
        entries.get(&state_key(tenant_id, category)).cloned()
    }

    pub async fn set(
        &self,
        tenant_id: &str,
        category: Category,
        state: SyncState,
    ) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(state_key(tenant_id, category), state);
        self.persist(&entries).await
    }

    pub async fn delete(&self, tenant_id: &str, category: Category) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.remove(&state_key(tenant_id, category)).is_some() {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    pub async fn delete_tenant(&self, tenant_id: &str) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|key, _| key.split('/').next() != Some(tenant_id));
        if entries.len() != before {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    /// Drop state for tenants no longer present in the active set.
    /// Returns the number of pruned keys.
    pub async fn prune_except(&self, active_tenants: &HashSet<String>) -> anyhow::Result<usize> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|key, _| {
            key.split('/')
                .next()
                .is_some_and(|tenant| active_tenants.contains(tenant))
        });
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, "pruned stale reconciliation state");
            self.persist(&entries).await?;
        }
        Ok(removed)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn persist(&self, entries: &BTreeMap<String, SyncState>) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(entries).context("serializing state store")?;
        write_atomic(&self.path, &bytes)
            .await
            .with_context(|| format!("writing state store {}", self.path.display()))?;
        debug!(path = %self.path.display(), keys = entries.len(), "saved reconciliation state");
        Ok(())
    }
}

/// Durable map of tenant id -> [`TenantConfig`], backed by one JSON file.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    tenants: Mutex<BTreeMap<String, TenantConfig>>,
}

impl ConfigStore {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let tenants = read_json_map(&path)
            .await
            .with_context(|| format!("loading config store {}", path.display()))?;
        info!(path = %path.display(), tenants = tenants.len(), "loaded tenant configuration");
        Ok(Self {
            path,
            tenants: Mutex::new(tenants),
        })
    }

    pub async fn get(&self, tenant_id: &str) -> Option<TenantConfig> {
        self.tenants.lock().await.get(tenant_id).cloned()
    }

    pub async fn upsert(&self, config: TenantConfig) -> anyhow::Result<()> {
        let mut tenants = self.tenants.lock().await;
        tenants.insert(config.tenant_id.clone(), config);
        self.persist(&tenants).await
    }

    /// Read-modify-write of a single category slot under the store mutex.
    /// Concurrent cycles for sibling categories of the same tenant each
    /// rewrite only their own slot, never the whole row, so one cycle's
    /// freshly recorded unit ids cannot be clobbered by a sibling's stale
    /// snapshot. Returns false when the tenant no longer exists.
    pub async fn update_category<F>(
        &self,
        tenant_id: &str,
        category: Category,
        mutate: F,
    ) -> anyhow::Result<bool>
    where
        F: FnOnce(&mut CategoryConfig),
    {
        let mut tenants = self.tenants.lock().await;
        let Some(tenant) = tenants.get_mut(tenant_id) else {
            return Ok(false);
        };
        mutate(tenant.category_mut(category));
        self.persist(&tenants).await?;
        Ok(true)
    }

    pub async fn remove(&self, tenant_id: &str) -> anyhow::Result<bool> {
        let mut tenants = self.tenants.lock().await;
        let removed = tenants.remove(tenant_id).is_some();
        if removed {
            self.persist(&tenants).await?;
        }
        Ok(removed)
    }

    /// Tenants eligible for the periodic cycle: setup finished and
    /// auto-sync left on.
    pub async fn active_tenants(&self) -> Vec<TenantConfig> {
        self.tenants
            .lock()
            .await
            .values()
            .filter(|t| t.setup_complete && t.auto_sync)
            .cloned()
            .collect()
    }

    pub async fn all_tenant_ids(&self) -> HashSet<String> {
        self.tenants.lock().await.keys().cloned().collect()
    }

    async fn persist(&self, tenants: &BTreeMap<String, TenantConfig>) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(tenants).context("serializing config store")?;
        write_atomic(&self.path, &bytes)
            .await
            .with_context(|| format!("writing config store {}", self.path.display()))?;
        debug!(path = %self.path.display(), tenants = tenants.len(), "saved tenant configuration");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state(hash: u64) -> SyncState {
        SyncState {
            aggregate_hash: hash,
            subgroup_hashes: vec![("Adamant".to_string(), hash ^ 1)],
            last_update: Utc::now(),
            unit_count: 1,
        }
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");

        let store = StateStore::open(&path).await.unwrap();
        store
            .set("T1", Category::Raid, sample_state(42))
            .await
            .unwrap();
        drop(store);

        let reopened = StateStore::open(&path).await.unwrap();
        let state = reopened.get("T1", Category::Raid).await.unwrap();
        assert_eq!(state.aggregate_hash, 42);
        assert_eq!(state.unit_count, 1);
    }

    #[tokio::test]
    async fn state_keys_are_per_category() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state.json")).await.unwrap();

        store.set("T1", Category::Raid, sample_state(1)).await.unwrap();
        store.set("T1", Category::Trial, sample_state(2)).await.unwrap();

        assert_eq!(store.get("T1", Category::Raid).await.unwrap().aggregate_hash, 1);
        assert_eq!(store.get("T1", Category::Trial).await.unwrap().aggregate_hash, 2);
        assert!(store.get("T1", Category::Social).await.is_none());

        store.delete("T1", Category::Raid).await.unwrap();
        assert!(store.get("T1", Category::Raid).await.is_none());
        assert!(store.get("T1", Category::Trial).await.is_some());
    }

    #[tokio::test]
    async fn prune_except_keeps_only_active_tenants() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state.json")).await.unwrap();

        store.set("keep", Category::Raid, sample_state(1)).await.unwrap();
        store.set("keep", Category::Social, sample_state(2)).await.unwrap();
        store.set("gone", Category::Raid, sample_state(3)).await.unwrap();

        let active: HashSet<String> = ["keep".to_string()].into_iter().collect();
        let removed = store.prune_except(&active).await.unwrap();

        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 2);
        assert!(store.get("gone", Category::Raid).await.is_none());
    }

    #[tokio::test]
    async fn delete_tenant_removes_all_categories() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state.json")).await.unwrap();

        store.set("T1", Category::Raid, sample_state(1)).await.unwrap();
        store.set("T1", Category::Trial, sample_state(2)).await.unwrap();
        store.set("T2", Category::Raid, sample_state(3)).await.unwrap();

        store.delete_tenant("T1").await.unwrap();
        assert_eq!(store.len().await, 1);
        assert!(store.get("T2", Category::Raid).await.is_some());
    }

    #[tokio::test]
    async fn config_store_round_trips_and_filters_active() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tenants.json");
        let store = ConfigStore::open(&path).await.unwrap();

        let mut active = TenantConfig::new("T1");
        active.setup_complete = true;
        active.category_mut(Category::Raid).channel_id = Some("chan".to_string());

        let mut paused = TenantConfig::new("T2");
        paused.setup_complete = true;
        paused.auto_sync = false;

        store.upsert(active.clone()).await.unwrap();
        store.upsert(paused).await.unwrap();
        store.upsert(TenantConfig::new("T3")).await.unwrap();

        let eligible = store.active_tenants().await;
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].tenant_id, "T1");

        drop(store);
        let reopened = ConfigStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("T1").await.unwrap(), active);
        assert_eq!(reopened.all_tenant_ids().await.len(), 3);

        assert!(reopened.remove("T3").await.unwrap());
        assert!(!reopened.remove("T3").await.unwrap());
    }

    #[tokio::test]
    async fn update_category_touches_only_its_slot() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tenants.json");
        let store = ConfigStore::open(&path).await.unwrap();

        let mut tenant = TenantConfig::new("T1");
        tenant.category_mut(Category::Raid).overview_unit = Some("raid-ov".to_string());
        tenant.category_mut(Category::Raid).detail_units = vec!["raid-d0".to_string()];
        store.upsert(tenant).await.unwrap();

        let stored = store
            .update_category("T1", Category::Trial, |slot| {
                slot.overview_unit = Some("trial-ov".to_string());
                slot.detail_units = vec!["trial-d0".to_string()];
            })
            .await
            .unwrap();
        assert!(stored);

        drop(store);
        let reopened = ConfigStore::open(&path).await.unwrap();
        let tenant = reopened.get("T1").await.unwrap();
        assert_eq!(tenant.category(Category::Raid).overview_unit.as_deref(), Some("raid-ov"));
        assert_eq!(tenant.category(Category::Raid).detail_units, vec!["raid-d0".to_string()]);
        assert_eq!(tenant.category(Category::Trial).overview_unit.as_deref(), Some("trial-ov"));

        assert!(!reopened
            .update_category("nobody", Category::Raid, |slot| {
                slot.overview_unit = Some("x".to_string());
            })
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn malformed_store_file_is_reported() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let err = StateStore::open(&path).await.unwrap_err();
        assert!(err.to_string().contains("loading state store"));
    }
}
