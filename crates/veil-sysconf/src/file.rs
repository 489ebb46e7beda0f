//! File-backed config store
//!
//! Persists groups of values as a single JSON document. Every mutation
//! rewrites the document through a temporary file and a rename, so a
//! process killed mid-write leaves either the old or the new state on
//! disk, never a torn file. That makes it a faithful stand-in for the
//! registry when simulating crashes.

use crate::error::Result;
use crate::store::{ConfigKey, ConfigValue, SystemConfigStore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

type Groups = BTreeMap<String, BTreeMap<String, ConfigValue>>;

pub struct FileStore {
    path: PathBuf,
    groups: Mutex<Groups>,
}

impl FileStore {
    /// Open a store, starting empty if the file does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let groups = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Groups::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Groups::new(),
            Err(e) => return Err(e.into()),
        };

        debug!("Opened file store {:?} ({} groups)", path, groups.len());
        Ok(Self {
            path,
            groups: Mutex::new(groups),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, groups: &Groups) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        let content = serde_json::to_vec_pretty(groups)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SystemConfigStore for FileStore {
    async fn get(&self, key: &ConfigKey) -> Result<Option<ConfigValue>> {
        let groups = self.groups.lock().await;
        Ok(groups.get(&key.group).and_then(|g| g.get(&key.name)).cloned())
    }

    async fn set(&self, key: &ConfigKey, value: &ConfigValue) -> Result<()> {
        let mut groups = self.groups.lock().await;
        let mut next = groups.clone();
        next.entry(key.group.clone())
            .or_default()
            .insert(key.name.clone(), value.clone());

        self.persist(&next).await?;
        *groups = next;
        Ok(())
    }

    async fn delete(&self, key: &ConfigKey) -> Result<()> {
        let mut groups = self.groups.lock().await;
        let present = groups
            .get(&key.group)
            .is_some_and(|g| g.contains_key(&key.name));
        if !present {
            return Ok(());
        }

        let mut next = groups.clone();
        if let Some(group) = next.get_mut(&key.group) {
            group.remove(&key.name);
            if group.is_empty() {
                next.remove(&key.group);
            }
        }

        self.persist(&next).await?;
        *groups = next;
        Ok(())
    }

    async fn list(&self, group: &str) -> Result<Vec<String>> {
        let groups = self.groups.lock().await;
        Ok(groups
            .get(group)
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_group(&self, group: &str) -> Result<()> {
        let mut groups = self.groups.lock().await;
        if !groups.contains_key(group) {
            return Ok(());
        }

        let mut next = groups.clone();
        next.remove(group);
        self.persist(&next).await?;
        *groups = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let key = ConfigKey::new("HKCU\\Test", "ProxyEnable");

        {
            let store = FileStore::open(&path).unwrap();
            store.set(&key, &ConfigValue::Dword(1)).await.unwrap();
        }

        // Simulates a fresh process after a crash
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(ConfigValue::Dword(1)));
        assert_eq!(store.list("HKCU\\Test").await.unwrap(), vec!["ProxyEnable"]);
    }

    #[tokio::test]
    async fn test_file_store_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = FileStore::open(&path).unwrap();
        let key = ConfigKey::new("G", "v");

        store.delete(&key).await.unwrap();
        store.set(&key, &ConfigValue::text("x")).await.unwrap();
        store.delete(&key).await.unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get(&key).await.unwrap(), None);
        assert!(reopened.list("G").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_delete_group() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("s.json")).unwrap();

        store.set(&ConfigKey::new("G", "a"), &ConfigValue::Dword(1)).await.unwrap();
        store.set(&ConfigKey::new("G", "b"), &ConfigValue::Dword(2)).await.unwrap();
        store.delete_group("G").await.unwrap();

        assert!(store.list("G").await.unwrap().is_empty());
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(FileStore::open(&path).is_err());
    }
}
