//! Config store: one JSON document per pack, addressed by id.
//!
//! The source has two inconsistent base-directory conventions (under the
//! executable directory, and under a user app-data path). This store treats
//! the base directory as an injected parameter and makes no choice between
//! them; callers (the GUI, the server binary) decide.

use crate::error::{Result, SyncError};
use crate::config::PackConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

const SELECTED_FILE: &str = ".selected";
const CONFIGS_DIR: &str = "configs";

/// Capability surface the sync engine and CLI binaries depend on. A single
/// trait lets tests substitute an in-memory store without touching disk.
#[async_trait]
pub trait PackStore: Send + Sync {
    async fn list(&self) -> Result<Vec<String>>;
    async fn load(&self, id: &str) -> Result<PackConfig>;
    async fn save(&self, config: &PackConfig) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn exists(&self, id: &str) -> Result<bool>;
    async fn selected(&self) -> Result<Option<String>>;
    async fn select(&self, id: &str) -> Result<()>;
}

/// On-disk implementation: `<base>/configs/<id>.json` plus a small
/// `<base>/configs/.selected` side file recording the operator's choice.
pub struct FsConfigStore {
    base_dir: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FsConfigStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn configs_dir(&self) -> PathBuf {
        self.base_dir.join(CONFIGS_DIR)
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.configs_dir().join(format!("{id}.json"))
    }

    fn selected_path(&self) -> PathBuf {
        self.configs_dir().join(SELECTED_FILE)
    }
}

#[async_trait]
impl PackStore for FsConfigStore {
    async fn list(&self) -> Result<Vec<String>> {
        let dir = self.configs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn load(&self, id: &str) -> Result<PackConfig> {
        let path = self.path_for(id);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| SyncError::NotFound(format!("pack '{id}'")))?;
        let config: PackConfig = serde_json::from_slice(&bytes)?;
        Ok(config)
    }

    async fn save(&self, config: &PackConfig) -> Result<()> {
        config.validate()?;
        let _guard = self.lock.lock().await;

        let dir = self.configs_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.path_for(&config.id);
        let new_bytes = serde_json::to_vec_pretty(config).expect("PackConfig always serializes");

        // Idempotent save: skip the write entirely if bytes are unchanged,
        // so mtime stays stable for unmodified packs.
        if let Ok(existing) = tokio::fs::read(&path).await {
            if existing == new_bytes {
                return Ok(());
            }
        }

        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &new_bytes).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(id)).await?)
    }

    async fn selected(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.selected_path()).await {
            Ok(s) => {
                let id = s.trim().to_string();
                Ok(if id.is_empty() { None } else { Some(id) })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn select(&self, id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let dir = self.configs_dir();
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(self.selected_path(), id).await?;
        Ok(())
    }
}

/// Convenience used by the server binary: fall back to an empty in-memory
/// config when no `--config` flag was given (see CLI surface, §6).
pub async fn load_or_default(store: &dyn PackStore, id: Option<&str>) -> Result<Option<PackConfig>> {
    let id = match id {
        Some(id) => id.to_string(),
        None => match store.selected().await? {
            Some(id) => id,
            None => return Ok(None),
        },
    };
    Ok(Some(store.load(&id).await?))
}

pub fn default_base_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("packsync")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SyncFolder, SyncMode};

    fn sample(id: &str) -> PackConfig {
        PackConfig {
            id: id.into(),
            name: "Test Pack".into(),
            version: "1.0.0".into(),
            host: "127.0.0.1".into(),
            port: 9000,
            server_root: "/srv/test".into(),
            folders: vec![SyncFolder {
                path: "mods".into(),
                mode: SyncMode::Mirror,
                pack_md5: None,
                enabled: true,
            }],
            ignore_patterns: vec![],
            redirects: vec![],
        }
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::new(dir.path());
        let cfg = sample("core");
        store.save(&cfg).await.unwrap();
        let loaded = store.load("core").await.unwrap();
        assert_eq!(loaded, cfg);
    }

    #[tokio::test]
    async fn list_enumerates_saved_packs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::new(dir.path());
        store.save(&sample("a")).await.unwrap();
        store.save(&sample("b")).await.unwrap();
        let mut ids = store.list().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn delete_removes_pack() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::new(dir.path());
        store.save(&sample("core")).await.unwrap();
        assert!(store.exists("core").await.unwrap());
        store.delete("core").await.unwrap();
        assert!(!store.exists("core").await.unwrap());
    }

    #[tokio::test]
    async fn delete_missing_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::new(dir.path());
        store.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn save_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::new(dir.path());
        let mut cfg = sample("core");
        cfg.id.clear();
        assert!(store.save(&cfg).await.is_err());
    }

    #[tokio::test]
    async fn save_is_idempotent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::new(dir.path());
        let cfg = sample("core");
        store.save(&cfg).await.unwrap();

        let path = dir.path().join("configs").join("core.json");
        let mtime_before = tokio::fs::metadata(&path).await.unwrap().modified().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store.save(&cfg).await.unwrap();

        let mtime_after = tokio::fs::metadata(&path).await.unwrap().modified().unwrap();
        assert_eq!(mtime_before, mtime_after);
    }

    #[tokio::test]
    async fn selected_pack_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::new(dir.path());
        assert_eq!(store.selected().await.unwrap(), None);
        store.select("core").await.unwrap();
        assert_eq!(store.selected().await.unwrap(), Some("core".to_string()));
    }
}
