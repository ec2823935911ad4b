use crate::models::CustomSkin;
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const SKINS_META_FILE: &str = "custom_skins.json";
const SKINS_DIR: &str = "skins";

/// Persists imported avatar skins: copied model files plus a flat JSON list of records.
#[derive(Debug)]
pub struct SkinStore {
    meta_path: PathBuf,
    skins_dir: PathBuf,
}

impl SkinStore {
    /// Opens the store under `data_dir`, creating the skins directory if needed.
    pub async fn new(data_dir: &Path) -> Result<Self> {
        let skins_dir = data_dir.join(SKINS_DIR);
        tokio::fs::create_dir_all(&skins_dir)
            .await
            .context("Failed to create skins directory")?;
        log::info!("Skin store ready at {}", data_dir.display());

        Ok(Self {
            meta_path: data_dir.join(SKINS_META_FILE),
            skins_dir,
        })
    }

    /// Loads all saved skins. A missing or unreadable list yields an empty one.
    pub async fn load_all(&self) -> Vec<CustomSkin> {
        let raw = match tokio::fs::read_to_string(&self.meta_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                log::warn!("Failed to read {}: {}", self.meta_path.display(), e);
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<CustomSkin>>(&raw) {
            Ok(skins) => {
                log::debug!("Loaded {} custom skins", skins.len());
                skins
            }
            Err(e) => {
                log::warn!("Ignoring corrupt skin list {}: {}", self.meta_path.display(), e);
                Vec::new()
            }
        }
    }

    /// Copies `source` into private storage and appends a record for it.
    pub async fn import(&self, source: &Path, display_name: &str) -> Result<CustomSkin> {
        let id = Uuid::new_v4();
        let dest = self.skins_dir.join(format!("{}.glb", id));
        log::info!("Importing skin '{}' from {}", display_name, source.display());

        tokio::fs::copy(source, &dest)
            .await
            .context(format!("Failed to copy {} into skin storage", source.display()))?;

        let name = display_name.trim();
        let name = name.strip_suffix(".glb").unwrap_or(name).to_string();
        let skin = CustomSkin {
            id,
            name,
            file_path: dest.clone(),
            added_at: Utc::now(),
        };

        let mut skins = self.load_all().await;
        skins.push(skin.clone());
        if let Err(e) = self.save_meta(&skins).await {
            // Don't leave an orphaned copy behind
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(e);
        }

        log::info!("Successfully imported skin {} ({})", skin.id, skin.name);
        Ok(skin)
    }

    /// Removes the skin's file and record. Returns false for an unknown id.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut skins = self.load_all().await;
        let Some(skin) = skins.iter().find(|s| s.id == id).cloned() else {
            log::warn!("Attempted to delete non-existent skin: {}", id);
            return Ok(false);
        };
        log::warn!("Deleting skin {} ({})", skin.id, skin.name);

        match tokio::fs::remove_file(&skin.file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Skin file {} was already gone", skin.file_path.display());
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to remove {}", skin.file_path.display())))
            }
        }

        skins.retain(|s| s.id != id);
        self.save_meta(&skins).await?;
        Ok(true)
    }

    async fn save_meta(&self, skins: &[CustomSkin]) -> Result<()> {
        let json = serde_json::to_string_pretty(skins).context("Failed to serialize skin list")?;
        tokio::fs::write(&self.meta_path, json)
            .await
            .context(format!("Failed to write {}", self.meta_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_model(dir: &Path) -> (SkinStore, PathBuf) {
        let store = SkinStore::new(dir).await.unwrap();
        let model = dir.join("knight.glb");
        std::fs::write(&model, b"glTF\x02\x00\x00\x00fake").unwrap();
        (store, model)
    }

    #[tokio::test]
    async fn missing_list_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SkinStore::new(dir.path()).await.unwrap();
        assert!(store.load_all().await.is_empty());
    }

    #[tokio::test]
    async fn import_then_delete_round_trips_the_list() {
        let dir = tempfile::tempdir().unwrap();
        let (store, model) = store_with_model(dir.path()).await;

        let first = store.import(&model, "knight.glb").await.unwrap();
        let second = store.import(&model, "Second").await.unwrap();
        assert_eq!(first.name, "knight");
        assert!(first.file_path.starts_with(dir.path().join(SKINS_DIR)));
        assert_eq!(std::fs::read(&first.file_path).unwrap(), std::fs::read(&model).unwrap());

        // A fresh store over the same directory sees the persisted records
        let reopened = SkinStore::new(dir.path()).await.unwrap();
        let ids: Vec<Uuid> = reopened.load_all().await.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);

        assert!(reopened.delete(first.id).await.unwrap());
        assert!(!first.file_path.exists());
        let remaining = reopened.load_all().await;
        assert_eq!(remaining, vec![second]);
    }

    #[tokio::test]
    async fn deleting_unknown_id_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (store, model) = store_with_model(dir.path()).await;
        store.import(&model, "keep").await.unwrap();

        assert!(!store.delete(Uuid::new_v4()).await.unwrap());
        assert_eq!(store.load_all().await.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_list_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SkinStore::new(dir.path()).await.unwrap();
        std::fs::write(dir.path().join(SKINS_META_FILE), "not json").unwrap();
        assert!(store.load_all().await.is_empty());
    }

    #[tokio::test]
    async fn import_of_missing_file_fails_without_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = SkinStore::new(dir.path()).await.unwrap();
        let result = store.import(&dir.path().join("nope.glb"), "nope").await;
        assert!(result.is_err());
        assert!(store.load_all().await.is_empty());
    }
}
