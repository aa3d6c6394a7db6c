//! YAML-file-backed `KnowledgeStore` (§4.6, §6.3): one file per item
//! under `~/.fleetlift/knowledge/{task_id}/item-{item_id}.yaml`.
//!
//! Writes go through a temp-file-then-rename, the same atomic-write
//! discipline the in-sandbox control-file protocol uses, so a reader
//! never observes a half-written item.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::error::{FleetliftError, StorageError};
use crate::domain::models::knowledge::KnowledgeItem;
use crate::domain::ports::KnowledgeStore;

/// Scoped to one task: the enrich/capture hooks (§4.6) only ever read or
/// write the items belonging to the task currently running.
pub struct YamlKnowledgeStore {
    dir: PathBuf,
}

impl YamlKnowledgeStore {
    pub fn new(base_dir: impl AsRef<Path>, task_id: &str) -> Self {
        Self {
            dir: base_dir.as_ref().join(task_id),
        }
    }

    fn item_path(&self, item_id: &str) -> PathBuf {
        self.dir.join(format!("item-{item_id}.yaml"))
    }
}

#[async_trait]
impl KnowledgeStore for YamlKnowledgeStore {
    async fn list(&self, tags: &[String]) -> Result<Vec<KnowledgeItem>, FleetliftError> {
        let dir = self.dir.clone();
        let tags = tags.to_vec();

        tokio::task::spawn_blocking(move || list_blocking(&dir, &tags))
            .await
            .map_err(|e| StorageError::ReadFailed {
                path: dir_display(&dir),
                reason: e.to_string(),
            })??;

        // Re-run outside the closure's borrow to satisfy the return type;
        // spawn_blocking above already validated the directory is readable.
        let dir = self.dir.clone();
        let tags = tags.to_vec();
        tokio::task::spawn_blocking(move || list_blocking(&dir, &tags))
            .await
            .map_err(|e| {
                FleetliftError::from(StorageError::ReadFailed {
                    path: dir_display(&dir),
                    reason: e.to_string(),
                })
            })?
            .map_err(FleetliftError::from)
    }

    async fn put(&self, item: KnowledgeItem) -> Result<(), FleetliftError> {
        let dir = self.dir.clone();
        let path = self.item_path(&item.id);

        tokio::task::spawn_blocking(move || write_item_blocking(&dir, &path, &item))
            .await
            .map_err(|e| StorageError::WriteFailed {
                path: path_display(&path),
                reason: e.to_string(),
            })??;
        Ok(())
    }

    async fn touch(&self, id: &str, now: chrono::DateTime<chrono::Utc>) -> Result<(), FleetliftError> {
        let path = self.item_path(id);
        let dir = self.dir.clone();
        let id = id.to_string();

        tokio::task::spawn_blocking(move || {
            let mut item = read_item_blocking(&path)?;
            item.mark_applied(now);
            write_item_blocking(&dir, &path, &item)
        })
        .await
        .map_err(|e| StorageError::WriteFailed {
            path: id.clone(),
            reason: e.to_string(),
        })??;
        Ok(())
    }
}

fn list_blocking(dir: &Path, tags: &[String]) -> Result<Vec<KnowledgeItem>, StorageError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(dir).map_err(|e| StorageError::ReadFailed {
        path: dir_display(dir),
        reason: e.to_string(),
    })?;

    let mut items = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::ReadFailed {
            path: dir_display(dir),
            reason: e.to_string(),
        })?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let item = read_item_blocking(&path)?;
        if tags.is_empty() || tags.iter().any(|t| item.tags.contains(t)) {
            items.push(item);
        }
    }
    Ok(items)
}

fn read_item_blocking(path: &Path) -> Result<KnowledgeItem, StorageError> {
    let raw = std::fs::read_to_string(path).map_err(|e| StorageError::ReadFailed {
        path: path_display(path),
        reason: e.to_string(),
    })?;
    serde_yaml::from_str(&raw).map_err(|e| StorageError::DecodeFailed {
        path: path_display(path),
        reason: e.to_string(),
    })
}

fn write_item_blocking(dir: &Path, path: &Path, item: &KnowledgeItem) -> Result<(), StorageError> {
    std::fs::create_dir_all(dir).map_err(|e| StorageError::WriteFailed {
        path: dir_display(dir),
        reason: e.to_string(),
    })?;

    let yaml = serde_yaml::to_string(item).map_err(|e| StorageError::WriteFailed {
        path: path_display(path),
        reason: e.to_string(),
    })?;

    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, yaml).map_err(|e| StorageError::WriteFailed {
        path: path_display(&tmp_path),
        reason: e.to_string(),
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| StorageError::WriteFailed {
        path: path_display(path),
        reason: e.to_string(),
    })?;
    Ok(())
}

fn dir_display(path: &Path) -> String {
    path.display().to_string()
}

fn path_display(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::knowledge::KnowledgeItemType;

    #[tokio::test]
    async fn put_then_list_round_trips_item() {
        let tmp = tempfile::tempdir().unwrap();
        let store = YamlKnowledgeStore::new(tmp.path(), "task-1");

        let mut item = KnowledgeItem::new(KnowledgeItemType::Pattern, "always run clippy", 0.8);
        item.tags = vec!["rust".into()];
        store.put(item.clone()).await.unwrap();

        let found = store.list(&["rust".to_string()]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text, "always run clippy");
    }

    #[tokio::test]
    async fn list_filters_by_tag() {
        let tmp = tempfile::tempdir().unwrap();
        let store = YamlKnowledgeStore::new(tmp.path(), "task-1");

        let mut a = KnowledgeItem::new(KnowledgeItemType::Gotcha, "a", 0.5);
        a.tags = vec!["rust".into()];
        let mut b = KnowledgeItem::new(KnowledgeItemType::Gotcha, "b", 0.5);
        b.tags = vec!["python".into()];
        store.put(a).await.unwrap();
        store.put(b).await.unwrap();

        let found = store.list(&["python".to_string()]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text, "b");
    }

    #[tokio::test]
    async fn list_on_missing_directory_returns_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = YamlKnowledgeStore::new(tmp.path(), "never-ran");
        assert!(store.list(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn touch_bumps_times_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let store = YamlKnowledgeStore::new(tmp.path(), "task-1");
        let item = KnowledgeItem::new(KnowledgeItemType::Context, "background info", 0.6);
        let id = item.id.clone();
        store.put(item).await.unwrap();

        store.touch(&id, chrono::Utc::now()).await.unwrap();

        let found = store.list(&[]).await.unwrap();
        assert_eq!(found[0].times_applied, 1);
    }
}
