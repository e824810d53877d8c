//! 文件检查点：`<dir>/<id>.json`，先写临时文件、fsync 再 rename

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{newest_first, Checkpoint, CheckpointError, CheckpointInfo, CheckpointStore};
use crate::core::KeyedLocks;

#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    locks: KeyedLocks,
}

impl FileCheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, CheckpointError> {
        let valid = !id.is_empty()
            && !id.contains(['/', '\\'])
            && id != "."
            && id != ".."
            && !id.contains('\0');
        if !valid {
            return Err(CheckpointError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    async fn read(path: &Path) -> Result<Checkpoint, CheckpointError> {
        let text = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn list_unlocked(&self, conversation_id: Option<&str>) -> Result<Vec<CheckpointInfo>, CheckpointError> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut items = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path).await {
                Ok(cp) if conversation_id.map_or(true, |id| cp.conversation_id == id) => {
                    items.push(cp.info())
                }
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint"),
            }
        }
        newest_first(&mut items);
        Ok(items)
    }

    async fn delete_unlocked(&self, id: &str) -> Result<bool, CheckpointError> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(&checkpoint.id)?;
        let _guard = self.locks.lock(&checkpoint.conversation_id).await;

        fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(format!("{}.json.tmp", checkpoint.id));
        let body = serde_json::to_vec_pretty(checkpoint)?;
        {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&body).await?;
            file.sync_all().await?;
        }
        fs::rename(&tmp, &path).await?;
        debug!(id = %checkpoint.id, path = %path.display(), "checkpoint saved");
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Checkpoint, CheckpointError> {
        let path = self.path_for(id)?;
        let checkpoint = match Self::read(&path).await {
            Err(CheckpointError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound(id.to_string()))
            }
            other => other?,
        };
        checkpoint.check_version()?;
        Ok(checkpoint)
    }

    async fn list(&self, conversation_id: Option<&str>) -> Result<Vec<CheckpointInfo>, CheckpointError> {
        self.list_unlocked(conversation_id).await
    }

    async fn delete(&self, id: &str) -> Result<bool, CheckpointError> {
        self.delete_unlocked(id).await
    }

    async fn prune(&self, conversation_id: &str, keep: usize) -> Result<usize, CheckpointError> {
        let _guard = self.locks.lock(conversation_id).await;
        let mut removed = 0;
        for info in self
            .list_unlocked(Some(conversation_id))
            .await?
            .into_iter()
            .skip(keep)
        {
            if self.delete_unlocked(&info.id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(conversation_id, removed, "old checkpoints pruned");
        }
        Ok(removed)
    }
}
