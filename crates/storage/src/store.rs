//! The sharded store: path derivation, artifact creation and safe removal.

use crate::error::{StorageError, StorageResult};
use crate::upload::FileUpload;
use depot_core::config::{ExpirationConfig, PreFinishCommand, StorageConfig};
use depot_core::info::UploadInfo;
use depot_metadata::MetadataStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const INCOMPLETE_DIR: &str = "incomplete";
const META_DIR: &str = "meta";
const COMPLETE_DIR: &str = "complete";

/// Filesystem layout and lifecycle coordination for upload artifacts.
///
/// The store owns configuration and the metadata handle; individual
/// [`FileUpload`] objects carry a non-owning `Arc` back to it.
pub struct ShardedStore {
    base: PathBuf,
    shard_layers: usize,
    max_age_anonymous: i64,
    max_age_identified: i64,
    pre_finish_commands: Vec<PreFinishCommand>,
    metadata: Arc<dyn MetadataStore>,
}

impl std::fmt::Debug for ShardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedStore")
            .field("base", &self.base)
            .field("shard_layers", &self.shard_layers)
            .field("max_age_anonymous", &self.max_age_anonymous)
            .field("max_age_identified", &self.max_age_identified)
            .field("pre_finish_commands", &self.pre_finish_commands)
            .finish_non_exhaustive()
    }
}

impl ShardedStore {
    /// Create a store rooted at `storage.base_path`. The directory is not
    /// created up front; `create_file` creates parents on demand.
    pub fn new(
        storage: &StorageConfig,
        expiration: &ExpirationConfig,
        metadata: Arc<dyn MetadataStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: storage.base_path.clone(),
            shard_layers: storage.shard_layers,
            max_age_anonymous: expiration.max_age_anonymous_secs as i64,
            max_age_identified: expiration.max_age_identified_secs as i64,
            pre_finish_commands: storage.pre_finish_commands.clone(),
            metadata,
        })
    }

    /// Root of the on-disk layout.
    pub fn base(&self) -> &Path {
        &self.base
    }

    pub(crate) fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub(crate) fn pre_finish_commands(&self) -> &[PreFinishCommand] {
        &self.pre_finish_commands
    }

    /// Expiry timestamp for an upload finishing at `now`.
    pub(crate) fn expiry_for(&self, info: &UploadInfo, now: i64) -> i64 {
        if info.is_identified() {
            now + self.max_age_identified
        } else {
            now + self.max_age_anonymous
        }
    }

    /// Directory fanout from the leading hex characters of an id or hash,
    /// one single-character directory per shard layer.
    fn shards(&self, stem: &str) -> StorageResult<PathBuf> {
        if stem.len() < self.shard_layers {
            return Err(StorageError::ShardTooShort {
                stem: stem.to_string(),
                layers: self.shard_layers,
            });
        }
        Ok(stem[..self.shard_layers].chars().map(String::from).collect())
    }

    /// Incomplete blob path. Ids live flat while the upload is in flight.
    pub fn incomplete_path(&self, id: &str) -> PathBuf {
        self.base.join(INCOMPLETE_DIR).join(format!("{id}.bin"))
    }

    /// Info sidecar path, sharded by the leading characters of the id.
    pub fn info_path(&self, id: &str) -> StorageResult<PathBuf> {
        Ok(self
            .base
            .join(META_DIR)
            .join(self.shards(id)?)
            .join(format!("{id}.info")))
    }

    /// Content-addressed path of a finished blob.
    pub fn complete_path(&self, hash_hex: &str) -> StorageResult<PathBuf> {
        Ok(self
            .base
            .join(COMPLETE_DIR)
            .join(self.shards(hash_hex)?)
            .join(format!("{hash_hex}.bin")))
    }

    pub(crate) fn is_complete_path(&self, path: &Path) -> bool {
        path.starts_with(self.base.join(COMPLETE_DIR))
    }

    /// Create a new upload: an empty incomplete blob plus its sidecar.
    /// The caller is responsible for having inserted the database row.
    pub async fn new_upload(
        self: &Arc<Self>,
        mut info: UploadInfo,
    ) -> StorageResult<FileUpload> {
        let info_path = self.info_path(&info.id)?;
        let bin_path = self.incomplete_path(&info.id);

        info.storage.bin_path = bin_path.to_string_lossy().into_owned();
        info.storage.info_path = info_path.to_string_lossy().into_owned();

        create_file(&bin_path, &[]).await?;

        let upload = FileUpload::assemble(self.clone(), info, info_path, bin_path);
        upload.write_info().await?;
        Ok(upload)
    }

    /// Load an upload from its sidecar. The true offset comes from a stat
    /// of the blob, never from the sidecar's last persisted value.
    pub async fn get_upload(self: &Arc<Self>, id: &str) -> StorageResult<FileUpload> {
        if !is_valid_id(id) {
            return Err(StorageError::NotFound(id.to_string()));
        }

        let info_path = self.info_path(id)?;
        let data = fs::read(&info_path).await.map_err(|e| not_found(e, id))?;
        let mut info: UploadInfo = serde_json::from_slice(&data)?;

        if info.id != id || info.storage.bin_path.is_empty() {
            return Err(StorageError::NotFound(id.to_string()));
        }

        let bin_path = PathBuf::from(&info.storage.bin_path);
        let stat = fs::metadata(&bin_path).await.map_err(|e| not_found(e, id))?;
        info.offset = stat.len() as i64;

        Ok(FileUpload::assemble(self.clone(), info, info_path, bin_path))
    }

    /// Terminate an upload by id. Used by the admin surface.
    pub async fn terminate_id(self: &Arc<Self>, id: &str) -> StorageResult<()> {
        let upload = self.get_upload(id).await?;
        upload.terminate().await
    }

    /// Delete a file, then walk upward removing each empty parent.
    ///
    /// Refuses to touch any path not prefixed by the absolute base path.
    /// Missing files are not an error. Pruning stops at the layout's
    /// top-level directories (`incomplete/`, `meta/`, `complete/`), which
    /// stay in place once created.
    pub async fn remove_with_dirs(&self, path: &Path) -> StorageResult<()> {
        let abs_base = std::path::absolute(&self.base)?;
        let abs_path = std::path::absolute(path)?;

        if !abs_path.starts_with(&abs_base) {
            return Err(StorageError::OutsideBase {
                path: path.to_string_lossy().into_owned(),
                base: self.base.to_string_lossy().into_owned(),
            });
        }

        match fs::remove_file(&abs_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut current = abs_path.as_path();
        while let Some(dir) = current.parent() {
            if dir == abs_base || dir.parent() == Some(abs_base.as_path()) {
                break;
            }
            match is_dir_empty(dir).await {
                Ok(true) => match fs::remove_dir(dir).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
                Ok(false) => break,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            current = dir;
        }

        Ok(())
    }
}

/// Create-or-truncate a file with the given content. If the parent
/// directory is missing it is created recursively and the create retried
/// once.
pub async fn create_file(path: &Path, content: &[u8]) -> StorageResult<()> {
    let file = match fs::File::create(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::File::create(path).await?
        }
        Err(e) => return Err(e.into()),
    };

    let mut file = file;
    if !content.is_empty() {
        file.write_all(content).await?;
    }
    file.sync_all().await?;
    Ok(())
}

/// Upload ids are 32 lowercase hex characters; anything else is treated
/// as not-found before it can reach path construction.
fn is_valid_id(id: &str) -> bool {
    id.len() == 32
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn not_found(e: std::io::Error, id: &str) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(id.to_string())
    } else {
        StorageError::Io(e)
    }
}

async fn is_dir_empty(path: &Path) -> std::io::Result<bool> {
    let mut entries = fs::read_dir(path).await?;
    Ok(entries.next_entry().await?.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_metadata::SqliteStore;
    use tempfile::TempDir;

    async fn test_store(temp: &TempDir) -> Arc<ShardedStore> {
        let db_path = temp.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(db_path.to_str().unwrap(), ExpirationConfig::default())
                .await
                .unwrap(),
        );
        let storage = StorageConfig {
            base_path: temp.path().join("data"),
            shard_layers: 2,
            ..StorageConfig::default()
        };
        ShardedStore::new(&storage, &ExpirationConfig::default(), metadata)
    }

    #[tokio::test]
    async fn test_path_derivation() {
        let temp = TempDir::new().unwrap();
        let store = test_store(&temp).await;
        let base = temp.path().join("data");

        let id = "00ff00ff00ff00ff00ff00ff00ff00ff";
        assert_eq!(
            store.incomplete_path(id),
            base.join("incomplete").join(format!("{id}.bin"))
        );
        assert_eq!(
            store.info_path(id).unwrap(),
            base.join("meta/0/0").join(format!("{id}.info"))
        );

        let hash = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        assert_eq!(
            store.complete_path(hash).unwrap(),
            base.join("complete/2/c").join(format!("{hash}.bin"))
        );
    }

    #[tokio::test]
    async fn test_shards_reject_short_stem() {
        let temp = TempDir::new().unwrap();
        let store = test_store(&temp).await;
        assert!(matches!(
            store.complete_path("a"),
            Err(StorageError::ShardTooShort { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_file_makes_parents_and_truncates() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a/b/c.bin");

        create_file(&path, b"first").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"first");

        create_file(&path, b"x").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_remove_with_dirs_refuses_outside_base() {
        let temp = TempDir::new().unwrap();
        let store = test_store(&temp).await;

        let outside = temp.path().join("elsewhere/file.bin");
        fs::create_dir_all(outside.parent().unwrap()).await.unwrap();
        fs::write(&outside, b"keep me").await.unwrap();

        let err = store.remove_with_dirs(&outside).await.unwrap_err();
        assert!(matches!(err, StorageError::OutsideBase { .. }));
        assert_eq!(fs::read(&outside).await.unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_remove_with_dirs_prunes_empty_shards() {
        let temp = TempDir::new().unwrap();
        let store = test_store(&temp).await;
        let base = temp.path().join("data");

        let hash = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        let blob = store.complete_path(hash).unwrap();
        create_file(&blob, b"abc").await.unwrap();

        store.remove_with_dirs(&blob).await.unwrap();
        assert!(!blob.exists());
        assert!(!base.join("complete/b/a").exists());
        assert!(!base.join("complete/b").exists());
        // The category directory itself stays.
        assert!(base.join("complete").exists());
    }

    #[tokio::test]
    async fn test_remove_with_dirs_keeps_occupied_shards() {
        let temp = TempDir::new().unwrap();
        let store = test_store(&temp).await;
        let base = temp.path().join("data");

        let gone = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        let kept = "ba0000000000000000000000000000000000000000000000000000000000beef";
        create_file(&store.complete_path(gone).unwrap(), b"abc")
            .await
            .unwrap();
        create_file(&store.complete_path(kept).unwrap(), b"xyz")
            .await
            .unwrap();

        store
            .remove_with_dirs(&store.complete_path(gone).unwrap())
            .await
            .unwrap();
        // b/a still holds the sibling blob.
        assert!(store.complete_path(kept).unwrap().exists());
        assert!(base.join("complete/b/a").exists());
    }

    #[tokio::test]
    async fn test_remove_with_dirs_missing_file_is_ok() {
        let temp = TempDir::new().unwrap();
        let store = test_store(&temp).await;
        let path = temp.path().join("data/incomplete/nope.bin");
        store.remove_with_dirs(&path).await.unwrap();
    }
}
