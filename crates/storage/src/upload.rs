//! Per-upload state machine.

use crate::error::{StorageError, StorageResult};
use crate::hooks;
use crate::store::{ShardedStore, create_file};
use depot_core::hash::ContentHash;
use depot_core::info::UploadInfo;
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A single upload's artifacts and transitions.
///
/// Lifecycle: created (empty incomplete blob + sidecar) → receiving
/// (chunks appended, offset advances) → finished (hashed, row updated,
/// blob promoted to its content-addressed path) → terminated (sidecar
/// removed, row tombstoned, blob removed unless shared).
#[derive(Debug)]
pub struct FileUpload {
    store: Arc<ShardedStore>,
    info: UploadInfo,
    info_path: PathBuf,
    bin_path: PathBuf,
}

impl FileUpload {
    pub(crate) fn assemble(
        store: Arc<ShardedStore>,
        info: UploadInfo,
        info_path: PathBuf,
        bin_path: PathBuf,
    ) -> Self {
        Self {
            store,
            info,
            info_path,
            bin_path,
        }
    }

    /// Current descriptor.
    pub fn info(&self) -> &UploadInfo {
        &self.info
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Append bytes from `src` at `offset`, which must equal the current
    /// offset. Returns the number of bytes written.
    ///
    /// On a partial write the offset is reconciled against the true file
    /// size before the sidecar is persisted, so a resuming client always
    /// sees the bytes that are actually durable.
    pub async fn write_chunk<R>(&mut self, offset: i64, src: &mut R) -> StorageResult<i64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if offset != self.info.offset {
            return Err(StorageError::OffsetMismatch {
                expected: self.info.offset,
                got: offset,
            });
        }

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&self.bin_path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StorageError::NotFound(self.info.id.clone())
                } else {
                    StorageError::Io(e)
                }
            })?;

        match tokio::io::copy(src, &mut file).await {
            Ok(written) => {
                // Surface close-time errors instead of losing them.
                file.sync_all().await?;
                self.info.offset += written as i64;
                self.write_info().await?;
                Ok(written as i64)
            }
            Err(e) => {
                let _ = file.sync_all().await;
                drop(file);
                if let Ok(stat) = fs::metadata(&self.bin_path).await {
                    self.info.offset = stat.len() as i64;
                }
                if let Err(sidecar_err) = self.write_info().await {
                    tracing::warn!(
                        id = %self.info.id,
                        error = %sidecar_err,
                        "failed to persist sidecar after partial write"
                    );
                }
                Err(StorageError::Io(e))
            }
        }
    }

    /// Declare the final length of a deferred-length upload.
    pub async fn declare_length(&mut self, length: i64) -> StorageResult<()> {
        if !self.info.size_is_deferred {
            return Err(StorageError::InvalidLength(
                "length already declared".to_string(),
            ));
        }
        if length < self.info.offset {
            return Err(StorageError::InvalidLength(format!(
                "declared length {length} is below current offset {}",
                self.info.offset
            )));
        }
        self.info.size = length;
        self.info.size_is_deferred = false;
        self.write_info().await
    }

    /// Append each part's binary content into this upload's blob, in
    /// order. Parts are left untouched. Best-effort atomic: the first
    /// error stops the operation.
    pub async fn concat_uploads(&mut self, parts: &[FileUpload]) -> StorageResult<()> {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&self.bin_path)
            .await?;

        let mut copy_result = Ok(());
        for part in parts {
            let mut src = match fs::File::open(&part.bin_path).await {
                Ok(src) => src,
                Err(e) => {
                    copy_result = Err(StorageError::Io(e));
                    break;
                }
            };
            if let Err(e) = tokio::io::copy(&mut src, &mut file).await {
                copy_result = Err(StorageError::Io(e));
                break;
            }
        }

        let sync_result = file.sync_all().await;
        drop(file);
        copy_result?;
        sync_result?;

        let stat = fs::metadata(&self.bin_path).await?;
        self.info.offset = stat.len() as i64;
        self.write_info().await
    }

    /// Hash the blob, update the row, and promote the blob to its
    /// content-addressed path. Duplicate content keeps the existing blob
    /// and drops the incomplete copy. Calling this on an already-finished
    /// upload is a no-op.
    pub async fn finish(&mut self) -> StorageResult<()> {
        if self.store.is_complete_path(&self.bin_path) {
            return Ok(());
        }

        tracing::debug!(id = %self.info.id, "finishing upload");

        let hash = self.compute_hash().await?;
        let hash_hex = hash.to_hex();

        hooks::run_pre_finish(self.store.pre_finish_commands(), &self.info, &self.bin_path)
            .await?;

        let stat = fs::metadata(&self.bin_path).await?;
        let size = stat.len() as i64;
        self.info.offset = size;
        self.info.size = size;
        self.info.size_is_deferred = false;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let expires = self.store.expiry_for(&self.info, now);
        self.info
            .metadata
            .insert(depot_core::METADATA_EXPIRES.to_string(), expires.to_string());

        self.store
            .metadata()
            .finish_upload(&self.info.id, hash.as_bytes(), expires, size)
            .await?;

        let new_path = self.store.complete_path(&hash_hex)?;
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        match fs::metadata(&new_path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::rename(&self.bin_path, &new_path).await?;
            }
            Ok(_) => {
                // Duplicate content: the blob already exists, drop ours.
                if let Err(e) = fs::remove_file(&self.bin_path).await {
                    tracing::error!(
                        id = %self.info.id,
                        path = %self.bin_path.display(),
                        error = %e,
                        "failed to remove duplicate incomplete blob"
                    );
                }
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            id = %self.info.id,
            sha256 = %hash_hex,
            size,
            "upload finished"
        );

        self.info.storage.bin_path = new_path.to_string_lossy().into_owned();
        self.bin_path = new_path;
        self.write_info().await
    }

    /// Remove the sidecar, tombstone the row, and remove the blob if no
    /// other live row shares its hash. A missing blob is not an error.
    pub async fn terminate(&self) -> StorageResult<()> {
        self.store.remove_with_dirs(&self.info_path).await?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.store
            .metadata()
            .terminate_upload(&self.info.id, now)
            .await?;

        tracing::info!(id = %self.info.id, "upload removed");

        let duplicates = self
            .store
            .metadata()
            .fetch_duplicate_count(&self.info.id)
            .await?;

        if duplicates == 0 {
            self.store.remove_with_dirs(&self.bin_path).await?;
            tracing::info!(
                id = %self.info.id,
                path = %self.bin_path.display(),
                "upload data removed"
            );
        }

        Ok(())
    }

    /// Open the blob for reading.
    pub async fn reader(&self) -> StorageResult<fs::File> {
        fs::File::open(&self.bin_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(self.info.id.clone())
            } else {
                StorageError::Io(e)
            }
        })
    }

    /// Persist the sidecar. Everything is overwritten.
    pub(crate) async fn write_info(&self) -> StorageResult<()> {
        let data = serde_json::to_vec(&self.info)?;
        create_file(&self.info_path, &data).await
    }

    async fn compute_hash(&self) -> StorageResult<ContentHash> {
        let mut file = fs::File::open(&self.bin_path).await?;
        let mut hasher = ContentHash::hasher();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    }
}
