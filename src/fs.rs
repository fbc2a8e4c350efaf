//! Filesystem-backed object store
//!
//! Layout under the root directory:
//!
//! - objects: `<root>/<bucket>/<key>`
//! - in-progress uploads: `<root>/.multipart/<upload_id>/` holding
//!   `upload.json` and one `part-NNNNN` file per uploaded part
//!
//! Bucket names cannot start with a dot, so the staging area never
//! collides with a bucket.

use crate::error::{StoreError, StoreResult};
use crate::part::CompletedPart;
use crate::store::{ObjectStore, DEFAULT_MAX_PART_COUNT, DEFAULT_MIN_PART_SIZE};
use crate::utils::{compute_etag, key_to_path, validate_bucket_name, validate_key};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STAGING_DIR: &str = ".multipart";
const UPLOAD_META: &str = "upload.json";

#[derive(Debug, Serialize, Deserialize)]
struct UploadMeta {
    bucket: String,
    key: String,
}

/// Object store writing into a local directory
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    min_part_size: u64,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalStore {
            root: root.into(),
            min_part_size: DEFAULT_MIN_PART_SIZE,
        }
    }

    pub fn with_min_part_size(mut self, min_part_size: u64) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path an object is stored at
    pub fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        key_to_path(&self.root, bucket, key)
    }

    fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Staging directory of an upload; IDs that are not UUIDs never exist
    fn staging_dir(&self, upload_id: &str) -> StoreResult<PathBuf> {
        let id = Uuid::parse_str(upload_id)
            .map_err(|_| StoreError::NoSuchUpload(upload_id.to_string()))?;
        Ok(self.staging_root().join(id.to_string()))
    }

    async fn existing_staging_dir(&self, upload_id: &str) -> StoreResult<PathBuf> {
        let dir = self.staging_dir(upload_id)?;
        match fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) => Err(StoreError::NoSuchUpload(upload_id.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NoSuchUpload(upload_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_meta(&self, dir: &Path) -> StoreResult<UploadMeta> {
        let raw = fs::read(dir.join(UPLOAD_META)).await?;
        serde_json::from_slice(&raw)
            .map_err(|e| StoreError::InvalidRequest(format!("Corrupt upload metadata: {}", e)))
    }

    /// Write `data` to a temp file inside `tmp_dir`, then rename it over `dest`
    async fn write_atomic(&self, tmp_dir: &Path, dest: &Path, data: &[u8]) -> StoreResult<()> {
        fs::create_dir_all(tmp_dir).await?;
        let tmp = tmp_dir.join(format!("{}.tmp", Uuid::new_v4()));
        if let Err(e) = fs::write(&tmp, data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        self.publish(&tmp, dest).await
    }

    async fn publish(&self, tmp: &Path, dest: &Path) -> StoreResult<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Err(e) = fs::rename(tmp, dest).await {
            let _ = fs::remove_file(tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Stream the listed parts into `out`, checking etags and sizes
    async fn assemble_into(
        &self,
        dir: &Path,
        parts: &[CompletedPart],
        out: &mut fs::File,
    ) -> StoreResult<u64> {
        let last = parts.len() - 1;
        let mut total = 0u64;

        for (idx, entry) in parts.iter().enumerate() {
            let data = match fs::read(part_file(dir, entry.part_number)).await {
                Ok(data) => data,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(StoreError::InvalidPart {
                        part_number: entry.part_number,
                        reason: "part was never uploaded".to_string(),
                    })
                }
                Err(e) => return Err(e.into()),
            };

            let etag = compute_etag(&data);
            if etag != entry.etag {
                return Err(StoreError::InvalidPart {
                    part_number: entry.part_number,
                    reason: format!("etag mismatch: expected {}, got {}", etag, entry.etag),
                });
            }

            let size = data.len() as u64;
            if idx < last && size < self.min_part_size {
                return Err(StoreError::EntityTooSmall {
                    part_number: entry.part_number,
                    size,
                    min: self.min_part_size,
                });
            }

            out.write_all(&data).await?;
            total += size;
        }

        out.flush().await?;
        out.sync_all().await?;
        Ok(total)
    }
}

/// Best-effort removal of a staging directory, returning whether it is gone
async fn remove_staging(dir: &Path) -> bool {
    match fs::remove_dir_all(dir).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to remove staging directory {:?}: {}", dir, e);
            false
        }
    }
}

fn part_file(dir: &Path, part_number: u32) -> PathBuf {
    dir.join(format!("part-{:05}", part_number))
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn initiate(&self, bucket: &str, key: &str) -> StoreResult<String> {
        validate_bucket_name(bucket)?;
        validate_key(key)?;

        let upload_id = Uuid::new_v4().to_string();
        let dir = self.staging_dir(&upload_id)?;
        fs::create_dir_all(&dir).await?;

        let meta = UploadMeta {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        let raw = serde_json::to_vec(&meta)
            .map_err(|e| StoreError::InvalidRequest(format!("Unencodable metadata: {}", e)))?;
        fs::write(dir.join(UPLOAD_META), raw).await?;

        debug!("Staging upload {} for {}/{} at {:?}", upload_id, bucket, key, dir);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StoreResult<String> {
        if part_number == 0 || part_number > DEFAULT_MAX_PART_COUNT {
            return Err(StoreError::InvalidRequest(format!(
                "Part number {} out of range 1..={}",
                part_number, DEFAULT_MAX_PART_COUNT
            )));
        }

        let dir = self.existing_staging_dir(upload_id).await?;
        self.write_atomic(&dir, &part_file(&dir, part_number), &data)
            .await?;

        debug!(
            "Stored part {} for upload {}, size: {} bytes",
            part_number,
            upload_id,
            data.len()
        );
        Ok(compute_etag(&data))
    }

    async fn complete(&self, upload_id: &str, parts: &[CompletedPart]) -> StoreResult<()> {
        let dir = self.existing_staging_dir(upload_id).await?;

        if parts.is_empty() {
            return Err(StoreError::InvalidRequest(
                "Completion requires at least one part".to_string(),
            ));
        }
        if parts
            .windows(2)
            .any(|pair| pair[0].part_number >= pair[1].part_number)
        {
            return Err(StoreError::InvalidPartOrder);
        }

        let meta = self.read_meta(&dir).await?;
        let tmp = dir.join(format!("{}.assembling", Uuid::new_v4()));
        let mut out = fs::File::create(&tmp).await?;

        let total = match self.assemble_into(&dir, parts, &mut out).await {
            Ok(total) => total,
            Err(e) => {
                drop(out);
                let _ = fs::remove_file(&tmp).await;
                return Err(e);
            }
        };
        drop(out);

        let dest = self.object_path(&meta.bucket, &meta.key);
        self.publish(&tmp, &dest).await?;

        // The object is live from here on; leftover staging is not an error
        remove_staging(&dir).await;

        info!(
            "Completed upload {}: {}/{} ({} bytes, {} parts)",
            upload_id,
            meta.bucket,
            meta.key,
            total,
            parts.len()
        );
        Ok(())
    }

    async fn abort(&self, upload_id: &str) -> StoreResult<()> {
        let dir = self.existing_staging_dir(upload_id).await?;
        fs::remove_dir_all(&dir).await?;
        debug!("Removed staging for upload {}", upload_id);
        Ok(())
    }

    async fn put_single(&self, bucket: &str, key: &str, data: Bytes) -> StoreResult<()> {
        validate_bucket_name(bucket)?;
        validate_key(key)?;

        let dest = self.object_path(bucket, key);
        self.write_atomic(&self.staging_root(), &dest, &data).await?;
        debug!("Stored {}/{} ({} bytes)", bucket, key, data.len());
        Ok(())
    }

    fn min_part_size(&self) -> u64 {
        self.min_part_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> LocalStore {
        LocalStore::new(dir.path()).with_min_part_size(1)
    }

    #[tokio::test]
    async fn test_local_multipart_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let upload_id = store.initiate("mybucket", "dir/file.bin").await.unwrap();
        let etag2 = store
            .upload_part(&upload_id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let etag1 = store
            .upload_part(&upload_id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();

        let parts = vec![
            CompletedPart { part_number: 1, etag: etag1 },
            CompletedPart { part_number: 2, etag: etag2 },
        ];
        store.complete(&upload_id, &parts).await.unwrap();

        let content = std::fs::read(store.object_path("mybucket", "dir/file.bin")).unwrap();
        assert_eq!(content, b"hello world");

        // Staging is gone once the upload completes
        assert!(!store.staging_dir(&upload_id).unwrap().exists());
        assert!(matches!(
            store.abort(&upload_id).await,
            Err(StoreError::NoSuchUpload(_))
        ));
    }

    #[tokio::test]
    async fn test_local_abort_removes_parts() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let upload_id = store.initiate("bucket", "key").await.unwrap();
        store
            .upload_part(&upload_id, 1, Bytes::from_static(b"data"))
            .await
            .unwrap();

        store.abort(&upload_id).await.unwrap();
        assert!(!store.staging_dir(&upload_id).unwrap().exists());
        assert!(!store.object_path("bucket", "key").exists());

        let err = store
            .upload_part(&upload_id, 2, Bytes::from_static(b"late"))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NoSuchUpload(upload_id));
    }

    #[tokio::test]
    async fn test_local_complete_etag_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let upload_id = store.initiate("bucket", "key").await.unwrap();
        store
            .upload_part(&upload_id, 1, Bytes::from_static(b"data"))
            .await
            .unwrap();

        let parts = vec![CompletedPart {
            part_number: 1,
            etag: "not-the-etag".to_string(),
        }];
        let err = store.complete(&upload_id, &parts).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidPart { part_number: 1, .. }));

        // Nothing published, upload still abortable
        assert!(!store.object_path("bucket", "key").exists());
        store.abort(&upload_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_unknown_upload_id() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let fresh = Uuid::new_v4().to_string();
        for id in ["../../etc", "not-a-uuid", fresh.as_str()] {
            let err = store
                .upload_part(id, 1, Bytes::from_static(b"x"))
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::NoSuchUpload(_)));
        }
    }

    #[tokio::test]
    async fn test_local_staging_cleanup_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();

        let staging = dir.path().join(STAGING_DIR).join("gone");
        assert!(!remove_staging(&staging).await);

        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("part-00001"), b"x").unwrap();
        assert!(remove_staging(&staging).await);
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn test_local_complete_clears_staging() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let upload_id = store.initiate("bucket", "key").await.unwrap();
        let etag = store
            .upload_part(&upload_id, 1, Bytes::from_static(b"only"))
            .await
            .unwrap();
        store
            .complete(&upload_id, &[CompletedPart { part_number: 1, etag }])
            .await
            .unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join(STAGING_DIR))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_local_failed_put_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        // "blocker" is a file, so "blocker/obj" cannot be created under it
        store
            .put_single("bucket", "blocker", Bytes::from_static(b"file"))
            .await
            .unwrap();
        let err = store
            .put_single("bucket", "blocker/obj", Bytes::from_static(b"data"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join(STAGING_DIR))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty(), "leftover temp files: {:?}", leftovers);
    }

    #[tokio::test]
    async fn test_local_put_single_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store
            .put_single("bucket", "a/b.txt", Bytes::from_static(b"first"))
            .await
            .unwrap();
        store
            .put_single("bucket", "a/b.txt", Bytes::from_static(b"second"))
            .await
            .unwrap();

        let content = std::fs::read(store.object_path("bucket", "a/b.txt")).unwrap();
        assert_eq!(content, b"second");
    }
}
