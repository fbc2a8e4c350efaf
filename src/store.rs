//! Object store collaborator consumed by the coordinator

use crate::error::StoreResult;
use crate::part::CompletedPart;
use async_trait::async_trait;
use bytes::Bytes;

/// Smallest non-final part most S3-compatible stores accept (5 MiB)
pub const DEFAULT_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Most parts a single multipart upload may have
pub const DEFAULT_MAX_PART_COUNT: u32 = 10_000;

/// Multipart-capable object store
///
/// Request signing and transport belong to the implementation.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Start a multipart upload, returning its upload ID
    async fn initiate(&self, bucket: &str, key: &str) -> StoreResult<String>;

    /// Upload one part, returning its etag
    async fn upload_part(&self, upload_id: &str, part_number: u32, data: Bytes)
        -> StoreResult<String>;

    /// Assemble the listed parts into the final object
    ///
    /// `parts` must be sorted by part number, ascending.
    async fn complete(&self, upload_id: &str, parts: &[CompletedPart]) -> StoreResult<()>;

    /// Discard an upload and every part stored for it
    async fn abort(&self, upload_id: &str) -> StoreResult<()>;

    /// Store a small object in one request
    async fn put_single(&self, bucket: &str, key: &str, data: Bytes) -> StoreResult<()>;

    /// Minimum size of every part except the last
    fn min_part_size(&self) -> u64 {
        DEFAULT_MIN_PART_SIZE
    }

    fn max_part_count(&self) -> u32 {
        DEFAULT_MAX_PART_COUNT
    }
}
