//! In-memory object store
//!
//! Keeps in-progress multipart uploads and finished objects in process
//! memory. Besides serving as a lightweight store it can script failures
//! per operation and per part number, add latency to part uploads, and
//! count every call, which makes it the store the coordinator is tested
//! against.

use crate::error::{StoreError, StoreResult};
use crate::part::CompletedPart;
use crate::store::{ObjectStore, DEFAULT_MAX_PART_COUNT, DEFAULT_MIN_PART_SIZE};
use crate::utils::{compute_etag, validate_bucket_name, validate_key};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Represents a single uploaded part
#[derive(Debug, Clone)]
pub struct UploadedPart {
    pub part_number: u32,
    pub data: Bytes,
    pub etag: String,
}

/// Represents an in-progress multipart upload
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub parts: HashMap<u32, UploadedPart>,
}

impl PendingUpload {
    pub fn new(bucket: String, key: String) -> Self {
        Self {
            upload_id: Uuid::new_v4().to_string(),
            bucket,
            key,
            parts: HashMap::new(),
        }
    }

    /// Store a part, replacing any earlier upload of the same number
    pub fn add_part(&mut self, part_number: u32, data: Bytes) -> String {
        let etag = compute_etag(&data);
        self.parts.insert(
            part_number,
            UploadedPart {
                part_number,
                data,
                etag: etag.clone(),
            },
        );
        etag
    }

    pub fn list_parts(&self) -> Vec<&UploadedPart> {
        let mut parts: Vec<&UploadedPart> = self.parts.values().collect();
        parts.sort_by_key(|p| p.part_number);
        parts
    }

    /// Assemble the listed parts into the final object data
    ///
    /// The listing must be non-empty, strictly ascending and reference
    /// stored parts by their current etag. Every part but the last must be
    /// at least `min_part_size` bytes.
    pub fn assemble(&self, listed: &[CompletedPart], min_part_size: u64) -> StoreResult<Bytes> {
        if listed.is_empty() {
            return Err(StoreError::InvalidRequest(
                "Completion requires at least one part".to_string(),
            ));
        }

        if listed
            .windows(2)
            .any(|pair| pair[0].part_number >= pair[1].part_number)
        {
            return Err(StoreError::InvalidPartOrder);
        }

        let mut stored = Vec::with_capacity(listed.len());
        for entry in listed {
            let part = self
                .parts
                .get(&entry.part_number)
                .ok_or_else(|| StoreError::InvalidPart {
                    part_number: entry.part_number,
                    reason: "part was never uploaded".to_string(),
                })?;
            if part.etag != entry.etag {
                return Err(StoreError::InvalidPart {
                    part_number: entry.part_number,
                    reason: format!("etag mismatch: expected {}, got {}", part.etag, entry.etag),
                });
            }
            stored.push(part);
        }

        let last = stored.len() - 1;
        for part in &stored[..last] {
            let size = part.data.len() as u64;
            if size < min_part_size {
                return Err(StoreError::EntityTooSmall {
                    part_number: part.part_number,
                    size,
                    min: min_part_size,
                });
            }
        }

        let total = stored.iter().map(|p| p.data.len()).sum();
        let mut assembled = BytesMut::with_capacity(total);
        for part in stored {
            tracing::trace!("Adding part {} with {} bytes", part.part_number, part.data.len());
            assembled.extend_from_slice(&part.data);
        }

        tracing::debug!(
            "Assembled total {} bytes from {} parts",
            assembled.len(),
            listed.len()
        );
        Ok(assembled.freeze())
    }
}

/// Failures queued per operation; each call pops at most one
#[derive(Debug, Default)]
struct ScriptedFailures {
    initiate: VecDeque<StoreError>,
    parts: HashMap<u32, VecDeque<StoreError>>,
    complete: VecDeque<StoreError>,
    abort: VecDeque<StoreError>,
    put: VecDeque<StoreError>,
}

#[derive(Debug, Default)]
struct Counters {
    initiate: AtomicUsize,
    upload_part: AtomicUsize,
    complete: AtomicUsize,
    abort: AtomicUsize,
    put_single: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Snapshot of the calls a [`MemoryStore`] has served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub initiate: usize,
    /// Every attempt counts, retries included
    pub upload_part: usize,
    pub complete: usize,
    pub abort: usize,
    pub put_single: usize,
    /// Highest number of part uploads observed running at once
    pub max_in_flight: usize,
}

/// Decrements the in-flight count even if the upload future is dropped
struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Object store held entirely in memory
#[derive(Debug)]
pub struct MemoryStore {
    uploads: Mutex<HashMap<String, PendingUpload>>,
    objects: Mutex<HashMap<(String, String), Bytes>>,
    failures: Mutex<ScriptedFailures>,
    dispatched: Mutex<Vec<u32>>,
    last_completion: Mutex<Option<Vec<CompletedPart>>>,
    counters: Counters,
    min_part_size: u64,
    max_part_count: u32,
    part_latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            uploads: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            failures: Mutex::new(ScriptedFailures::default()),
            dispatched: Mutex::new(Vec::new()),
            last_completion: Mutex::new(None),
            counters: Counters::default(),
            min_part_size: DEFAULT_MIN_PART_SIZE,
            max_part_count: DEFAULT_MAX_PART_COUNT,
            part_latency: None,
        }
    }

    pub fn with_min_part_size(mut self, min_part_size: u64) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    pub fn with_max_part_count(mut self, max_part_count: u32) -> Self {
        self.max_part_count = max_part_count;
        self
    }

    /// Delay every part upload by `latency`
    pub fn with_part_latency(mut self, latency: Duration) -> Self {
        self.part_latency = Some(latency);
        self
    }

    /// Fail the next `times` uploads of `part_number` with `err`
    pub fn fail_part(&self, part_number: u32, err: StoreError, times: usize) {
        let mut failures = self.failures.lock();
        let queue = failures.parts.entry(part_number).or_default();
        queue.extend(std::iter::repeat(err).take(times));
    }

    pub fn fail_initiate(&self, err: StoreError) {
        self.failures.lock().initiate.push_back(err);
    }

    pub fn fail_complete(&self, err: StoreError) {
        self.failures.lock().complete.push_back(err);
    }

    pub fn fail_abort(&self, err: StoreError) {
        self.failures.lock().abort.push_back(err);
    }

    pub fn fail_put(&self, err: StoreError) {
        self.failures.lock().put.push_back(err);
    }

    pub fn stats(&self) -> CallCounts {
        let c = &self.counters;
        CallCounts {
            initiate: c.initiate.load(Ordering::SeqCst),
            upload_part: c.upload_part.load(Ordering::SeqCst),
            complete: c.complete.load(Ordering::SeqCst),
            abort: c.abort.load(Ordering::SeqCst),
            put_single: c.put_single.load(Ordering::SeqCst),
            max_in_flight: c.max_in_flight.load(Ordering::SeqCst),
        }
    }

    /// Part numbers in the order `upload_part` was called, retries included
    pub fn dispatched_parts(&self) -> Vec<u32> {
        self.dispatched.lock().clone()
    }

    /// Part listing of the last `complete` call that reached the store
    pub fn last_completion(&self) -> Option<Vec<CompletedPart>> {
        self.last_completion.lock().clone()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Number of uploads neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.uploads.lock().len()
    }

    pub fn get_upload(&self, upload_id: &str) -> Option<PendingUpload> {
        self.uploads.lock().get(upload_id).cloned()
    }

    fn next_failure(
        &self,
        pick: impl FnOnce(&mut ScriptedFailures) -> Option<StoreError>,
    ) -> StoreResult<()> {
        let mut failures = self.failures.lock();
        match pick(&mut *failures) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn initiate(&self, bucket: &str, key: &str) -> StoreResult<String> {
        self.counters.initiate.fetch_add(1, Ordering::SeqCst);
        self.next_failure(|f| f.initiate.pop_front())?;
        validate_bucket_name(bucket)?;
        validate_key(key)?;

        let upload = PendingUpload::new(bucket.to_string(), key.to_string());
        let upload_id = upload.upload_id.clone();
        self.uploads.lock().insert(upload_id.clone(), upload);

        tracing::debug!("Created upload {} for {}/{}", upload_id, bucket, key);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StoreResult<String> {
        self.counters.upload_part.fetch_add(1, Ordering::SeqCst);
        self.dispatched.lock().push(part_number);

        let _in_flight = InFlight::enter(&self.counters);
        if let Some(latency) = self.part_latency {
            tokio::time::sleep(latency).await;
        }
        self.next_failure(|f| f.parts.get_mut(&part_number).and_then(|q| q.pop_front()))?;

        if part_number == 0 || part_number > self.max_part_count {
            return Err(StoreError::InvalidRequest(format!(
                "Part number {} out of range 1..={}",
                part_number, self.max_part_count
            )));
        }

        tracing::debug!(
            "Uploading part {} for upload {}, size: {} bytes",
            part_number,
            upload_id,
            data.len()
        );
        let mut uploads = self.uploads.lock();
        match uploads.get_mut(upload_id) {
            Some(upload) => Ok(upload.add_part(part_number, data)),
            None => Err(StoreError::NoSuchUpload(upload_id.to_string())),
        }
    }

    async fn complete(&self, upload_id: &str, parts: &[CompletedPart]) -> StoreResult<()> {
        self.counters.complete.fetch_add(1, Ordering::SeqCst);
        *self.last_completion.lock() = Some(parts.to_vec());
        self.next_failure(|f| f.complete.pop_front())?;

        let mut uploads = self.uploads.lock();
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| StoreError::NoSuchUpload(upload_id.to_string()))?;

        // A rejected completion leaves the upload in place so it can be aborted
        let data = upload.assemble(parts, self.min_part_size)?;
        let upload = uploads
            .remove(upload_id)
            .ok_or_else(|| StoreError::NoSuchUpload(upload_id.to_string()))?;
        drop(uploads);

        self.objects.lock().insert((upload.bucket, upload.key), data);
        Ok(())
    }

    async fn abort(&self, upload_id: &str) -> StoreResult<()> {
        self.counters.abort.fetch_add(1, Ordering::SeqCst);
        self.next_failure(|f| f.abort.pop_front())?;

        match self.uploads.lock().remove(upload_id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NoSuchUpload(upload_id.to_string())),
        }
    }

    async fn put_single(&self, bucket: &str, key: &str, data: Bytes) -> StoreResult<()> {
        self.counters.put_single.fetch_add(1, Ordering::SeqCst);
        self.next_failure(|f| f.put.pop_front())?;
        validate_bucket_name(bucket)?;
        validate_key(key)?;

        self.objects
            .lock()
            .insert((bucket.to_string(), key.to_string()), data);
        Ok(())
    }

    fn min_part_size(&self) -> u64 {
        self.min_part_size
    }

    fn max_part_count(&self) -> u32 {
        self.max_part_count
    }
}
