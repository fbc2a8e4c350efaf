//! Multipart upload coordinator
//!
//! Drives one upload end to end:
//!
//! 1. validate the request and plan the parts
//! 2. payloads that fit in one part go through [`ObjectStore::put_single`]
//! 3. otherwise initiate a session and upload parts on a [`JoinSet`] capped
//!    at `max_concurrency` tasks, retrying transient failures per part
//! 4. complete with the parts sorted by number, or abort on the first failure
//!
//! The coordinator loop is the only consumer of part results, so the first
//! failure it observes is the one reported, however the tasks race. After a
//! failure no new parts are dispatched, in-flight parts are awaited and their
//! results discarded, and the session is aborted exactly once. An abort that
//! fails is logged and never replaces the error that caused it.

use crate::config::UploadConfig;
use crate::error::{UploadError, UploadResult};
use crate::part::{part_count, plan_parts, CompletedPart, PartDescriptor, PartResult};
use crate::retry::{retry_transient, RetryConfig};
use crate::source::PartSource;
use crate::store::ObjectStore;
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// What to upload and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub bucket: String,
    pub key: String,
    /// Bytes to read from the source, starting at offset 0
    pub total_size: u64,
    /// Overrides [`UploadConfig::part_size`]
    pub part_size: Option<u64>,
    /// Overrides [`UploadConfig::max_concurrency`]
    pub max_concurrency: Option<usize>,
}

impl UploadRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, total_size: u64) -> Self {
        UploadRequest {
            bucket: bucket.into(),
            key: key.into(),
            total_size,
            part_size: None,
            max_concurrency: None,
        }
    }

    pub fn part_size(mut self, part_size: u64) -> Self {
        self.part_size = Some(part_size);
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }
}

/// Outcome of a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub bucket: String,
    pub key: String,
    /// `None` when the payload went up in a single request
    pub upload_id: Option<String>,
    pub parts: usize,
    pub bytes: u64,
    /// Attempts beyond the first, summed over all parts
    pub retries: u32,
    pub elapsed: Duration,
}

/// State of one in-progress multipart upload
///
/// Owned by the coordinator call that initiated it.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub total_size: u64,
    pub part_size: u64,
    /// Successful parts in arrival order
    pub parts: Vec<PartResult>,
}

impl UploadSession {
    /// Part listing for completion, sorted by part number
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        let mut parts: Vec<CompletedPart> = self.parts.iter().map(CompletedPart::from).collect();
        parts.sort_by_key(|p| p.part_number);
        parts
    }

    pub fn retries(&self) -> u32 {
        self.parts.iter().map(|p| p.attempts.saturating_sub(1)).sum()
    }
}

/// Validated request with its parts
#[derive(Debug)]
struct Plan {
    part_size: u64,
    max_concurrency: usize,
    parts: Vec<PartDescriptor>,
}

/// Uploads large payloads as concurrent multipart uploads
pub struct MultipartUploadCoordinator {
    store: Arc<dyn ObjectStore>,
    config: UploadConfig,
    retry: RetryConfig,
}

impl MultipartUploadCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>, config: UploadConfig) -> Self {
        let retry = config.retry_config();
        MultipartUploadCoordinator {
            store,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Upload `request.total_size` bytes of `source`
    pub async fn upload(
        &self,
        request: UploadRequest,
        source: Arc<dyn PartSource>,
    ) -> UploadResult<UploadSummary> {
        self.upload_with_cancel(request, source, std::future::pending())
            .await
    }

    /// Like [`upload`](Self::upload), stopping early once `cancel` resolves
    ///
    /// Cancellation aborts every in-flight part, waits for them to wind
    /// down, aborts the session and returns [`UploadError::Cancelled`]. The
    /// configured upload timeout is handled the same way and reported as
    /// [`UploadError::TimedOut`].
    pub async fn upload_with_cancel<C>(
        &self,
        request: UploadRequest,
        source: Arc<dyn PartSource>,
        cancel: C,
    ) -> UploadResult<UploadSummary>
    where
        C: Future<Output = ()>,
    {
        let started = Instant::now();
        let plan = self.plan(&request)?;

        let timeout = self.config.upload_timeout();
        let interrupt = async move {
            let deadline = async move {
                match timeout {
                    Some(limit) => {
                        tokio::time::sleep(limit).await;
                        limit
                    }
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = cancel => UploadError::Cancelled,
                limit = deadline => UploadError::TimedOut(limit),
            }
        };
        tokio::pin!(interrupt);

        let result = if plan.parts.len() == 1 {
            self.upload_single(&request, &plan.parts[0], source, interrupt.as_mut())
                .await
        } else {
            self.upload_multipart(&request, plan, source, interrupt.as_mut())
                .await
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok((upload_id, parts, retries)) => {
                info!(
                    bucket = %request.bucket,
                    key = %request.key,
                    parts,
                    retries,
                    bytes = request.total_size,
                    elapsed_ms,
                    outcome = "completed",
                    "Upload finished"
                );
                Ok(UploadSummary {
                    bucket: request.bucket,
                    key: request.key,
                    upload_id,
                    parts,
                    bytes: request.total_size,
                    retries,
                    elapsed: started.elapsed(),
                })
            }
            Err(err) => {
                error!(
                    bucket = %request.bucket,
                    key = %request.key,
                    part_number = err.part_number(),
                    elapsed_ms,
                    outcome = "failed",
                    "Upload failed: {}",
                    err
                );
                Err(err)
            }
        }
    }

    fn plan(&self, request: &UploadRequest) -> UploadResult<Plan> {
        let part_size = request.part_size.unwrap_or(self.config.part_size);
        let max_concurrency = request
            .max_concurrency
            .unwrap_or(self.config.max_concurrency);

        if request.total_size == 0 {
            return Err(UploadError::InvalidArgument(
                "total size must be greater than 0".to_string(),
            ));
        }
        if part_size == 0 {
            return Err(UploadError::InvalidArgument(
                "part size must be greater than 0".to_string(),
            ));
        }
        if max_concurrency == 0 {
            return Err(UploadError::InvalidArgument(
                "max concurrency must be at least 1".to_string(),
            ));
        }

        let count = part_count(request.total_size, part_size);
        if count > 1 {
            let min = self.store.min_part_size();
            if part_size < min {
                return Err(UploadError::InvalidArgument(format!(
                    "part size {} is below the store minimum of {} bytes",
                    part_size, min
                )));
            }
            let max_parts = self.store.max_part_count();
            if count > u64::from(max_parts) {
                return Err(UploadError::InvalidArgument(format!(
                    "{} bytes in parts of {} bytes needs {} parts, store allows {}",
                    request.total_size, part_size, count, max_parts
                )));
            }
        }

        let parts = plan_parts(request.total_size, part_size).ok_or_else(|| {
            UploadError::InvalidArgument(format!(
                "{} bytes in parts of {} bytes needs {} parts, more than can be numbered",
                request.total_size, part_size, count
            ))
        })?;

        Ok(Plan {
            part_size,
            max_concurrency,
            parts,
        })
    }

    async fn upload_single<I>(
        &self,
        request: &UploadRequest,
        part: &PartDescriptor,
        source: Arc<dyn PartSource>,
        mut interrupt: Pin<&mut I>,
    ) -> UploadResult<(Option<String>, usize, u32)>
    where
        I: Future<Output = UploadError>,
    {
        debug!(
            "Payload of {} bytes fits in one part, uploading {}/{} directly",
            part.length, request.bucket, request.key
        );

        let work = async {
            let data = read_part(source.as_ref(), part).await?;
            let halt = AtomicBool::new(false);
            let (_, attempts) = retry_transient(&self.retry, &halt, |_| {
                self.store
                    .put_single(&request.bucket, &request.key, data.clone())
            })
            .await
            .map_err(|e| UploadError::PutFailed {
                bucket: request.bucket.clone(),
                key: request.key.clone(),
                attempts: e.attempts,
                source: e.source,
            })?;
            Ok((None, 1, attempts - 1))
        };

        tokio::select! {
            biased;
            err = interrupt.as_mut() => Err(err),
            result = work => result,
        }
    }

    async fn upload_multipart<I>(
        &self,
        request: &UploadRequest,
        plan: Plan,
        source: Arc<dyn PartSource>,
        interrupt: Pin<&mut I>,
    ) -> UploadResult<(Option<String>, usize, u32)>
    where
        I: Future<Output = UploadError>,
    {
        let upload_id = self
            .store
            .initiate(&request.bucket, &request.key)
            .await
            .map_err(|source| UploadError::InitiateFailed {
                bucket: request.bucket.clone(),
                key: request.key.clone(),
                source,
            })?;

        info!(
            bucket = %request.bucket,
            key = %request.key,
            upload_id = %upload_id,
            parts = plan.parts.len(),
            part_size = plan.part_size,
            max_concurrency = plan.max_concurrency,
            "Initiated multipart upload"
        );

        let mut session = UploadSession {
            upload_id,
            bucket: request.bucket.clone(),
            key: request.key.clone(),
            total_size: request.total_size,
            part_size: plan.part_size,
            parts: Vec::with_capacity(plan.parts.len()),
        };
        let part_total = plan.parts.len();

        if let Err(err) = self
            .upload_parts(&mut session, plan, source, interrupt)
            .await
        {
            self.rollback(&session.upload_id).await;
            return Err(err);
        }

        debug_assert_eq!(session.parts.len(), part_total);
        let completed = session.completed_parts();
        if let Err(source) = self.store.complete(&session.upload_id, &completed).await {
            self.rollback(&session.upload_id).await;
            return Err(UploadError::CompletionFailed {
                upload_id: session.upload_id,
                source,
            });
        }

        let retries = session.retries();
        Ok((Some(session.upload_id), part_total, retries))
    }

    /// Upload every planned part, stopping at the first failure
    ///
    /// Returns only once every spawned task has finished.
    async fn upload_parts<I>(
        &self,
        session: &mut UploadSession,
        plan: Plan,
        source: Arc<dyn PartSource>,
        mut interrupt: Pin<&mut I>,
    ) -> UploadResult<()>
    where
        I: Future<Output = UploadError>,
    {
        let upload_id: Arc<str> = Arc::from(session.upload_id.as_str());
        let halt = Arc::new(AtomicBool::new(false));
        let mut tasks: JoinSet<UploadResult<PartResult>> = JoinSet::new();
        let mut pending = plan.parts.into_iter();
        let mut failure: Option<UploadError> = None;

        loop {
            if failure.is_none() {
                while tasks.len() < plan.max_concurrency {
                    let Some(part) = pending.next() else { break };
                    tasks.spawn(upload_part_task(
                        self.store.clone(),
                        upload_id.clone(),
                        part,
                        source.clone(),
                        self.retry.clone(),
                        halt.clone(),
                    ));
                }
            }

            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                err = interrupt.as_mut() => {
                    warn!(
                        upload_id = %session.upload_id,
                        in_flight = tasks.len(),
                        "Upload interrupted, stopping in-flight parts"
                    );
                    halt.store(true, Ordering::Release);
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Err(failure.unwrap_or(err));
                }
                joined = tasks.join_next() => joined,
            };

            let outcome = match joined {
                Some(Ok(outcome)) => outcome,
                Some(Err(join_err)) => Err(UploadError::Internal(format!(
                    "part task failed: {}",
                    join_err
                ))),
                None => break,
            };

            match outcome {
                Ok(result) if failure.is_none() => session.parts.push(result),
                Ok(result) => {
                    debug!("Discarding part {} after earlier failure", result.part_number);
                }
                Err(err) if failure.is_none() => {
                    warn!(
                        upload_id = %session.upload_id,
                        part_number = err.part_number(),
                        in_flight = tasks.len(),
                        "Part failed, draining in-flight parts before rollback: {}",
                        err
                    );
                    halt.store(true, Ordering::Release);
                    failure = Some(err);
                }
                Err(err) => {
                    debug!("Discarding failure after earlier failure: {}", err);
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Abort a session, best effort
    async fn rollback(&self, upload_id: &str) {
        match self.store.abort(upload_id).await {
            Ok(()) => info!(upload_id, outcome = "aborted", "Aborted multipart upload"),
            Err(err) => warn!(
                upload_id,
                outcome = "abort_failed",
                "Failed to abort multipart upload, uploaded parts may linger: {}",
                err
            ),
        }
    }
}

/// Read one part's bytes, treating a short read as truncation
async fn read_part(source: &dyn PartSource, part: &PartDescriptor) -> UploadResult<Bytes> {
    let data = source
        .read_range(part.range())
        .await
        .map_err(|source| UploadError::SourceRead {
            part_number: part.part_number,
            source,
        })?;

    if data.len() as u64 != part.length {
        return Err(UploadError::SourceRead {
            part_number: part.part_number,
            source: io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {} bytes, source returned {}", part.length, data.len()),
            ),
        });
    }
    Ok(data)
}

async fn upload_part_task(
    store: Arc<dyn ObjectStore>,
    upload_id: Arc<str>,
    part: PartDescriptor,
    source: Arc<dyn PartSource>,
    retry: RetryConfig,
    halt: Arc<AtomicBool>,
) -> UploadResult<PartResult> {
    let started = Instant::now();
    let data = read_part(source.as_ref(), &part).await?;

    let (etag, attempts) = retry_transient(&retry, &halt, |_| {
        let store = store.clone();
        let upload_id = upload_id.clone();
        let data = data.clone();
        async move { store.upload_part(&upload_id, part.part_number, data).await }
    })
    .await
    .map_err(|e| UploadError::PartPermanentFailure {
        part_number: part.part_number,
        attempts: e.attempts,
        source: e.source,
    })?;

    debug!(
        upload_id = %upload_id,
        part_number = part.part_number,
        attempts,
        bytes = part.length,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Uploaded part"
    );

    Ok(PartResult {
        part_number: part.part_number,
        etag,
        attempts,
        bytes: part.length,
    })
}
