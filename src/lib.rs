//! # chunkup - Concurrent Multipart Uploads
//!
//! `chunkup-rs` uploads large payloads to S3-compatible object stores using
//! the multipart upload protocol:
//!
//! - **Fixed-size parts** planned up front, the last part carrying the remainder
//! - **Bounded concurrency**: at most `max_concurrency` parts in flight
//! - **Per-part retries** with jittered exponential backoff for transient failures
//! - **Rollback**: the first permanent failure aborts the session, leaving no
//!   dangling upload behind
//!
//! The store itself is a collaborator behind the [`ObjectStore`] trait. Two
//! implementations ship with the crate: [`MemoryStore`] and the
//! filesystem-backed [`LocalStore`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use chunkup_rs::{LocalStore, MultipartUploadCoordinator, UploadConfig, UploadRequest};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(LocalStore::new("/var/lib/chunkup"));
//! let config = UploadConfig::from_file("chunkup.toml")?;
//! let coordinator = MultipartUploadCoordinator::new(store, config);
//!
//! let payload = Bytes::from(vec![0u8; 64 * 1024 * 1024]);
//! let request = UploadRequest::new("backups", "2024/db.dump", payload.len() as u64);
//! let summary = coordinator.upload(request, Arc::new(payload)).await?;
//!
//! println!("uploaded {} bytes in {} parts", summary.bytes, summary.parts);
//! # Ok(())
//! # }
//! ```
//!
//! ## Uploading a file
//!
//! ```rust,no_run
//! use chunkup_rs::{FileSource, MemoryStore, MultipartUploadCoordinator, UploadConfig, UploadRequest};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let source = FileSource::open("video.mp4").await?;
//! let request = UploadRequest::new("media", "video.mp4", source.len())
//!     .part_size(16 * 1024 * 1024)
//!     .max_concurrency(8);
//!
//! let coordinator = MultipartUploadCoordinator::new(Arc::new(MemoryStore::new()), UploadConfig::default());
//! coordinator
//!     .upload_with_cancel(request, Arc::new(source), async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fs;
pub mod memory;
pub mod part;
pub mod retry;
pub mod source;
pub mod store;
pub mod utils;

pub use config::{BackoffSettings, UploadConfig};
pub use coordinator::{MultipartUploadCoordinator, UploadRequest, UploadSession, UploadSummary};
pub use error::{ConfigError, FailureKind, StoreError, StoreResult, UploadError, UploadResult};
pub use fs::LocalStore;
pub use memory::{CallCounts, MemoryStore};
pub use part::{part_count, plan_parts, CompletedPart, PartDescriptor, PartResult};
pub use retry::{classify, BackoffConfig, RetryConfig};
pub use source::{FileSource, PartSource};
pub use store::{ObjectStore, DEFAULT_MAX_PART_COUNT, DEFAULT_MIN_PART_SIZE};
