//! Per-part retry policy
//!
//! Failures are split into transient and permanent by [`classify`], a pure
//! function of the [`StoreError`]. Transient failures are retried with
//! exponential backoff and jitter up to [`RetryConfig::max_retries`] times;
//! permanent failures are returned on the first attempt.

use crate::error::{FailureKind, StoreError, StoreResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP 429 Too Many Requests
const TOO_MANY_REQUESTS: u16 = 429;

/// Classify a store error as transient or permanent
///
/// Transient: transport errors, HTTP 5xx, HTTP 429 and I/O errors of a
/// kind that usually clears up on its own. Everything else is permanent.
pub fn classify(err: &StoreError) -> FailureKind {
    match err {
        StoreError::Transport(_) => FailureKind::Transient,
        StoreError::Status { status, .. } => {
            if *status == TOO_MANY_REQUESTS || (500..600).contains(status) {
                FailureKind::Transient
            } else {
                FailureKind::Permanent
            }
        }
        StoreError::Io { kind, .. } => match kind {
            io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => FailureKind::Transient,
            _ => FailureKind::Permanent,
        },
        StoreError::NoSuchUpload(_)
        | StoreError::InvalidPart { .. }
        | StoreError::InvalidPartOrder
        | StoreError::EntityTooSmall { .. }
        | StoreError::InvalidRequest(_) => FailureKind::Permanent,
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Upper bound of the first delay
    pub init_backoff: Duration,
    /// Cap on any single delay
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(15),
            base: 2.,
        }
    }
}

/// Jittered exponential backoff
///
/// Each delay is drawn uniformly from `init_backoff..previous * base` and
/// capped at `max_backoff`.
#[derive(Debug)]
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic backoff for tests
    pub fn with_seed(config: &BackoffConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &BackoffConfig, rng: StdRng) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
            rng,
        }
    }

    /// Delay to wait before the next attempt
    pub fn next(&mut self) -> Duration {
        let range = self.init_backoff..(self.next_backoff_secs * self.base);
        let rand_backoff = if range.is_empty() {
            self.init_backoff
        } else {
            self.rng.gen_range(range)
        };

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        Duration::from_secs_f64(std::mem::replace(&mut self.next_backoff_secs, next_backoff))
    }
}

/// Retry behaviour for a single part
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 disables retrying
    pub max_retries: u32,
    pub backoff: BackoffConfig,
}

/// A call that failed for good
#[derive(Debug)]
pub struct RetryError {
    pub source: StoreError,
    /// Calls made, including the first
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails permanently, or runs out of retries
///
/// `op` receives the 1-based attempt number. Once `halt` is set no further
/// attempts are started and the last error is returned. On success the
/// value is returned together with the number of attempts it took.
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    halt: &AtomicBool,
    mut op: F,
) -> Result<(T, u32), RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut backoff = Backoff::new(&config.backoff);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(err) => err,
        };

        let retries = attempt - 1;
        if !err.is_transient() || retries >= config.max_retries {
            return Err(RetryError {
                source: err,
                attempts: attempt,
            });
        }
        if halt.load(Ordering::Acquire) {
            debug!("Retry halted after attempt {}: {}", attempt, err);
            return Err(RetryError {
                source: err,
                attempts: attempt,
            });
        }

        let sleep = backoff.next();
        warn!(
            attempt,
            max_retries = config.max_retries,
            backoff_ms = sleep.as_millis() as u64,
            "Transient failure ({}), retrying",
            err
        );
        tokio::time::sleep(sleep).await;

        if halt.load(Ordering::Acquire) {
            return Err(RetryError {
                source: err,
                attempts: attempt,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            backoff: BackoffConfig {
                init_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                base: 2.,
            },
        }
    }

    #[test]
    fn test_classify_status_codes() {
        assert_eq!(classify(&StoreError::status(500, "")), FailureKind::Transient);
        assert_eq!(classify(&StoreError::status(503, "")), FailureKind::Transient);
        assert_eq!(classify(&StoreError::status(429, "")), FailureKind::Transient);

        assert_eq!(classify(&StoreError::status(400, "")), FailureKind::Permanent);
        assert_eq!(classify(&StoreError::status(403, "")), FailureKind::Permanent);
        assert_eq!(classify(&StoreError::status(404, "")), FailureKind::Permanent);
    }

    #[test]
    fn test_classify_other_errors() {
        assert_eq!(
            classify(&StoreError::Transport("connection reset".into())),
            FailureKind::Transient
        );
        assert_eq!(
            classify(&io::Error::from(io::ErrorKind::TimedOut).into()),
            FailureKind::Transient
        );
        assert_eq!(
            classify(&io::Error::from(io::ErrorKind::PermissionDenied).into()),
            FailureKind::Permanent
        );
        assert_eq!(
            classify(&StoreError::NoSuchUpload("x".into())),
            FailureKind::Permanent
        );
        assert_eq!(classify(&StoreError::InvalidPartOrder), FailureKind::Permanent);
    }

    #[test]
    fn test_backoff_bounded() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            base: 3.,
        };
        let mut backoff = Backoff::with_seed(&config, 42);

        // First delay is always the initial backoff
        assert_eq!(backoff.next(), Duration::from_millis(100));
        for _ in 0..50 {
            let sleep = backoff.next();
            assert!(sleep >= Duration::from_millis(100));
            assert!(sleep <= Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = &AtomicU32::new(0);
        let halt = AtomicBool::new(false);

        let (value, attempts) = retry_transient(&fast_config(3), &halt, move |_| async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::status(503, "Slow Down"))
            } else {
                Ok("etag")
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "etag");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_transient_exhausts_retries() {
        let halt = AtomicBool::new(false);
        let err = retry_transient(&fast_config(2), &halt, |_| async {
            Err::<(), _>(StoreError::Transport("reset".into()))
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(err.source, StoreError::Transport("reset".into()));
    }

    #[tokio::test]
    async fn test_permanent_not_retried() {
        let halt = AtomicBool::new(false);
        let err = retry_transient(&fast_config(5), &halt, |_| async {
            Err::<(), _>(StoreError::status(403, "Forbidden"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn test_halt_stops_retrying() {
        let halt = AtomicBool::new(true);
        let err = retry_transient(&fast_config(5), &halt, |_| async {
            Err::<(), _>(StoreError::status(500, "Internal"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 1);
    }
}
