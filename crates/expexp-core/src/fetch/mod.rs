//! Fetching file contents on behalf of a scrape request.
//!
//! ```text
//!   request task                         blocking pool
//!  ┌───────────────────┐   spawn      ┌──────────────────────┐
//!  │ fetch(ctx, path)  │ ───────────▶ │ read_with_deadline() │
//!  │                   │              └──────────┬───────────┘
//!  │ timeout_at(rx)    │ ◀── oneshot ────────────┘
//!  └───────────────────┘
//! ```
//!
//! The blocking read runs on its own thread so the request can give up at
//! the deadline even if the read itself is stuck. The reader checks the same
//! deadline and always finishes, so abandoned tasks do not pile up.

pub mod reader;

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

pub use reader::{FileContents, PartialRead, initial_capacity, read_with_deadline};

/// Deadline used when the request does not carry one.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Reasons a fetch produced no data.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The file could not be opened.
    #[error("cannot open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The deadline passed before end-of-file was reached.
    #[error("deadline exceeded reading {} ({read} bytes read)", .path.display())]
    DeadlineExceeded { path: PathBuf, read: usize },

    /// Reading failed for a reason other than the deadline.
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The reader task ended without reporting a result.
    #[error("reader task for {} ended without a result", .path.display())]
    Aborted { path: PathBuf },
}

impl FetchError {
    /// True for deadline failures, which are counted separately.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::DeadlineExceeded { .. })
    }
}

/// Successful fetch result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    pub data: Vec<u8>,
    pub modified: Option<SystemTime>,
}

impl From<FileContents> for FetchOutcome {
    fn from(contents: FileContents) -> Self {
        Self {
            data: contents.data,
            modified: contents.modified,
        }
    }
}

/// Cancellation context of an inbound request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestContext {
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Context without a deadline; fetches fall back to [`DEFAULT_FETCH_TIMEOUT`].
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Returns a context whose deadline is the earlier of the current one and
    /// `now + timeout`.
    pub fn tightened(self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        match self.deadline {
            Some(existing) if existing <= candidate => self,
            _ => Self::with_deadline(candidate),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The deadline a fetch started now must honour.
    pub fn effective_deadline(&self) -> Instant {
        self.deadline
            .unwrap_or_else(|| Instant::now() + DEFAULT_FETCH_TIMEOUT)
    }
}

/// Reads `path` on the blocking pool and waits for the single outcome.
///
/// Partial data from a failed read is dropped here; only its length survives
/// in [`FetchError::DeadlineExceeded`].
pub async fn fetch(ctx: &RequestContext, path: &Path) -> Result<FetchOutcome, FetchError> {
    fetch_with(ctx, path, read_with_deadline).await
}

async fn fetch_with<R>(ctx: &RequestContext, path: &Path, read: R) -> Result<FetchOutcome, FetchError>
where
    R: FnOnce(&Path, std::time::Instant) -> Result<FileContents, PartialRead> + Send + 'static,
{
    let deadline = ctx.effective_deadline();
    let (tx, rx) = oneshot::channel();

    let owned = path.to_path_buf();
    let read_deadline = deadline.into_std();
    tokio::task::spawn_blocking(move || {
        let result = read(&owned, read_deadline);
        // The receiver is gone if the request was dropped or timed out first.
        let _ = tx.send(result);
    });

    match tokio::time::timeout_at(deadline, rx).await {
        Ok(Ok(Ok(contents))) => {
            debug!(path = %path.display(), bytes = contents.data.len(), "fetched file");
            Ok(contents.into())
        }
        Ok(Ok(Err(partial))) => {
            debug!(
                path = %path.display(),
                partial_bytes = partial.contents.data.len(),
                "discarding partial read"
            );
            Err(partial.source)
        }
        Ok(Err(_)) => Err(FetchError::Aborted {
            path: path.to_path_buf(),
        }),
        Err(_) => Err(FetchError::DeadlineExceeded {
            path: path.to_path_buf(),
            read: 0,
        }),
    }
}
