use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Events emitted during indexing. Sinks must be cheap: they are called from
/// the hot loop at every suspension point.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Discovery finished; `files` candidates passed every filter.
    Discovered { files: usize },
    /// One file has been chunked (and enriched).
    FileChunked { path: String, chunks: usize },
    /// One file was reused verbatim from the previous store generation.
    FileReused { path: String, rows: usize },
    /// One file was skipped, with the reason already logged.
    FileSkipped { path: String },
    /// One embedding batch returned from the encoder.
    BatchEncoded { rows: usize, total_rows: usize },
    /// The new store generation has been renamed into place.
    StoreWritten { rows: usize },
}

/// Receiver for [`ProgressEvent`]s. The CLI renders these with a progress
/// bar; library callers that do not care pass [`NullSink`].
pub trait ProgressSink {
    fn emit(&self, event: &ProgressEvent);
}

/// Sink that discards every event.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// Cooperative cancellation flag, checked at suspension points: between
/// discovered files, between chunker outputs, between embedding batches and
/// before each top-level query step.
///
/// Once a long-running operation observes the flag it returns
/// [`Error::Cancelled`] and emits no further progress for that operation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Returns `Err(Cancelled)` once the token has been tripped.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Wall-clock deadline for query operations. On expiry an in-flight
/// similarity scan returns its partial best-k and the response is marked
/// partial; nothing is torn down.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline that never expires.
    pub fn none() -> Self {
        Self { at: None }
    }

    pub fn after(budget: Duration) -> Self {
        Self {
            at: Some(Instant::now() + budget),
        }
    }

    pub fn expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_trips_once_and_stays_tripped() {
        let token = CancelToken::new();
        assert!(token.checkpoint().is_ok());
        token.cancel();
        assert!(matches!(token.checkpoint(), Err(Error::Cancelled)));
        // Clones observe the same flag.
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn deadline_none_never_expires() {
        assert!(!Deadline::none().expired());
    }

    #[test]
    fn deadline_zero_budget_expires_immediately() {
        let d = Deadline::after(Duration::from_millis(0));
        assert!(d.expired());
    }
}
