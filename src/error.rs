use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that escape to callers.
///
/// Recoverable conditions (a single unreadable file, a transient accelerator
/// hiccup, one text that fails to encode) are absorbed where they happen and
/// reported through logs and [`crate::indexer::Stats`]; only the kinds below
/// propagate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration detected before any I/O.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A file or directory operation failed where skipping is not an option
    /// (store reads and writes; everything per-file during indexing is
    /// logged and skipped instead).
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Discovery produced zero files across all roots.
    #[error("no source files discovered under the configured roots")]
    EmptyDiscovery,

    /// The accelerator failed and the CPU fallback failed too.
    #[error("embedding backend failed on every device: {0}")]
    DeviceFatal(String),

    /// Store integrity check failed on open; the store must be rebuilt.
    #[error("vector store is corrupt: {0}")]
    Corrupt(String),

    /// No store exists at the given directory.
    #[error("no vector store found at {0}")]
    NotFound(PathBuf),

    /// Stored embedding dimension disagrees with the configured model.
    #[error("embedding dimension mismatch: store has {stored}, configured {configured}")]
    DimMismatch { stored: usize, configured: usize },

    /// Another process holds the writer lock for this store directory.
    #[error("store directory is locked by another indexer: {0}")]
    Locked(PathBuf),

    /// Caller-initiated cancellation observed at a suspension point.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
