//! Error types shared by the dispatcher, handle, and map layers.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Result type for sluice operations.
pub type IoResult<T> = Result<T, IoError>;

/// Errors produced by dispatcher operations, handles, and mapped views.
///
/// The type is `Clone` because the outcome of an operation is shared by
/// every reference to that operation; the untyped OS cause is therefore
/// carried behind an `Arc`.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum IoError {
    /// Path does not exist.
    #[error("not found: {path}")]
    NotFound { path: PathBuf },

    /// Path already exists and exclusive creation was requested.
    #[error("already exists: {path}")]
    AlreadyExists { path: PathBuf },

    /// A directory operation was applied to a non-directory.
    #[error("not a directory: {path}")]
    NotADirectory { path: PathBuf },

    /// Directory removal on a non-empty directory.
    #[error("directory not empty: {path}")]
    NotEmpty { path: PathBuf },

    /// Permission denied by the operating system.
    #[error("permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// Any other operating-system I/O error, cause preserved.
    #[error("I/O error: {source}")]
    Io { source: Arc<io::Error> },

    /// A mapped-region offset or length violated the platform allocation
    /// granularity.
    #[error("misaligned region: offset {offset} / length {length} must be multiples of {granularity}")]
    Alignment {
        offset: u64,
        length: u64,
        granularity: u64,
    },

    /// A request was malformed (missing inbound handle, bad flag subset, ...).
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The dispatcher was destroyed while this operation was still pending.
    #[error("operation cancelled at dispatcher shutdown")]
    CancelledAtShutdown,

    /// An internal invariant was violated. Observing this value is itself
    /// unexpected: the dispatcher aborts the process when it detects one.
    #[error("internal invariant violated: {reason}")]
    Invariant { reason: String },
}

impl IoError {
    /// Creates a new `NotFound` error.
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Creates a new `AlreadyExists` error.
    pub fn already_exists(path: impl Into<PathBuf>) -> Self {
        Self::AlreadyExists { path: path.into() }
    }

    /// Creates a new `NotADirectory` error.
    pub fn not_a_directory(path: impl Into<PathBuf>) -> Self {
        Self::NotADirectory { path: path.into() }
    }

    /// Creates a new `NotEmpty` error.
    pub fn not_empty(path: impl Into<PathBuf>) -> Self {
        Self::NotEmpty { path: path.into() }
    }

    /// Creates a new `PermissionDenied` error.
    pub fn permission_denied(path: impl Into<PathBuf>) -> Self {
        Self::PermissionDenied { path: path.into() }
    }

    /// Creates a new `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Creates an `Alignment` error.
    pub fn misaligned(offset: u64, length: u64, granularity: u64) -> Self {
        Self::Alignment {
            offset,
            length,
            granularity,
        }
    }

    /// Classifies a `std::io::Error` with path context.
    ///
    /// Well-known kinds map to their dedicated variants; everything else is
    /// preserved as an [`IoError::Io`] with the OS cause attached.
    pub fn from_io_with_path(err: io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound { path },
            io::ErrorKind::AlreadyExists => Self::AlreadyExists { path },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            io::ErrorKind::NotADirectory => Self::NotADirectory { path },
            io::ErrorKind::DirectoryNotEmpty => Self::NotEmpty { path },
            _ => Self::Io {
                source: Arc::new(err),
            },
        }
    }

    /// Returns true if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
            || matches!(self, Self::Io { source } if source.kind() == io::ErrorKind::NotFound)
    }

    /// Returns true if this is an "already exists" error.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
            || matches!(self, Self::Io { source } if source.kind() == io::ErrorKind::AlreadyExists)
    }

    /// Returns true if this operation was cancelled by dispatcher shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::CancelledAtShutdown)
    }

    /// Returns the raw OS error code, where one was preserved.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io { source } => source.raw_os_error(),
            _ => None,
        }
    }
}

impl From<io::Error> for IoError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            source: Arc::new(err),
        }
    }
}

/// Reports a broken internal invariant and aborts the process.
///
/// Continuing after the operation registry and the completion chains
/// disagree risks silently losing chained I/O, so this never returns.
pub fn invariant_failure(reason: &str) -> ! {
    tracing::error!(reason, "internal invariant violated, aborting");
    std::process::abort();
}
