//! Sorting error.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::path::PathBuf;
use std::sync::PoisonError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SortError>;

/// Sorting error.
///
/// Every failure is fatal to the run; there is no retry or skip. The only
/// tolerated failure is temporary-chunk deletion, which is logged and ignored
/// at the call site and never reaches this type.
#[derive(Debug)]
pub enum SortError {
    /// Impossible configuration: zero buffer budgets, bad ratio, bad separator.
    Config(String),
    /// I/O failure carrying the file it happened on.
    Io { path: PathBuf, source: io::Error },
    /// Broken file: length not a multiple of the record size, or an empty chunk.
    Format { path: PathBuf, detail: String },
    /// Internal invariant violation: gate overflow, poisoned lock, lost result.
    Invariant(String),
    /// One or more workers failed; collected after all threads joined.
    Workers(Vec<(u32, SortError)>),
}

impl SortError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SortError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn format(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        SortError::Format {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SortError::Io { source, .. } => Some(source),
            SortError::Workers(failures) => failures.first().map(|(_, e)| e as &(dyn Error + 'static)),
            _ => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortError::Config(msg) => write!(f, "configuration error: {}", msg),
            SortError::Io { path, source } => {
                write!(f, "I/O error on '{}': {}", path.display(), source)
            }
            SortError::Format { path, detail } => {
                write!(f, "file '{}' is broken: {}", path.display(), detail)
            }
            SortError::Invariant(msg) => write!(f, "invariant violation: {}", msg),
            SortError::Workers(failures) => {
                write!(f, "{} worker(s) failed: ", failures.len())?;
                for (i, (worker, err)) in failures.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "worker [{}]: {}", worker, err)?;
                }
                Ok(())
            }
        }
    }
}

/// A poisoned pipeline lock means another worker panicked while holding it.
pub(crate) fn poisoned<T>(_: PoisonError<T>) -> SortError {
    SortError::Invariant("pipeline lock poisoned by a panicked worker".into())
}
