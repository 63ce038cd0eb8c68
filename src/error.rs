//! Error type shared by the packer, the unpacker and the filter stages.
//!
//! Producer stages (pack, filter) run on their own thread and hand their bytes to
//! the consumer through [`crate::pipe`]. When a producer fails, its [`Error`] is
//! boxed into the `std::io::Error` the consumer reads, and recovered again with
//! [`Error::from_stream`], so a cancelled pack shows up as [`Error::Cancelled`]
//! on the unpack side instead of a generic read failure.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open {}: {source}", path.display())]
    OpenFailure { path: PathBuf, source: io::Error },

    #[error("failed to write {}: {source}", path.display())]
    WriteFailure { path: PathBuf, source: io::Error },

    /// An entry name, symlink target or hardlink target resolves outside the destination root.
    #[error("{name:?} resolves outside of {}", root.display())]
    PathTraversal { name: String, root: PathBuf },

    #[error("unsupported entry type {kind} for {name:?}")]
    UnsupportedEntryType { name: String, kind: String },

    #[error("path exists but is not a directory: {}", path.display())]
    DirectoryConflict { path: PathBuf },

    #[error("malformed tar stream: {context}")]
    ReadCorruption {
        context: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("filter failed on {name:?}: {reason}")]
    FilterError { name: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(context: impl Into<String>) -> Self {
        Error::ReadCorruption {
            context: context.into(),
            source: None,
        }
    }

    /// Classify an error raised while reading a tar stream.
    ///
    /// Errors that a producer stage pushed into the pipe come back as the
    /// original [`Error`]; anything else is a [`Error::ReadCorruption`].
    pub fn from_stream(context: impl Into<String>, err: io::Error) -> Self {
        match Self::carried(err) {
            Ok(inner) => inner,
            Err(err) => Error::ReadCorruption {
                context: context.into(),
                source: Some(err),
            },
        }
    }

    /// Classify an error raised while appending to a tar builder.
    pub(crate) fn from_append(path: impl Into<PathBuf>, err: io::Error) -> Self {
        match Self::carried(err) {
            Ok(inner) => inner,
            Err(err) => Error::io("append", path, err),
        }
    }

    /// Unwrap an [`Error`] boxed inside `err`, or hand `err` back untouched.
    fn carried(err: io::Error) -> std::result::Result<Self, io::Error> {
        let carries_error = err
            .get_ref()
            .is_some_and(|inner| inner.downcast_ref::<Error>().is_some());
        if !carries_error {
            return Err(err);
        }

        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => Ok(*inner),
            Some(Err(other)) => Err(io::Error::new(kind, other)),
            None => Err(io::Error::from(kind)),
        }
    }

    /// Wrap this error so it can travel through a byte stream.
    ///
    /// The kind is never `Interrupted`: readers retry on that kind, and a
    /// failed pipe keeps returning the same error.
    pub(crate) fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::Other, self)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
