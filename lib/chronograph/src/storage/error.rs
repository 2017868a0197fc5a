use std::error::Error;
use std::io;
use thiserror::Error;

/// An error related to storage operations (reads, writes...).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Error from the OS I/O layer.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Error related to data corruption.
    #[error(transparent)]
    Corruption(#[from] CorruptionError),
    /// The store has been switched to read-only after a corruption was
    /// detected; writes are refused.
    #[error("The store is read-only after a corruption was detected")]
    ReadOnly,
    /// An atom exceeds the per-atom size cap.
    #[error("The term is {0} bytes long, more than the maximum of {1}")]
    AtomTooLarge(usize, usize),
    #[doc(hidden)]
    #[error("{0}")]
    Other(#[source] Box<dyn Error + Send + Sync + 'static>),
}

impl From<StorageError> for io::Error {
    #[inline]
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Io(error) => error,
            StorageError::Corruption(error) => error.into(),
            StorageError::ReadOnly => Self::new(io::ErrorKind::PermissionDenied, error.to_string()),
            StorageError::AtomTooLarge(..) => {
                Self::new(io::ErrorKind::InvalidInput, error.to_string())
            }
            StorageError::Other(error) => Self::other(error),
        }
    }
}

/// An error returned if some content of the database is corrupted.
#[derive(Debug, Error)]
pub enum CorruptionError {
    /// A file does not start with the expected magic number or carries an
    /// unsupported format version.
    #[error("Bad header for {file}: {reason}")]
    BadHeader { file: String, reason: String },
    /// A page or record checksum did not validate.
    #[error("Checksum mismatch in {0}")]
    ChecksumMismatch(String),
    /// The write-ahead log is corrupted before the torn-write boundary.
    #[error("The write-ahead log is corrupted: {0}")]
    WalCorruption(String),
    /// The atom hash index is inconsistent with the atom blob.
    #[error("The atom index is corrupted: {0}")]
    CorruptAtomIndex(String),
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    Other(#[source] Box<dyn Error + Send + Sync + 'static>),
}

impl CorruptionError {
    /// Builds an error from a printable error message.
    #[inline]
    pub(crate) fn msg(msg: impl Into<String>) -> Self {
        Self::Msg(msg.into())
    }
}

impl From<CorruptionError> for io::Error {
    #[inline]
    fn from(error: CorruptionError) -> Self {
        Self::new(io::ErrorKind::InvalidData, error)
    }
}
