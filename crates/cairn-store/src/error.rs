use std::path::PathBuf;

use cairn_types::{ObjectId, Status};

/// Errors from object store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object was not found.
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// The requested range lies outside the stored object.
    #[error("range {offset}+{size} outside object {id} of {len} bytes")]
    OutOfRange { id: ObjectId, offset: u64, size: u64, len: u64 },

    /// A journal record could not be encoded.
    #[error("journal error: {0}")]
    Journal(String),

    /// I/O error on a specific path.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Wire status for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::NotFound(_) => Status::ENOENT,
            Self::OutOfRange { .. } => Status::EINVAL,
            Self::Journal(_) => Status::EIO,
            Self::Io { source, .. } => Status::from_io(source),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
