use cairn_types::Status;

/// Errors from transform registration and identifier computation.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// A transform with this name is already registered.
    #[error("transform already registered: {0}")]
    AlreadyExists(String),

    /// No transform with this name is registered.
    #[error("transform not found: {0}")]
    NotFound(String),

    /// Every transform from the starting position failed (or none remain).
    #[error("no transform succeeded starting at position {start}")]
    Exhausted { start: usize },

    /// A single transform stage failed.
    #[error("transform {name} failed: {reason}")]
    Failed { name: String, reason: String },

    /// The region to hash lies outside the file.
    #[error("region {offset}+{size} exceeds file length {len}")]
    InvalidRegion { offset: u64, size: u64, len: u64 },

    /// I/O error while opening or mapping a file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransformError {
    /// Wire status for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::AlreadyExists(_) => Status::EEXIST,
            Self::NotFound(_) | Self::Exhausted { .. } => Status::ENOENT,
            Self::Failed { .. } | Self::InvalidRegion { .. } => Status::EINVAL,
            Self::Io(e) => Status::from_io(e),
        }
    }
}

/// Result alias for transform operations.
pub type TransformResult<T> = Result<T, TransformError>;
