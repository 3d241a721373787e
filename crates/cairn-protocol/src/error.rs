use cairn_types::Status;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown command type: {0}")]
    UnknownCommand(u32),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("truncated {what}: have {have} bytes, need {need}")]
    Truncated { what: &'static str, have: usize, need: usize },

    #[error("attribute declares {declared} bytes but only {remaining} remain in the command")]
    AttributeOverflow { declared: u64, remaining: u64 },

    #[error("invalid field: {0}")]
    InvalidField(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Wire status for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::Io(e) => Status::from_io(e),
            _ => Status::EPROTO,
        }
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
