use std::fmt;

use serde::{Deserialize, Serialize};

/// Result code carried in the `status` field of every command header.
///
/// Zero means success; failures are negative errno values (Linux numbering)
/// so peers built on different platforms agree on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Status(i32);

impl Status {
    pub const OK: Self = Self(0);
    pub const ENOENT: Self = Self(-2);
    pub const EIO: Self = Self(-5);
    pub const ENOMEM: Self = Self(-12);
    pub const EEXIST: Self = Self(-17);
    pub const EINVAL: Self = Self(-22);
    pub const EPROTO: Self = Self(-71);
    pub const ENOTSUP: Self = Self(-95);
    pub const ECONNRESET: Self = Self(-104);
    pub const ETIMEDOUT: Self = Self(-110);

    pub const fn from_raw(code: i32) -> Self {
        Self(code)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Map an OS error onto a wire status, keeping the errno when there is one.
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) if code > 0 => Self(-code),
            _ => match err.kind() {
                std::io::ErrorKind::NotFound => Self::ENOENT,
                std::io::ErrorKind::AlreadyExists => Self::EEXIST,
                std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => Self::EINVAL,
                std::io::ErrorKind::TimedOut => Self::ETIMEDOUT,
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => Self::ECONNRESET,
                std::io::ErrorKind::OutOfMemory => Self::ENOMEM,
                _ => Self::EIO,
            },
        }
    }

    /// Symbolic name for the well-known codes.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::OK => "OK",
            Self::ENOENT => "ENOENT",
            Self::EIO => "EIO",
            Self::ENOMEM => "ENOMEM",
            Self::EEXIST => "EEXIST",
            Self::EINVAL => "EINVAL",
            Self::EPROTO => "EPROTO",
            Self::ENOTSUP => "ENOTSUP",
            Self::ECONNRESET => "ECONNRESET",
            Self::ETIMEDOUT => "ETIMEDOUT",
            _ => return None,
        };
        Some(name)
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::OK
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "Status({name})"),
            None => write!(f, "Status({})", self.0),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}
