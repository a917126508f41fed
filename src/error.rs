//! Error kinds for graphics commands and their wire representation.
//!
//! Every failure that aborts a command collapses into a [`CommandError`]:
//! a wire code plus a human-readable detail. The engine serializes it as
//! `E<NAME>: <detail>` inside the response escape sequence.

use thiserror::Error;

/// Wire-level error code reported back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed command: bad key, unparsable value, contradictory flags.
    Einval,
    /// Image or placement lookup miss.
    Enoent,
    /// Cannot open or decode a file.
    Ebadf,
    /// I/O failure while copying or writing.
    Eio,
    /// A per-image or per-placement size budget was exceeded.
    Efbig,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Einval => "EINVAL",
            ErrorCode::Enoent => "ENOENT",
            ErrorCode::Ebadf => "EBADF",
            ErrorCode::Eio => "EIO",
            ErrorCode::Efbig => "EFBIG",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command failure: wire code plus detail message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {detail}")]
pub struct CommandError {
    pub code: ErrorCode,
    pub detail: String,
}

impl CommandError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn einval(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Einval, detail)
    }

    pub fn enoent(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Enoent, detail)
    }

    pub fn ebadf(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Ebadf, detail)
    }

    pub fn eio(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Eio, detail)
    }

    pub fn efbig(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Efbig, detail)
    }
}
