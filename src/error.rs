//! Error types shared by the board manager, the boards and the upload task.
//!
//! Every operation returns its own [`Result`]; there is no global error
//! state. Use [`Error::kind`] to branch on the class of failure without
//! matching on the variant payloads.

use std::io;

use thiserror::Error;

/// Fieldless classification of an [`Error`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    NotFound,
    Access,
    Io,
    Unsupported,
    Param,
    System,
    IncompatibleFirmware,
    UploadTimeout,
    TransferFailed,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum Error {
    /// A board, model, mode or device could not be found.
    #[error("{0}")]
    NotFound(String),

    /// Permission denied while opening a device.
    #[error("permission denied: {0}")]
    Access(String),

    /// Transient transport failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// The operation needs a capability the board lacks in its current mode.
    #[error("{0}")]
    Unsupported(String),

    /// Invalid caller input.
    #[error("invalid parameter: {0}")]
    Param(String),

    /// Unexpected failure of a platform call.
    #[error("system error: {0}")]
    System(String),

    /// None of the candidate images targets the board model.
    #[error("no firmware compatible with {model}")]
    IncompatibleFirmware { model: String },

    /// A bounded wait on the board expired.
    #[error("timed out while waiting for {0}")]
    UploadTimeout(String),

    /// The transfer failed after `written` of `total` bytes.
    #[error("firmware transfer failed after {written}/{total} bytes: {reason}")]
    TransferFailed {
        written: usize,
        total: usize,
        reason: String,
    },

    /// The upload task was cancelled after `written` bytes.
    #[error("upload cancelled after {written} bytes")]
    Cancelled { written: usize },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Access(_) => ErrorKind::Access,
            Error::Io(_) => ErrorKind::Io,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Param(_) => ErrorKind::Param,
            Error::System(_) => ErrorKind::System,
            Error::IncompatibleFirmware { .. } => ErrorKind::IncompatibleFirmware,
            Error::UploadTimeout(_) => ErrorKind::UploadTimeout,
            Error::TransferFailed { .. } => ErrorKind::TransferFailed,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// `true` when some bytes reached the device before the failure, i.e. the
    /// board flash is now in an unknown state.
    pub fn is_partial(&self) -> bool {
        match self {
            Error::TransferFailed { written, .. } | Error::Cancelled { written } => *written > 0,
            _ => false,
        }
    }

    /// Prefix the message with `context`, keeping the kind and the payload.
    pub fn context(self, context: &str) -> Error {
        let wrap = |message: String| format!("{}: {}", context, message);
        match self {
            Error::NotFound(m) => Error::NotFound(wrap(m)),
            Error::Access(m) => Error::Access(wrap(m)),
            Error::Io(m) => Error::Io(wrap(m)),
            Error::Unsupported(m) => Error::Unsupported(wrap(m)),
            Error::Param(m) => Error::Param(wrap(m)),
            Error::System(m) => Error::System(wrap(m)),
            Error::UploadTimeout(m) => Error::UploadTimeout(wrap(m)),
            Error::TransferFailed {
                written,
                total,
                reason,
            } => Error::TransferFailed {
                written,
                total,
                reason: wrap(reason),
            },
            other => other,
        }
    }

    /// Transient errors may be retried by the caller.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Io
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            io::ErrorKind::PermissionDenied => Error::Access(err.to_string()),
            io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Error::Io(err.to_string()),
            _ => Error::System(err.to_string()),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => Error::NotFound(err.description),
            serialport::ErrorKind::InvalidInput => Error::Param(err.description),
            serialport::ErrorKind::Io(kind) => io::Error::new(kind, err.description).into(),
            serialport::ErrorKind::Unknown => Error::System(err.description),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn io_errors_map_to_kinds() {
    let denied: Error = io::Error::new(io::ErrorKind::PermissionDenied, "/dev/ttyACM0").into();
    assert_eq!(denied.kind(), ErrorKind::Access);

    let timeout: Error = io::Error::new(io::ErrorKind::TimedOut, "read").into();
    assert_eq!(timeout.kind(), ErrorKind::Io);
    assert!(timeout.is_transient());

    let other: Error = io::Error::new(io::ErrorKind::Other, "boom").into();
    assert_eq!(other.kind(), ErrorKind::System);
}

#[test]
fn serialport_errors_map_to_kinds() {
    let gone: Error = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone").into();
    assert_eq!(gone.kind(), ErrorKind::NotFound);

    let denied: Error = serialport::Error::new(
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied),
        "busy",
    )
    .into();
    assert_eq!(denied.kind(), ErrorKind::Access);
}

#[test]
fn partial_transfer_is_distinct() {
    let before = Error::TransferFailed {
        written: 0,
        total: 1024,
        reason: "no answer".into(),
    };
    let during = Error::TransferFailed {
        written: 256,
        total: 1024,
        reason: "no answer".into(),
    };
    assert!(!before.is_partial());
    assert!(during.is_partial());
    assert!(Error::Cancelled { written: 128 }.is_partial());
    assert!(!Error::NotFound("board".into()).is_partial());
}

#[test]
fn context_keeps_the_kind() {
    let err = Error::Io("unexpected answer 0x3f to 'E'".into()).context("image verified");
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(
        err.to_string(),
        "I/O error: image verified: unexpected answer 0x3f to 'E'"
    );

    let cancelled = Error::Cancelled { written: 64 }.context("ignored");
    assert!(cancelled.is_partial());
}
