use std::io;

use thiserror::Error;

/// An error produced by the wire readers and writers.
#[derive(Debug, Error)]
pub enum WireError {
    /// The stream ended in the middle of a value.
    #[error("unexpected end of stream")]
    UnexpectedEof,
    /// The bytes on the stream do not form a valid encoding.
    #[error("corrupted stream: {0}")]
    Corrupted(String),
    /// A value could not be encoded by the object codec.
    #[error("cannot marshal value of type {type_name}: {reason}")]
    NonSerializable {
        /// The Rust type of the offending value.
        type_name: &'static str,
        /// What the codec reported.
        reason: String,
    },
    /// An I/O failure of the underlying channel.
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// Whether this error is a read/write deadline expiring.
    pub fn is_timeout(&self) -> bool {
        match self {
            WireError::Io(e) => {
                matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
            }
            _ => false,
        }
    }
}

/// Map the `UnexpectedEof` I/O kind to the wire-level EOF error, leaving
/// every other kind (timeouts included) as an I/O error.
pub(crate) fn from_io(e: io::Error) -> WireError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        WireError::UnexpectedEof
    } else {
        WireError::Io(e)
    }
}
