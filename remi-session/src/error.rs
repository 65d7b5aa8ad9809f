use std::io;

use remi_wire::{Identifier, RemoteThrowable, WireError};
use thiserror::Error;

/// An error surfaced by the invocation runtime.
///
/// Channel-level faults (`Eof`, `Corrupted`, `Timeout`) kill the channel
/// they happened on, never the session. The runtime itself never retries;
/// retry policy belongs to the caller.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The peer closed the stream in the middle of a value.
    #[error("unexpected end of stream")]
    Eof,
    /// The bytes on a channel do not form a valid protocol encoding.
    #[error("corrupted stream: {0}")]
    Corrupted(String),
    /// A read or write deadline expired; the channel is discarded.
    #[error("invocation timed out")]
    Timeout,
    /// The target object is not (or no longer) exported by the peer.
    #[error("no such object {0}")]
    NoSuchObject(Identifier),
    /// The method identifier is unknown to the target's dispatch table.
    #[error("no such method {0}")]
    NoSuchMethod(Identifier),
    /// The target declares the method but its dispatch table predates it;
    /// the callee replies this as `NOT_OK` when caller and callee disagree
    /// on the interface version. Also raised locally when the metadata
    /// does not declare the requested method or invocation flavor.
    #[error("method not available: {0}")]
    UnimplementedMethod(String),
    /// An asynchronous invocation failed on the callee. Reported through
    /// the session error sink, never over the invocation channel.
    #[error("asynchronous invocation of {method} failed")]
    AsynchronousInvocation {
        /// The method that failed.
        method: String,
        /// What the handler raised.
        #[source]
        cause: RemoteThrowable,
    },
    /// The peer's method raised; the cause chain was rebuilt locally with
    /// the caller's frames stitched after the remote ones.
    #[error("remote invocation failed")]
    Remote(#[source] RemoteThrowable),
    /// An I/O or serialization fault while calling.
    #[error("remote failure: {0}")]
    RemoteFailure(String),
    /// A value could not be marshalled.
    #[error("cannot marshal: {0}")]
    NonSerializable(String),
    /// The session is shut down; every subsequent operation fails the
    /// same way.
    #[error("broker is closed")]
    BrokerClosed,
    /// Operation on the unconnected placeholder channel.
    #[error("channel is not connected")]
    NotConnected,
}

impl From<WireError> for RpcError {
    fn from(e: WireError) -> RpcError {
        match e {
            WireError::UnexpectedEof => RpcError::Eof,
            WireError::Corrupted(message) => RpcError::Corrupted(message),
            WireError::NonSerializable { .. } => RpcError::NonSerializable(e.to_string()),
            WireError::Io(io) => match io.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => RpcError::Timeout,
                io::ErrorKind::UnexpectedEof => RpcError::Eof,
                io::ErrorKind::NotConnected => RpcError::NotConnected,
                _ => RpcError::RemoteFailure(io.to_string()),
            },
        }
    }
}
