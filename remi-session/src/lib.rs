//! Bidirectional remote-method invocation over one transport.
//!
//! Two processes share a single connection-oriented byte transport (the
//! [`Wire`]) and expose typed remote objects to one another: each side is
//! simultaneously client and server, and invokes the peer's methods as
//! though they were local. Invocations may be synchronous (request/reply
//! with a reconstructed failure on error), asynchronous (fire-and-forget,
//! or with a deferred reply), or open a user-controlled bidirectional
//! [`InvocationPipe`] after dispatch.
//!
//! ## Implementation details
//!
//! The components of a session are:
//!
//! - The `Multiplexer` frames the wire into virtual full-duplex channels,
//!   so any number of concurrent invocations share the one transport; a
//!   pump thread routes inbound frames.
//! - The `Broker` pools idle outbound channels: an invocation prefers a
//!   recycled channel, opens a fresh one otherwise, and blocks at the
//!   configured capacity. Idle channels are retired after a timeout; a
//!   poisoned channel never returns to the pool.
//! - The `Registry` holds the per-session object maps: exported
//!   identifiers to their dispatch tables (strong), imported identifiers
//!   to stubs (weak, shared so stub identity comparisons make sense), and
//!   the cache of [`RemoteInfo`] type metadata.
//! - A [`Skeleton`] is the per-object dispatch table built at
//!   registration: one handler per declared method, indexed by ordinal. A
//!   [`Stub`] is the local proxy marshalling calls to the peer.
//! - The [`Session`] owns all of it, plus the accept loop handing inbound
//!   channels to invocation workers, the control plane (type bootstrap,
//!   reference diffs, detach, root object), and the reference collector
//!   that reclaims unreferenced exports with generation-checked drops.
//!
//! A call flows as: the stub draws a channel from the broker, writes the
//! target and method identifiers and the marshalled parameters, flushes,
//! and reads the status byte plus either the result or a serialized
//! throwable chain, which it rebuilds into [`RpcError::Remote`] with the
//! remote frames ahead of the local call site. On the peer, an invocation
//! worker reads the identifiers, looks up the skeleton, unmarshals the
//! parameters by their declared kinds, invokes the handler and writes the
//! reply onto the same channel, which then serves the next invocation.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

pub use remi_wire::{
    Identifier, InvocationInput, InvocationOutput, ObjectCodec, RemoteThrowable, ReplyStatus,
    StackFrame, ThrowableInfo, ThrowablePayload, VersionedIdentifier, WireError,
};

pub use channel::{ChannelReader, ChannelWriter, InvocationChannel, InvocationPipe};
pub use error::RpcError;
pub use info::{
    ParamKind, RemoteHandle, RemoteInfo, RemoteMethod, RemoteParameter, RemoteRef, Value,
};
pub use mux::Wire;
pub use session::{Export, Session, SessionConfig, SessionServer, SessionStatus};
pub use skeleton::{AsyncHandler, PipeHandler, Skeleton, SyncHandler};
pub use stub::{PendingReply, Stub};

mod broker;
mod channel;
mod control;
mod dgc;
mod error;
mod info;
mod marshal;
mod mux;
mod registry;
mod session;
mod skeleton;
mod stub;
