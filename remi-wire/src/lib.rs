//! The invocation wire format shared by both ends of a remote-invocation
//! session.
//!
//! Everything that travels inside an invocation channel is encoded by this
//! crate: stable 64-bit [`Identifier`]s and their versioned form used by
//! distributed garbage collection, the variable-length unsigned integer
//! used for counts, the compact string encoding, boxed primitives with an
//! explicit presence byte, codec-carried user objects with an
//! identity-preserving sharing scope, and the portable throwable chain a
//! failing peer sends back.
//!
//! The crate is deliberately transport-free: [`InvocationOutput`] and
//! [`InvocationInput`] wrap any `std::io::Write` / `std::io::Read`, and the
//! session runtime binds them to its channels.
//!
//! All multi-byte integers are big-endian on the wire.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

pub use codec::ObjectCodec;
pub use error::WireError;
pub use id::{Identifier, VersionedIdentifier, RESERVED_MAX};
pub use input::{InvocationInput, ReplyStatus};
pub use output::InvocationOutput;
pub use throwable::{RemoteThrowable, StackFrame, ThrowableInfo, ThrowablePayload};

mod codec;
mod error;
mod id;
mod input;
mod output;
mod throwable;

/// Sentinel byte for an absent value; also the in-value null tag.
pub const NULL: u8 = 0;
/// Presence byte preceding a boxed primitive that is not null.
pub const NOT_NULL: u8 = 1;
/// Reply status: the invocation completed, boolean result `false`.
pub const OK_FALSE: u8 = 1;
/// Reply status: the invocation completed, boolean result `true` (also the
/// generic success status for non-boolean results).
pub const OK_TRUE: u8 = 2;
/// Reply status: the invocation raised; a throwable chain follows.
pub const NOT_OK: u8 = 3;

/// Object tag: the payload follows inline and joins the sharing scope.
pub(crate) const OBJECT_INLINE: u8 = 1;
/// Object tag: the payload is a back-reference into the sharing scope.
pub(crate) const OBJECT_BACKREF: u8 = 2;
