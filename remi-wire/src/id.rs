use std::fmt;
use std::io::{Read, Write};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::from_io;
use crate::WireError;

/// Identifiers at or below this value are never minted randomly; the
/// runtime reserves them for well-known endpoints such as the session
/// control object.
pub const RESERVED_MAX: u64 = 0xff;

/// A stable 64-bit identity, unguessable when minted with [`Identifier::random`].
///
/// Two identifiers are equal iff their bit patterns are. The wire encoding
/// is eight bytes, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier(u64);

impl Identifier {
    /// Mint a fresh identifier from the operating system's secure random
    /// source. The reserved low range is never produced.
    pub fn random() -> Identifier {
        loop {
            let bits = OsRng.next_u64();
            if bits > RESERVED_MAX {
                return Identifier(bits);
            }
        }
    }

    /// An identifier with well-known bits from the reserved range.
    pub const fn reserved(bits: u64) -> Identifier {
        assert!(bits <= RESERVED_MAX);
        Identifier(bits)
    }

    /// The raw bit pattern.
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Rebuild an identifier from its raw bit pattern.
    pub const fn from_bits(bits: u64) -> Identifier {
        Identifier(bits)
    }

    /// Whether this identifier belongs to the runtime-reserved range.
    pub const fn is_reserved(self) -> bool {
        self.0 <= RESERVED_MAX
    }

    /// Write the eight-byte big-endian encoding.
    pub fn write_to<W: Write>(self, out: &mut W) -> Result<(), WireError> {
        out.write_all(&self.0.to_be_bytes()).map_err(from_io)
    }

    /// Read the eight-byte big-endian encoding.
    pub fn read_from<R: Read>(input: &mut R) -> Result<Identifier, WireError> {
        let mut buf = [0u8; 8];
        input.read_exact(&mut buf).map_err(from_io)?;
        Ok(Identifier(u64::from_be_bytes(buf)))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// An [`Identifier`] together with the two monotonic counters driving
/// distributed garbage collection.
///
/// `local_version` is bumped every time the side that minted the
/// identifier re-exports it; `remote_version` records the highest version
/// the peer is known to have observed. Only the identifier and the
/// `local_version` travel: the wire form is twelve bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionedIdentifier {
    /// The stable identity.
    pub id: Identifier,
    /// Export generation on the minting side.
    pub local_version: u32,
    /// Highest generation the peer has acknowledged observing.
    pub remote_version: u32,
}

impl VersionedIdentifier {
    /// A first-generation versioned identifier.
    pub fn new(id: Identifier) -> VersionedIdentifier {
        VersionedIdentifier {
            id,
            local_version: 0,
            remote_version: 0,
        }
    }

    /// Write the identifier followed by the current `local_version`.
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<(), WireError> {
        self.id.write_to(out)?;
        out.write_all(&self.local_version.to_be_bytes()).map_err(from_io)
    }

    /// Read an identifier and the version the sender exported it at. The
    /// reader's registry reinterprets that version as its view of the
    /// peer's generation.
    pub fn read_from<R: Read>(input: &mut R) -> Result<(Identifier, u32), WireError> {
        let id = Identifier::read_from(input)?;
        let mut buf = [0u8; 4];
        input.read_exact(&mut buf).map_err(from_io)?;
        Ok((id, u32::from_be_bytes(buf)))
    }
}

impl fmt::Display for VersionedIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}v{}", self.id, self.local_version)
    }
}
