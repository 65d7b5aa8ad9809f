use std::io::Read;

use serde::de::DeserializeOwned;

use crate::error::from_io;
use crate::throwable::{RemoteThrowable, ThrowableInfo, ThrowablePayload};
use crate::{
    Identifier, ObjectCodec, VersionedIdentifier, WireError, NOT_NULL, NOT_OK, NULL,
    OBJECT_BACKREF, OBJECT_INLINE, OK_FALSE, OK_TRUE,
};

/// Top-level status of an invocation reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// Completed; boolean result `false`.
    OkFalse,
    /// Completed; boolean result `true` (or the generic success status).
    OkTrue,
    /// Raised; a throwable chain follows.
    NotOk,
}

/// The reading half of one invocation; the mirror of
/// [`InvocationOutput`](crate::InvocationOutput), including the sharing
/// scope for back-referenced payloads.
///
/// Every read that hits end-of-stream before completing the current value
/// fails with [`WireError::UnexpectedEof`]; bytes that do not form a valid
/// encoding fail with [`WireError::Corrupted`].
pub struct InvocationInput<R: Read> {
    input: R,
    codec: ObjectCodec,
    /// Sharing scope: payloads seen inline, indexed by arrival order.
    seen: Vec<Vec<u8>>,
}

impl<R: Read> InvocationInput<R> {
    /// Bind a new input (and sharing scope) to a byte source.
    pub fn new(input: R, codec: ObjectCodec) -> InvocationInput<R> {
        InvocationInput {
            input,
            codec,
            seen: Vec::new(),
        }
    }

    /// The codec user objects are decoded with.
    pub fn codec(&self) -> ObjectCodec {
        self.codec
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        let mut buf = [0u8; 1];
        self.input.read_exact(&mut buf).map_err(from_io)?;
        Ok(buf[0])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut buf = [0u8; N];
        self.input.read_exact(&mut buf).map_err(from_io)?;
        Ok(buf)
    }

    /// Read one signed byte.
    pub fn read_byte(&mut self) -> Result<i8, WireError> {
        Ok(i8::from_be_bytes(self.read_array()?))
    }

    /// Read a boolean; any byte other than `0` or `1` is a corruption.
    pub fn read_boolean(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(WireError::Corrupted(format!("invalid boolean byte {:#04x}", b))),
        }
    }

    /// Read a character from its four-byte Unicode scalar value.
    pub fn read_char(&mut self) -> Result<char, WireError> {
        let bits = u32::from_be_bytes(self.read_array()?);
        char::from_u32(bits)
            .ok_or_else(|| WireError::Corrupted(format!("invalid scalar value {:#x}", bits)))
    }

    /// Read a 32-bit signed integer.
    pub fn read_int(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    /// Read a 64-bit signed integer.
    pub fn read_long(&mut self) -> Result<i64, WireError> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    /// Read a 32-bit float from its bit pattern.
    pub fn read_float(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_bits(u32::from_be_bytes(self.read_array()?)))
    }

    /// Read a 64-bit float from its bit pattern.
    pub fn read_double(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_bits(u64::from_be_bytes(self.read_array()?)))
    }

    fn read_presence(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            NULL => Ok(false),
            NOT_NULL => Ok(true),
            b => Err(WireError::Corrupted(format!("invalid presence byte {:#04x}", b))),
        }
    }

    /// Read a nullable byte.
    pub fn read_boxed_byte(&mut self) -> Result<Option<i8>, WireError> {
        if self.read_presence()? {
            Ok(Some(self.read_byte()?))
        } else {
            Ok(None)
        }
    }

    /// Read a nullable boolean.
    pub fn read_boxed_boolean(&mut self) -> Result<Option<bool>, WireError> {
        if self.read_presence()? {
            Ok(Some(self.read_boolean()?))
        } else {
            Ok(None)
        }
    }

    /// Read a nullable character.
    pub fn read_boxed_char(&mut self) -> Result<Option<char>, WireError> {
        if self.read_presence()? {
            Ok(Some(self.read_char()?))
        } else {
            Ok(None)
        }
    }

    /// Read a nullable 32-bit integer.
    pub fn read_boxed_int(&mut self) -> Result<Option<i32>, WireError> {
        if self.read_presence()? {
            Ok(Some(self.read_int()?))
        } else {
            Ok(None)
        }
    }

    /// Read a nullable 64-bit integer.
    pub fn read_boxed_long(&mut self) -> Result<Option<i64>, WireError> {
        if self.read_presence()? {
            Ok(Some(self.read_long()?))
        } else {
            Ok(None)
        }
    }

    /// Read a nullable 32-bit float.
    pub fn read_boxed_float(&mut self) -> Result<Option<f32>, WireError> {
        if self.read_presence()? {
            Ok(Some(self.read_float()?))
        } else {
            Ok(None)
        }
    }

    /// Read a nullable 64-bit float.
    pub fn read_boxed_double(&mut self) -> Result<Option<f64>, WireError> {
        if self.read_presence()? {
            Ok(Some(self.read_double()?))
        } else {
            Ok(None)
        }
    }

    /// Read a variable-length unsigned integer.
    pub fn read_var_uint(&mut self) -> Result<u32, WireError> {
        let b1 = self.read_u8()? as u32;
        Ok(match b1 {
            0x00..=0x7f => b1,
            0x80..=0xbf => {
                let b2 = self.read_u8()? as u32;
                ((b1 & 0x3f) << 8) | b2
            }
            0xc0..=0xdf => {
                let [b2, b3] = self.read_array()?;
                ((b1 & 0x1f) << 16) | ((b2 as u32) << 8) | b3 as u32
            }
            0xe0..=0xef => {
                let [b2, b3, b4] = self.read_array()?;
                ((b1 & 0x0f) << 24) | ((b2 as u32) << 16) | ((b3 as u32) << 8) | b4 as u32
            }
            _ => {
                let [b2, b3, b4, b5] = self.read_array()?;
                ((b2 as u32) << 24) | ((b3 as u32) << 16) | ((b4 as u32) << 8) | b5 as u32
            }
        })
    }

    /// Read a nullable string in the compact encoding.
    pub fn read_string(&mut self) -> Result<Option<String>, WireError> {
        let n = self.read_var_uint()?;
        if n == 0 {
            return Ok(None);
        }
        let mut remaining = n - 1;
        let mut s = String::with_capacity(remaining as usize);
        while remaining > 0 {
            let b = self.read_u8()? as u32;
            let cp = match b >> 5 {
                0b000..=0b011 => b,
                0b100 | 0b101 => {
                    let b2 = self.read_u8()? as u32;
                    ((b & 0x3f) << 8) | b2
                }
                0b110 => {
                    let [b2, b3] = self.read_array()?;
                    ((b & 0x1f) << 16) | ((b2 as u32) << 8) | b3 as u32
                }
                _ => {
                    return Err(WireError::Corrupted(format!(
                        "illegal string lead byte {:#04x}",
                        b
                    )));
                }
            };
            let c = char::from_u32(cp).ok_or_else(|| {
                WireError::Corrupted(format!("invalid code point {:#x} in string", cp))
            })?;
            let units = c.len_utf16() as u32;
            if units > remaining {
                return Err(WireError::Corrupted(
                    "string content overruns its declared length".into(),
                ));
            }
            remaining -= units;
            s.push(c);
        }
        Ok(Some(s))
    }

    /// Read a codec-encoded payload from the sharing scope, resolving
    /// back-references against payloads already seen.
    pub fn read_shared_bytes(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        match self.read_u8()? {
            NULL => Ok(None),
            OBJECT_INLINE => {
                let len = self.read_var_uint()? as usize;
                let mut bytes = vec![0u8; len];
                self.input.read_exact(&mut bytes).map_err(from_io)?;
                self.seen.push(bytes.clone());
                Ok(Some(bytes))
            }
            OBJECT_BACKREF => {
                let index = self.read_var_uint()? as usize;
                match self.seen.get(index) {
                    Some(bytes) => Ok(Some(bytes.clone())),
                    None => Err(WireError::Corrupted(format!(
                        "back-reference {} outside the sharing scope",
                        index
                    ))),
                }
            }
            b => Err(WireError::Corrupted(format!("invalid object tag {:#04x}", b))),
        }
    }

    /// Read a codec-encoded payload written outside the sharing scope.
    /// Unshared payloads never join the scope, so a back-reference here is
    /// a corruption.
    pub fn read_unshared_bytes(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        match self.read_u8()? {
            NULL => Ok(None),
            OBJECT_INLINE => {
                let len = self.read_var_uint()? as usize;
                let mut bytes = vec![0u8; len];
                self.input.read_exact(&mut bytes).map_err(from_io)?;
                Ok(Some(bytes))
            }
            b => Err(WireError::Corrupted(format!(
                "invalid unshared object tag {:#04x}",
                b
            ))),
        }
    }

    /// Read and decode a value from the sharing scope.
    pub fn read_shared<T: DeserializeOwned>(&mut self) -> Result<Option<T>, WireError> {
        match self.read_shared_bytes()? {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Read and decode a value written outside the sharing scope.
    pub fn read_unshared<T: DeserializeOwned>(&mut self) -> Result<Option<T>, WireError> {
        match self.read_unshared_bytes()? {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Read the reply status byte. The `NULL` byte is only valid inside
    /// values, never as a reply status.
    pub fn read_status(&mut self) -> Result<ReplyStatus, WireError> {
        match self.read_u8()? {
            OK_FALSE => Ok(ReplyStatus::OkFalse),
            OK_TRUE => Ok(ReplyStatus::OkTrue),
            NOT_OK => Ok(ReplyStatus::NotOk),
            b => Err(WireError::Corrupted(format!("invalid reply status {:#04x}", b))),
        }
    }

    /// Read an identifier, eight bytes big-endian.
    pub fn read_identifier(&mut self) -> Result<Identifier, WireError> {
        Identifier::read_from(&mut self.input)
    }

    /// Read a versioned identifier: the identity and the export generation
    /// the sender wrote it at.
    pub fn read_versioned(&mut self) -> Result<(Identifier, u32), WireError> {
        VersionedIdentifier::read_from(&mut self.input)
    }

    /// Read the failure body that follows a `NOT_OK` status and rebuild
    /// the cause chain. The chain metadata always reconstructs; the typed
    /// terminal payload stays attached for optional recovery.
    pub fn read_throwable(&mut self) -> Result<RemoteThrowable, WireError> {
        let len = self.read_var_uint()?;
        if len == 0 {
            return Err(WireError::Corrupted("empty throwable chain".into()));
        }
        let mut chain = Vec::with_capacity(len as usize);
        for _ in 0..len {
            let info: ThrowableInfo = self
                .read_shared()?
                .ok_or_else(|| WireError::Corrupted("null element in throwable chain".into()))?;
            chain.push(info);
        }
        let payload: Option<ThrowablePayload> = self.read_shared()?;
        Ok(RemoteThrowable::from_chain(chain, payload))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::InvocationOutput;

    use super::*;

    fn roundtrip<F, G, T>(write: F, read: G) -> T
    where
        F: FnOnce(&mut InvocationOutput<&mut Vec<u8>>) -> Result<(), WireError>,
        G: FnOnce(&mut InvocationInput<&[u8]>) -> Result<T, WireError>,
    {
        let mut buf = Vec::new();
        let mut out = InvocationOutput::new(&mut buf, ObjectCodec::Bincode);
        write(&mut out).unwrap();
        drop(out);
        let mut input = InvocationInput::new(&buf[..], ObjectCodec::Bincode);
        read(&mut input).unwrap()
    }

    #[test]
    fn test_primitive_roundtrips() {
        assert_eq!(roundtrip(|o| o.write_byte(-7), |i| i.read_byte()), -7);
        assert!(roundtrip(|o| o.write_boolean(true), |i| i.read_boolean()));
        assert_eq!(roundtrip(|o| o.write_char('𝄞'), |i| i.read_char()), '𝄞');
        assert_eq!(roundtrip(|o| o.write_int(i32::MIN), |i| i.read_int()), i32::MIN);
        assert_eq!(roundtrip(|o| o.write_long(-1), |i| i.read_long()), -1);
        assert_eq!(roundtrip(|o| o.write_float(1.5), |i| i.read_float()), 1.5);
        assert_eq!(
            roundtrip(|o| o.write_double(f64::MIN_POSITIVE), |i| i.read_double()),
            f64::MIN_POSITIVE
        );
    }

    #[test]
    fn test_boxed_roundtrips_include_null() {
        assert_eq!(
            roundtrip(|o| o.write_boxed_int(Some(42)), |i| i.read_boxed_int()),
            Some(42)
        );
        assert_eq!(roundtrip(|o| o.write_boxed_int(None), |i| i.read_boxed_int()), None);
        assert_eq!(
            roundtrip(|o| o.write_boxed_double(None), |i| i.read_boxed_double()),
            None
        );
        assert_eq!(
            roundtrip(|o| o.write_boxed_char(Some('é')), |i| i.read_boxed_char()),
            Some('é')
        );
    }

    #[test]
    fn test_var_uint_roundtrips() {
        for n in [0, 1, 0x7f, 0x80, 0x3fff, 0x4000, 0x001f_ffff, 0x0020_0000, 0x0fff_ffff, 0x1000_0000, u32::MAX]
        {
            assert_eq!(roundtrip(|o| o.write_var_uint(n), |i| i.read_var_uint()), n);
        }
    }

    #[test]
    fn test_string_roundtrips() {
        for s in [
            Some("".to_string()),
            Some("plain ascii".to_string()),
            Some("héllo 𝄞".to_string()),
            Some("\u{0}\u{7f}\u{80}\u{3fff}\u{4000}\u{ffff}\u{10000}\u{10ffff}".to_string()),
            None,
        ] {
            let got = roundtrip(|o| o.write_string(s.as_deref()), |i| i.read_string());
            assert_eq!(got, s);
        }
    }

    #[test]
    fn test_illegal_lead_byte_is_corrupted() {
        // length 2, then a 0b111 lead byte
        let buf = [2u8, 0xf8];
        let mut input = InvocationInput::new(&buf[..], ObjectCodec::Bincode);
        match input.read_string() {
            Err(WireError::Corrupted(_)) => {}
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_string_is_eof() {
        let mut buf = Vec::new();
        let mut out = InvocationOutput::new(&mut buf, ObjectCodec::Bincode);
        out.write_string(Some("truncate me")).unwrap();
        drop(out);
        buf.truncate(buf.len() - 3);
        let mut input = InvocationInput::new(&buf[..], ObjectCodec::Bincode);
        match input.read_string() {
            Err(WireError::UnexpectedEof) => {}
            other => panic!("expected EOF, got {:?}", other),
        }
    }

    #[test]
    fn test_shared_scope_resolves_backrefs() {
        let value = vec!["a".to_string(), "b".to_string()];
        let (first, second) = roundtrip(
            |o| {
                o.write_shared(Some(&value))?;
                o.write_shared(Some(&value))
            },
            |i| {
                let first: Option<Vec<String>> = i.read_shared()?;
                let second: Option<Vec<String>> = i.read_shared()?;
                Ok((first, second))
            },
        );
        assert_eq!(first.as_ref(), Some(&value));
        assert_eq!(second.as_ref(), Some(&value));
    }

    #[test]
    fn test_backref_in_unshared_is_corrupted() {
        let buf = [crate::OBJECT_BACKREF, 0];
        let mut input = InvocationInput::new(&buf[..], ObjectCodec::Bincode);
        match input.read_unshared::<u32>() {
            Err(WireError::Corrupted(_)) => {}
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_status_bytes() {
        let buf = [crate::OK_FALSE, crate::OK_TRUE, crate::NOT_OK, crate::NULL];
        let mut input = InvocationInput::new(&buf[..], ObjectCodec::Bincode);
        assert_eq!(input.read_status().unwrap(), ReplyStatus::OkFalse);
        assert_eq!(input.read_status().unwrap(), ReplyStatus::OkTrue);
        assert_eq!(input.read_status().unwrap(), ReplyStatus::NotOk);
        assert!(matches!(input.read_status(), Err(WireError::Corrupted(_))));
    }
}
