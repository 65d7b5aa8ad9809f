use std::collections::HashMap;
use std::io::Write;

use serde::Serialize;

use crate::error::from_io;
use crate::throwable::RemoteThrowable;
use crate::{
    Identifier, ObjectCodec, VersionedIdentifier, WireError, NOT_NULL, NOT_OK, NULL,
    OBJECT_BACKREF, OBJECT_INLINE, OK_FALSE, OK_TRUE,
};

/// The writing half of one invocation.
///
/// An `InvocationOutput` is created fresh for each request or reply and is
/// therefore also the sharing scope of that direction: repeated
/// [`write_shared`](InvocationOutput::write_shared) calls with an equal
/// payload are collapsed into back-references, while
/// [`write_unshared`](InvocationOutput::write_unshared) always writes the
/// payload inline and never joins the scope.
///
/// All multi-byte integers are big-endian.
pub struct InvocationOutput<W: Write> {
    out: W,
    codec: ObjectCodec,
    /// Sharing scope: encoded payload to back-reference index.
    shared: HashMap<Vec<u8>, u32>,
}

impl<W: Write> InvocationOutput<W> {
    /// Bind a new output (and sharing scope) to a byte sink.
    pub fn new(out: W, codec: ObjectCodec) -> InvocationOutput<W> {
        InvocationOutput {
            out,
            codec,
            shared: HashMap::new(),
        }
    }

    /// The codec user objects are encoded with.
    pub fn codec(&self) -> ObjectCodec {
        self.codec
    }

    /// Flush everything written so far to the underlying sink.
    pub fn flush(&mut self) -> Result<(), WireError> {
        self.out.flush().map_err(from_io)
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        self.out.write_all(bytes).map_err(from_io)
    }

    /// Write one signed byte.
    pub fn write_byte(&mut self, value: i8) -> Result<(), WireError> {
        self.put(&value.to_be_bytes())
    }

    /// Write a boolean as a single byte, `0` or `1`.
    pub fn write_boolean(&mut self, value: bool) -> Result<(), WireError> {
        self.put(&[value as u8])
    }

    /// Write a character as its four-byte Unicode scalar value.
    pub fn write_char(&mut self, value: char) -> Result<(), WireError> {
        self.put(&(value as u32).to_be_bytes())
    }

    /// Write a 32-bit signed integer.
    pub fn write_int(&mut self, value: i32) -> Result<(), WireError> {
        self.put(&value.to_be_bytes())
    }

    /// Write a 64-bit signed integer.
    pub fn write_long(&mut self, value: i64) -> Result<(), WireError> {
        self.put(&value.to_be_bytes())
    }

    /// Write a 32-bit float as its bit pattern.
    pub fn write_float(&mut self, value: f32) -> Result<(), WireError> {
        self.put(&value.to_bits().to_be_bytes())
    }

    /// Write a 64-bit float as its bit pattern.
    pub fn write_double(&mut self, value: f64) -> Result<(), WireError> {
        self.put(&value.to_bits().to_be_bytes())
    }

    fn write_presence(&mut self, present: bool) -> Result<(), WireError> {
        self.put(&[if present { NOT_NULL } else { NULL }])
    }

    /// Write a nullable byte: a presence byte, then the value when present.
    pub fn write_boxed_byte(&mut self, value: Option<i8>) -> Result<(), WireError> {
        self.write_presence(value.is_some())?;
        value.map_or(Ok(()), |v| self.write_byte(v))
    }

    /// Write a nullable boolean.
    pub fn write_boxed_boolean(&mut self, value: Option<bool>) -> Result<(), WireError> {
        self.write_presence(value.is_some())?;
        value.map_or(Ok(()), |v| self.write_boolean(v))
    }

    /// Write a nullable character.
    pub fn write_boxed_char(&mut self, value: Option<char>) -> Result<(), WireError> {
        self.write_presence(value.is_some())?;
        value.map_or(Ok(()), |v| self.write_char(v))
    }

    /// Write a nullable 32-bit integer.
    pub fn write_boxed_int(&mut self, value: Option<i32>) -> Result<(), WireError> {
        self.write_presence(value.is_some())?;
        value.map_or(Ok(()), |v| self.write_int(v))
    }

    /// Write a nullable 64-bit integer.
    pub fn write_boxed_long(&mut self, value: Option<i64>) -> Result<(), WireError> {
        self.write_presence(value.is_some())?;
        value.map_or(Ok(()), |v| self.write_long(v))
    }

    /// Write a nullable 32-bit float.
    pub fn write_boxed_float(&mut self, value: Option<f32>) -> Result<(), WireError> {
        self.write_presence(value.is_some())?;
        value.map_or(Ok(()), |v| self.write_float(v))
    }

    /// Write a nullable 64-bit float.
    pub fn write_boxed_double(&mut self, value: Option<f64>) -> Result<(), WireError> {
        self.write_presence(value.is_some())?;
        value.map_or(Ok(()), |v| self.write_double(v))
    }

    /// Write an unsigned integer in the variable-length encoding: the top
    /// bits of the first byte select a total length of one to five bytes,
    /// and writers always pick the shortest form that fits.
    pub fn write_var_uint(&mut self, n: u32) -> Result<(), WireError> {
        if n <= 0x7f {
            self.put(&[n as u8])
        } else if n <= 0x3fff {
            self.put(&[0x80 | (n >> 8) as u8, n as u8])
        } else if n <= 0x001f_ffff {
            self.put(&[0xc0 | (n >> 16) as u8, (n >> 8) as u8, n as u8])
        } else if n <= 0x0fff_ffff {
            self.put(&[
                0xe0 | (n >> 24) as u8,
                (n >> 16) as u8,
                (n >> 8) as u8,
                n as u8,
            ])
        } else {
            self.put(&[
                0xf0,
                (n >> 24) as u8,
                (n >> 16) as u8,
                (n >> 8) as u8,
                n as u8,
            ])
        }
    }

    /// Write a nullable string in the compact encoding.
    ///
    /// The length travels as `var_uint(code_units + 1)` so the bare `NULL`
    /// byte unambiguously means a null string; each code point is then one
    /// byte (`< 0x80`), two bytes (`< 0x4000`, `0b10` prefix) or three
    /// bytes (`0b110` prefix). A code point at or above `0x1_0000` counts
    /// as two code units toward the length.
    pub fn write_string(&mut self, value: Option<&str>) -> Result<(), WireError> {
        let Some(s) = value else {
            return self.put(&[NULL]);
        };
        let units: u64 = s.chars().map(|c| c.len_utf16() as u64).sum();
        if units >= u32::MAX as u64 {
            return Err(WireError::NonSerializable {
                type_name: "str",
                reason: format!("string of {} code units exceeds the wire limit", units),
            });
        }
        self.write_var_uint(units as u32 + 1)?;
        for c in s.chars() {
            let cp = c as u32;
            if cp < 0x80 {
                self.put(&[cp as u8])?;
            } else if cp < 0x4000 {
                self.put(&[0x80 | (cp >> 8) as u8, cp as u8])?;
            } else {
                self.put(&[0xc0 | (cp >> 16) as u8, (cp >> 8) as u8, cp as u8])?;
            }
        }
        Ok(())
    }

    /// Write a nullable string outside the sharing scope. Strings carry no
    /// scope state, so the encoding matches
    /// [`write_string`](InvocationOutput::write_string); the method exists
    /// so call sites can state the declared marshalling mode.
    pub fn write_unshared_string(&mut self, value: Option<&str>) -> Result<(), WireError> {
        self.write_string(value)
    }

    /// Write a codec-encoded payload into the sharing scope: the first
    /// occurrence travels inline, a repeat as a back-reference.
    pub fn write_shared_bytes(&mut self, payload: Option<&[u8]>) -> Result<(), WireError> {
        let Some(bytes) = payload else {
            return self.put(&[NULL]);
        };
        if let Some(&index) = self.shared.get(bytes) {
            trace!("sharing scope hit, back-reference {}", index);
            self.put(&[OBJECT_BACKREF])?;
            return self.write_var_uint(index);
        }
        let index = self.shared.len() as u32;
        self.put(&[OBJECT_INLINE])?;
        self.write_var_uint(bytes.len() as u32)?;
        self.put(bytes)?;
        self.shared.insert(bytes.to_vec(), index);
        Ok(())
    }

    /// Write a codec-encoded payload inline, outside the sharing scope.
    pub fn write_unshared_bytes(&mut self, payload: Option<&[u8]>) -> Result<(), WireError> {
        let Some(bytes) = payload else {
            return self.put(&[NULL]);
        };
        self.put(&[OBJECT_INLINE])?;
        self.write_var_uint(bytes.len() as u32)?;
        self.put(bytes)
    }

    /// Encode a value with the object codec and write it into the sharing
    /// scope.
    pub fn write_shared<T: Serialize>(&mut self, value: Option<&T>) -> Result<(), WireError> {
        match value {
            Some(v) => {
                let bytes = self.codec.encode(v)?;
                self.write_shared_bytes(Some(&bytes))
            }
            None => self.write_shared_bytes(None),
        }
    }

    /// Encode a value with the object codec and write it outside the
    /// sharing scope.
    pub fn write_unshared<T: Serialize>(&mut self, value: Option<&T>) -> Result<(), WireError> {
        match value {
            Some(v) => {
                let bytes = self.codec.encode(v)?;
                self.write_unshared_bytes(Some(&bytes))
            }
            None => self.write_unshared_bytes(None),
        }
    }

    /// Write the success status byte: `OK_TRUE` or `OK_FALSE`.
    pub fn write_ok(&mut self, value: bool) -> Result<(), WireError> {
        self.put(&[if value { OK_TRUE } else { OK_FALSE }])
    }

    /// Write an identifier, eight bytes big-endian.
    pub fn write_identifier(&mut self, id: Identifier) -> Result<(), WireError> {
        id.write_to(&mut self.out)
    }

    /// Write a versioned identifier: the identity plus its current export
    /// generation.
    pub fn write_versioned(&mut self, vid: &VersionedIdentifier) -> Result<(), WireError> {
        vid.write_to(&mut self.out)
    }

    /// Write a failure reply: the `NOT_OK` status, the cause chain length,
    /// each element of the chain (root cause first) through the object
    /// codec, and the terminal payload.
    pub fn write_throwable(&mut self, throwable: &RemoteThrowable) -> Result<(), WireError> {
        self.put(&[NOT_OK])?;
        let chain = throwable.chain_root_first();
        self.write_var_uint(chain.len() as u32)?;
        for info in chain {
            self.write_shared(Some(info))?;
        }
        self.write_shared(throwable.payload())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn output(buf: &mut Vec<u8>) -> InvocationOutput<&mut Vec<u8>> {
        InvocationOutput::new(buf, ObjectCodec::Bincode)
    }

    #[test]
    fn test_var_uint_minimal_lengths() {
        let cases: &[(u32, usize)] = &[
            (0, 1),
            (0x7f, 1),
            (0x80, 2),
            (0x3fff, 2),
            (0x4000, 3),
            (0x001f_ffff, 3),
            (0x0020_0000, 4),
            (0x0fff_ffff, 4),
            (0x1000_0000, 5),
            (u32::MAX, 5),
        ];
        for &(n, len) in cases {
            let mut buf = Vec::new();
            output(&mut buf).write_var_uint(n).unwrap();
            assert_eq!(buf.len(), len, "length of {:#x}", n);
        }
    }

    #[test]
    fn test_null_string_is_one_byte() {
        let mut buf = Vec::new();
        output(&mut buf).write_string(None).unwrap();
        assert_eq!(buf, vec![NULL]);
    }

    #[test]
    fn test_empty_string_is_not_null() {
        let mut buf = Vec::new();
        output(&mut buf).write_string(Some("")).unwrap();
        assert_eq!(buf, vec![1]);
    }

    #[test]
    fn test_supplementary_counts_two_units() {
        let mut buf = Vec::new();
        output(&mut buf).write_string(Some("𝄞")).unwrap();
        // length 2 + 1, then one three-byte sequence for U+1D11E
        assert_eq!(buf, vec![3, 0xc0 | 0x01, 0xd1, 0x1e]);
    }

    #[test]
    fn test_shared_repeat_is_backref() {
        let mut buf = Vec::new();
        let mut out = output(&mut buf);
        let value = String::from("shared payload");
        out.write_shared(Some(&value)).unwrap();
        out.write_shared(Some(&value)).unwrap();
        drop(out);
        // inline tag, length, payload, then a two-byte back-reference
        let inline_len = buf.len() - 2;
        assert_eq!(buf[0], OBJECT_INLINE);
        assert_eq!(&buf[inline_len..], &[OBJECT_BACKREF, 0]);
    }

    #[test]
    fn test_unshared_repeat_stays_inline() {
        let mut buf = Vec::new();
        let mut out = output(&mut buf);
        let value = 1234u64;
        out.write_unshared(Some(&value)).unwrap();
        out.write_unshared(Some(&value)).unwrap();
        drop(out);
        assert_eq!(buf.len() % 2, 0);
        let half = buf.len() / 2;
        assert_eq!(&buf[..half], &buf[half..]);
    }
}
