//! Field-tagged varint encoding.
//!
//! Every field on the wire is a varint key `(field_number << 3) | wire_type`
//! followed by its value:
//!
//! ```text
//! wire type 0  varint            bool, uint32, int32, enum
//! wire type 2  length-delimited  string, bytes
//! wire type 5  32-bit            fixed32, float
//! ```
//!
//! Encoding goes through [`FieldSink`], which has two implementations: one
//! that appends to a byte buffer and one that only counts bytes. Messages
//! write their fields once and get both the encoder and the size calculation.

/// Wire type tag for varints.
pub const WIRE_VARINT: u32 = 0;
/// Wire type tag for 64-bit little-endian values.
pub const WIRE_FIXED64: u32 = 1;
/// Wire type tag for length-delimited values.
pub const WIRE_LENGTH_DELIMITED: u32 = 2;
/// Wire type tag for 32-bit little-endian values.
pub const WIRE_FIXED32: u32 = 5;

/// Errors that can occur while decoding a message body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// A varint ran past the end of the buffer or exceeded ten bytes.
    #[error("truncated or overlong varint at offset {offset}")]
    BadVarint {
        /// Byte offset where the varint started.
        offset: usize,
    },

    /// A field's declared length runs past the end of the buffer.
    #[error("field {field} needs {needed} bytes but only {available} remain")]
    Truncated {
        /// Field number being decoded.
        field: u32,
        /// Bytes the field declared.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// Group wire types and unknown tags are not part of this protocol.
    #[error("unsupported wire type {wire_type} for field {field}")]
    InvalidWireType {
        /// Field number being decoded.
        field: u32,
        /// The offending wire type.
        wire_type: u32,
    },

    /// A string field did not hold valid UTF-8.
    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 {
        /// Field number being decoded.
        field: u32,
    },
}

/// Number of bytes `value` occupies as a varint.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Append `value` to `out` as a varint.
pub fn encode_varint(value: u64, out: &mut Vec<u8>) {
    let mut v = value;
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

/// Parse a varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` if `buf`
/// ends before the varint does. Used by stream readers that receive headers
/// a byte at a time.
pub fn parse_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Destination for encoded fields.
///
/// The `encode_*` helpers follow proto3 rules: a field holding its default
/// value is skipped unless `force` is set (used for repeated elements).
pub trait FieldSink {
    /// Append raw bytes.
    fn put_slice(&mut self, bytes: &[u8]);

    /// Append a varint.
    fn put_varint(&mut self, value: u64);

    /// Append a field key.
    fn put_key(&mut self, field: u32, wire_type: u32) {
        self.put_varint(u64::from((field << 3) | wire_type));
    }

    /// Encode an unsigned 32-bit varint field.
    fn encode_uint32(&mut self, field: u32, value: u32, force: bool) {
        if value == 0 && !force {
            return;
        }
        self.put_key(field, WIRE_VARINT);
        self.put_varint(u64::from(value));
    }

    /// Encode a signed 32-bit varint field (sign-extended to ten bytes when negative).
    fn encode_int32(&mut self, field: u32, value: i32, force: bool) {
        if value == 0 && !force {
            return;
        }
        self.put_key(field, WIRE_VARINT);
        self.put_varint(i64::from(value) as u64);
    }

    /// Encode a bool field.
    fn encode_bool(&mut self, field: u32, value: bool, force: bool) {
        if !value && !force {
            return;
        }
        self.put_key(field, WIRE_VARINT);
        self.put_varint(u64::from(value));
    }

    /// Encode a fixed32 field.
    fn encode_fixed32(&mut self, field: u32, value: u32, force: bool) {
        if value == 0 && !force {
            return;
        }
        self.put_key(field, WIRE_FIXED32);
        self.put_slice(&value.to_le_bytes());
    }

    /// Encode a float field.
    fn encode_float(&mut self, field: u32, value: f32, force: bool) {
        if value == 0.0 && !force {
            return;
        }
        self.put_key(field, WIRE_FIXED32);
        self.put_slice(&value.to_bits().to_le_bytes());
    }

    /// Encode a bytes field.
    fn encode_bytes(&mut self, field: u32, value: &[u8], force: bool) {
        if value.is_empty() && !force {
            return;
        }
        self.put_key(field, WIRE_LENGTH_DELIMITED);
        self.put_varint(value.len() as u64);
        self.put_slice(value);
    }

    /// Encode a string field.
    fn encode_string(&mut self, field: u32, value: &str, force: bool) {
        self.encode_bytes(field, value.as_bytes(), force);
    }
}

/// Appends encoded fields to a byte buffer.
///
/// The buffer is not cleared first, so the caller can reserve header space
/// in front of the message body.
pub struct ProtoWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> ProtoWriter<'a> {
    /// Wrap `buf`; encoded bytes are appended after its current contents.
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }
}

impl FieldSink for ProtoWriter<'_> {
    fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn put_varint(&mut self, value: u64) {
        encode_varint(value, self.buf);
    }
}

/// Counts the bytes an encode would produce.
#[derive(Debug, Default, Clone, Copy)]
pub struct SizeCounter {
    /// Bytes counted so far.
    pub total: usize,
}

impl FieldSink for SizeCounter {
    fn put_slice(&mut self, bytes: &[u8]) {
        self.total += bytes.len();
    }

    fn put_varint(&mut self, value: u64) {
        self.total += varint_len(value);
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Value half of a decoded field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    /// Wire type 0.
    Varint(u64),
    /// Wire type 1.
    Fixed64(u64),
    /// Wire type 2.
    LengthDelimited(&'a [u8]),
    /// Wire type 5.
    Fixed32(u32),
}

/// One field read off the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Field<'a> {
    /// Field number from the key.
    pub number: u32,
    /// Decoded value.
    pub value: FieldValue<'a>,
}

impl<'a> Field<'a> {
    /// Interpret a varint as `u32` (truncating, as proto does). Other wire
    /// types read as zero.
    pub fn as_u32(&self) -> u32 {
        match self.value {
            FieldValue::Varint(v) => v as u32,
            _ => 0,
        }
    }

    /// Interpret a varint as `i32`.
    pub fn as_i32(&self) -> i32 {
        self.as_u32() as i32
    }

    /// Interpret a varint as `bool`.
    pub fn as_bool(&self) -> bool {
        matches!(self.value, FieldValue::Varint(v) if v != 0)
    }

    /// Interpret a 32-bit field as `fixed32`.
    pub fn as_fixed32(&self) -> u32 {
        match self.value {
            FieldValue::Fixed32(v) => v,
            _ => 0,
        }
    }

    /// Interpret a 32-bit field as `float`.
    pub fn as_float(&self) -> f32 {
        f32::from_bits(self.as_fixed32())
    }

    /// Borrow a length-delimited payload.
    pub fn as_bytes(&self) -> &'a [u8] {
        match self.value {
            FieldValue::LengthDelimited(bytes) => bytes,
            _ => &[],
        }
    }

    /// Copy a length-delimited payload into a `String`.
    pub fn as_string(&self) -> Result<String, DecodeError> {
        std::str::from_utf8(self.as_bytes())
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8 { field: self.number })
    }
}

/// Iterates over the fields of an encoded message.
pub struct ProtoReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ProtoReader<'a> {
    /// Start reading at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn varint(&mut self) -> Result<u64, DecodeError> {
        let (value, used) = parse_varint(&self.buf[self.pos..])
            .ok_or(DecodeError::BadVarint { offset: self.pos })?;
        self.pos += used;
        Ok(value)
    }

    fn take(&mut self, field: u32, len: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.buf.len() - self.pos;
        if len > available {
            return Err(DecodeError::Truncated {
                field,
                needed: len,
                available,
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Read the next field, or `None` at the end of the buffer.
    pub fn next_field(&mut self) -> Result<Option<Field<'a>>, DecodeError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let key = self.varint()?;
        let number = (key >> 3) as u32;
        let wire_type = (key & 0x7) as u32;
        let value = match wire_type {
            WIRE_VARINT => FieldValue::Varint(self.varint()?),
            WIRE_FIXED64 => {
                let raw = self.take(number, 8)?;
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(raw);
                FieldValue::Fixed64(u64::from_le_bytes(bytes))
            }
            WIRE_LENGTH_DELIMITED => {
                let len = self.varint()? as usize;
                FieldValue::LengthDelimited(self.take(number, len)?)
            }
            WIRE_FIXED32 => {
                let raw = self.take(number, 4)?;
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(raw);
                FieldValue::Fixed32(u32::from_le_bytes(bytes))
            }
            other => {
                return Err(DecodeError::InvalidWireType {
                    field: number,
                    wire_type: other,
                });
            }
        };
        Ok(Some(Field { number, value }))
    }
}
