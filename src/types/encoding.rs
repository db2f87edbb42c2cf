//! Binary encoding and decoding traits for the co-processor wire format.
//!
//! Every multi-byte value on the link is little-endian with no padding, so a
//! struct encoded field by field has the same bytes as the packed C struct the
//! firmware sends.
//!
//! # Binary Format
//!
//! - Integers: little-endian, fixed-width
//! - `bool`: single byte (0 = false, 1 = true)
//! - `Vec<T>`/`String`: 4-byte length prefix followed by elements
//! - Arrays `[T; N]`: elements serialized sequentially without length prefix
//!
//! # Example
//!
//! ```ignore
//! use crate::types::encoding::{Encode, Decode};
//!
//! let value: u32 = 0x30525043;
//! let bytes = value.to_bytes();
//! assert_eq!(bytes, b"CPR0");
//! assert_eq!(u32::from_bytes(&bytes).unwrap(), value);
//! ```

use copro_derive::Error;

/// Sink for writing encoded bytes.
pub trait EncodeSink {
    /// Writes the given bytes to the sink.
    fn write(&mut self, bytes: &[u8]);
}

/// Counter for computing encoded size without allocating memory.
#[derive(Default)]
pub struct SizeCounter {
    len: usize,
}

impl SizeCounter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self { len: 0 }
    }

    /// Returns the total number of bytes counted.
    pub fn len(&self) -> usize {
        self.len
    }
}

impl EncodeSink for SizeCounter {
    fn write(&mut self, bytes: &[u8]) {
        self.len += bytes.len();
    }
}

impl EncodeSink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Trait for types that can be serialized to the wire format.
pub trait Encode {
    /// Writes the binary representation to the given sink.
    fn encode<S: EncodeSink>(&self, out: &mut S);

    /// Number of bytes `encode` will produce.
    fn encoded_len(&self) -> usize {
        let mut counter = SizeCounter::new();
        self.encode(&mut counter);
        counter.len()
    }

    /// Serializes to a new byte buffer with exact capacity.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out);
        out
    }
}

/// Errors that can occur during decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Input ended before expected data was read.
    #[error("unexpected end of input")]
    UnexpectedEof,
    /// Data does not represent a valid value for the target type.
    #[error("invalid value")]
    InvalidValue,
    /// Length prefix exceeds maximum allowed size.
    #[error("length prefix too large")]
    LengthOverflow,
}

/// Trait for types that can be deserialized from the wire format.
pub trait Decode: Sized {
    /// Reads and decodes a value from the input buffer.
    ///
    /// Advances the input slice past the consumed bytes.
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError>;

    /// Decodes a value from a byte slice, requiring all bytes to be consumed.
    fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut input = data;
        let value = Self::decode(&mut input)?;

        if !input.is_empty() {
            return Err(DecodeError::InvalidValue);
        }

        Ok(value)
    }
}

/// Reads exactly `n` bytes from the input, advancing the slice.
pub fn read_bytes<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], DecodeError> {
    if input.len() < n {
        return Err(DecodeError::UnexpectedEof);
    }
    let (bytes, rest) = input.split_at(n);
    *input = rest;
    Ok(bytes)
}

macro_rules! impl_int {
    ($($t:ty),*) => {
        $(
            impl Encode for $t {
                fn encode<S: EncodeSink>(&self, out: &mut S) {
                    out.write(&self.to_le_bytes());
                }
            }

            impl Decode for $t {
                fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(read_bytes(input, std::mem::size_of::<$t>())?);
                    Ok(<$t>::from_le_bytes(raw))
                }
            }
        )*
    };
}

impl_int!(u8, i8, u16, i16, u32, i32, u64, i64);

impl Encode for bool {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&[*self as u8]);
    }
}

impl Decode for bool {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::decode(input)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::InvalidValue),
        }
    }
}

/// Maximum element count accepted from a length prefix; the device never
/// buffers more than a few kilobytes per frame.
pub const MAX_VEC_LEN: usize = 1 << 20;

impl<T: Encode> Encode for Vec<T> {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        (self.len() as u32).encode(out);
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = u32::decode(input)? as usize;
        if len > MAX_VEC_LEN {
            return Err(DecodeError::LengthOverflow);
        }

        let mut vec = Vec::with_capacity(len.min(input.len()));
        for _ in 0..len {
            vec.push(T::decode(input)?);
        }
        Ok(vec)
    }
}

impl Encode for String {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.as_str().encode(out);
    }
}

impl Decode for String {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let bytes = Vec::<u8>::decode(input)?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidValue)
    }
}

impl Encode for &str {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        (self.len() as u32).encode(out);
        out.write(self.as_bytes());
    }
}

impl<T: Encode, const N: usize> Encode for [T; N] {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: Decode + Default + Copy, const N: usize> Decode for [T; N] {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let mut arr = [T::default(); N];
        for slot in arr.iter_mut() {
            *slot = T::decode(input)?;
        }
        Ok(arr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_counter_accumulates() {
        let mut counter = SizeCounter::new();
        counter.write(&[1, 2, 3]);
        counter.write(&[4, 5]);
        assert_eq!(counter.len(), 5);
    }

    #[test]
    fn u32_little_endian() {
        let bytes = 0x30525043u32.to_bytes();
        assert_eq!(bytes, b"CPR0");
        assert_eq!(u32::from_bytes(&bytes).unwrap(), 0x30525043);
    }

    #[test]
    fn negative_i32_is_twos_complement() {
        assert_eq!((-4i32).to_bytes(), vec![0xFC, 0xFF, 0xFF, 0xFF]);
        assert_eq!(i32::from_bytes(&[0xF6, 0xFF, 0xFF, 0xFF]).unwrap(), -10);
    }

    #[test]
    fn vec_uses_u32_length_prefix() {
        let bytes = vec![0xAAu8, 0xBB].to_bytes();
        assert_eq!(bytes, vec![2, 0, 0, 0, 0xAA, 0xBB]);
        assert_eq!(Vec::<u8>::from_bytes(&bytes).unwrap(), vec![0xAA, 0xBB]);
    }

    #[test]
    fn str_and_string_encode_alike() {
        assert_eq!("add".to_bytes(), "add".to_string().to_bytes());
        assert_eq!(String::from_bytes(&"add".to_bytes()).unwrap(), "add");
    }

    #[test]
    fn vec_length_overflow() {
        let bytes = ((MAX_VEC_LEN as u32) + 1).to_bytes();
        assert_eq!(Vec::<u8>::from_bytes(&bytes), Err(DecodeError::LengthOverflow));
    }

    #[test]
    fn array_has_no_prefix() {
        let arr: [u8; 4] = *b"CPLM";
        assert_eq!(arr.to_bytes(), b"CPLM");
        assert_eq!(<[u8; 4]>::from_bytes(b"CPLM").unwrap(), *b"CPLM");
    }

    #[test]
    fn bool_rejects_other_bytes() {
        assert!(!bool::from_bytes(&[0]).unwrap());
        assert_eq!(bool::from_bytes(&[2]), Err(DecodeError::InvalidValue));
    }

    #[test]
    fn short_input_is_eof() {
        assert_eq!(u32::from_bytes(&[0x12, 0x34]), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        assert_eq!(u8::from_bytes(&[42, 0xFF]), Err(DecodeError::InvalidValue));
    }

    #[test]
    fn decode_advances_input() {
        let mut input: &[u8] = &[0x01, 0x02, 0x03, 0x04, 0x05];
        assert_eq!(u8::decode(&mut input).unwrap(), 0x01);
        assert_eq!(u16::decode(&mut input).unwrap(), 0x0302);
        assert_eq!(input.len(), 2);
    }
}
