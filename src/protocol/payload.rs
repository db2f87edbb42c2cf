//! Bounds-checked payload readers and status-first payload writers.
//!
//! Handlers never index into a request directly: every field goes through a
//! [`PayloadReader`], which reports [`Status::Param`] instead of reading past
//! the end.

use crate::protocol::frame::Status;
use crate::types::encoding::{Decode, Encode, read_bytes};

/// Cursor over a request payload that fails closed.
pub struct PayloadReader<'a> {
    input: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    /// Reads one fixed-layout value.
    pub fn read_pod<T: Decode>(&mut self) -> Result<T, Status> {
        T::decode(&mut self.input).map_err(|_| Status::Param)
    }

    /// Reads exactly `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], Status> {
        read_bytes(&mut self.input, n).map_err(|_| Status::Param)
    }

    /// Reads a `u32` if at least four bytes remain.
    pub fn read_optional_u32(&mut self) -> Option<u32> {
        if self.input.len() >= 4 {
            self.read_pod::<u32>().ok()
        } else {
            None
        }
    }

    /// Looks at the next `u32` without consuming it.
    pub fn peek_u32(&self) -> Option<u32> {
        let mut probe = self.input;
        u32::decode(&mut probe).ok()
    }

    /// Everything not yet consumed.
    pub fn rest(&self) -> &'a [u8] {
        self.input
    }

    pub fn remaining(&self) -> usize {
        self.input.len()
    }
}

/// Builder for response payloads.
#[derive(Default)]
pub struct PayloadWriter {
    out: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a payload whose first field is `status`.
    pub fn status_first(status: Status) -> Self {
        let mut writer = Self::new();
        writer.write_pod(&status);
        writer
    }

    pub fn write_pod<T: Encode + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.encode(&mut self.out);
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.out.extend_from_slice(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }
}

/// A response payload holding only `status`.
pub fn status_only(status: Status) -> Vec<u8> {
    PayloadWriter::status_first(status).finish()
}

/// Splits a status-first response into its status and the remaining bytes.
pub fn split_status(payload: &[u8]) -> Result<(i32, &[u8]), Status> {
    let mut reader = PayloadReader::new(payload);
    let code = reader.read_pod::<i32>()?;
    Ok((code, reader.rest()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_fails_closed() {
        let data = [1u8, 0, 0, 0, 9];
        let mut reader = PayloadReader::new(&data);
        assert_eq!(reader.read_pod::<u32>(), Ok(1));
        assert_eq!(reader.read_pod::<u32>(), Err(Status::Param));
        // a failed read does not consume the tail
        assert_eq!(reader.read_bytes(1), Ok(&[9u8][..]));
        assert_eq!(reader.read_bytes(1), Err(Status::Param));
    }

    #[test]
    fn optional_and_peek() {
        let data = 0xFFFF_FFFFu32.to_le_bytes();
        let mut reader = PayloadReader::new(&data[..3]);
        assert_eq!(reader.peek_u32(), None);
        assert_eq!(reader.read_optional_u32(), None);
        assert_eq!(reader.remaining(), 3);

        let mut reader = PayloadReader::new(&data);
        assert_eq!(reader.peek_u32(), Some(0xFFFF_FFFF));
        assert_eq!(reader.remaining(), 4);
        assert_eq!(reader.read_optional_u32(), Some(0xFFFF_FFFF));
        assert!(reader.rest().is_empty());
    }

    #[test]
    fn writer_is_status_first() {
        let mut writer = PayloadWriter::status_first(Status::Size);
        writer.write_pod(&7u32).write_bytes(b"hi");
        let out = writer.finish();
        assert_eq!(&out[0..4], &(-7i32).to_le_bytes());
        assert_eq!(&out[4..8], &7u32.to_le_bytes());
        assert_eq!(&out[8..], b"hi");

        let (code, rest) = split_status(&out).unwrap();
        assert_eq!(code, -7);
        assert_eq!(rest.len(), 6);
    }

    #[test]
    fn split_status_rejects_short_payload() {
        assert_eq!(split_status(&[0, 0]), Err(Status::Param));
    }
}
