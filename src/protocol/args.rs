//! Argument sections shared by SCRIPT_EXEC and FUNC.
//!
//! ```text
//! binary: u32 argc, i32 argv[argc]
//! ascii:  u32 argc, u32 marker = 0xFFFFFFFF, {u32 slen, bytes[slen]} x argc
//! ```
//!
//! The marker occupies the slot where the first binary argument would be, so
//! decoding sniffs it. [`write_args`] never produces a binary section whose
//! first value is -1; it switches to ASCII form instead, keeping what this
//! crate puts on the wire unambiguous.

use crate::protocol::frame::Status;
use crate::protocol::payload::{PayloadReader, PayloadWriter};

/// Marker that introduces ASCII arguments.
pub const ASCII_MARKER: u32 = 0xFFFF_FFFF;
/// Largest argc accepted from the wire.
pub const MAX_WIRE_ARGS: u32 = 64;
/// Arguments passed to native code; extra values are dropped.
pub const MAX_NATIVE_ARGS: usize = 8;
/// Arguments preloaded into VM registers; extra values are dropped.
pub const MAX_VM_ARGS: usize = 16;
/// Longest single ASCII argument accepted.
pub const MAX_ASCII_ARG_LEN: u32 = 64;

/// Requested argument encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArgEncoding {
    #[default]
    Binary,
    Ascii,
}

/// A decoded argument section, tagged with the form it arrived in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Args {
    Binary(Vec<i32>),
    Ascii(Vec<i32>),
}

impl Default for Args {
    fn default() -> Self {
        Args::Binary(Vec::new())
    }
}

impl Args {
    pub fn values(&self) -> &[i32] {
        match self {
            Args::Binary(values) | Args::Ascii(values) => values,
        }
    }

    pub fn encoding(&self) -> ArgEncoding {
        match self {
            Args::Binary(_) => ArgEncoding::Binary,
            Args::Ascii(_) => ArgEncoding::Ascii,
        }
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }

    /// First `N` values, zero padded.
    pub fn padded<const N: usize>(&self) -> [i32; N] {
        let mut out = [0i32; N];
        for (slot, value) in out.iter_mut().zip(self.values()) {
            *slot = *value;
        }
        out
    }

    /// Decodes an argument section, auto-detecting its form.
    pub fn read(reader: &mut PayloadReader<'_>) -> Result<Args, Status> {
        let argc = reader.read_pod::<u32>()?;
        if argc > MAX_WIRE_ARGS {
            return Err(Status::Param);
        }
        if argc == 0 {
            return Ok(Args::Binary(Vec::new()));
        }

        if reader.peek_u32() == Some(ASCII_MARKER) {
            reader.read_pod::<u32>()?;
            let mut values = Vec::with_capacity(argc as usize);
            for _ in 0..argc {
                let len = reader.read_pod::<u32>()?;
                if len > MAX_ASCII_ARG_LEN {
                    return Err(Status::Param);
                }
                values.push(parse_int(reader.read_bytes(len as usize)?));
            }
            return Ok(Args::Ascii(values));
        }

        read_binary_values(reader, argc).map(Args::Binary)
    }
}

/// Reads `argc` raw little-endian `i32` values.
pub fn read_binary_values(reader: &mut PayloadReader<'_>, argc: u32) -> Result<Vec<i32>, Status> {
    if argc > MAX_WIRE_ARGS {
        return Err(Status::Param);
    }
    let mut values = Vec::with_capacity(argc as usize);
    for _ in 0..argc {
        values.push(reader.read_pod::<i32>()?);
    }
    Ok(values)
}

/// Appends an argument section and returns the encoding actually used.
pub fn write_args(writer: &mut PayloadWriter, args: &[i32], encoding: ArgEncoding) -> ArgEncoding {
    let encoding = match encoding {
        _ if args.is_empty() => ArgEncoding::Binary,
        ArgEncoding::Binary if args[0] as u32 == ASCII_MARKER => ArgEncoding::Ascii,
        other => other,
    };

    writer.write_pod(&(args.len() as u32));
    match encoding {
        ArgEncoding::Binary => {
            for value in args {
                writer.write_pod(value);
            }
        }
        ArgEncoding::Ascii => {
            writer.write_pod(&ASCII_MARKER);
            for value in args {
                let text = value.to_string();
                writer.write_pod(&(text.len() as u32));
                writer.write_bytes(text.as_bytes());
            }
        }
    }
    encoding
}

/// Permissive integer parser.
///
/// Accepts surrounding whitespace, an optional sign, and decimal or `0x` hex
/// digits. Parsing stops at the first character that is not a digit; no digits
/// at all yields 0. Values wrap to 32 bits, so `0xFFFFFFFF` is -1.
pub fn parse_int(text: &[u8]) -> i32 {
    let text = text.trim_ascii();
    let (negative, digits) = match text.split_first() {
        Some((b'-', rest)) => (true, rest),
        Some((b'+', rest)) => (false, rest),
        _ => (false, text),
    };

    let (radix, digits) = match digits {
        [b'0', b'x' | b'X', rest @ ..] => (16, rest),
        _ => (10, digits),
    };

    let mut value: u32 = 0;
    for &b in digits {
        let Some(d) = (b as char).to_digit(radix) else {
            break;
        };
        value = value.wrapping_mul(radix).wrapping_add(d);
    }

    let value = value as i32;
    if negative { value.wrapping_neg() } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ascii_section(args: &[&str]) -> Vec<u8> {
        let mut writer = PayloadWriter::new();
        writer.write_pod(&(args.len() as u32)).write_pod(&ASCII_MARKER);
        for arg in args {
            writer.write_pod(&(arg.len() as u32)).write_bytes(arg.as_bytes());
        }
        writer.finish()
    }

    #[test]
    fn parse_int_forms() {
        assert_eq!(parse_int(b"-17"), -17);
        assert_eq!(parse_int(b"0x1A"), 26);
        assert_eq!(parse_int(b"  +42 \r\n"), 42);
        assert_eq!(parse_int(b"-0x10"), -16);
        assert_eq!(parse_int(b"0xFFFFFFFF"), -1);
        assert_eq!(parse_int(b"12abc"), 12);
        assert_eq!(parse_int(b"abc"), 0);
        assert_eq!(parse_int(b""), 0);
    }

    #[test]
    fn ascii_section_is_detected() {
        let payload = ascii_section(&["-17", "0x1A"]);
        let mut reader = PayloadReader::new(&payload);
        assert_eq!(Args::read(&mut reader), Ok(Args::Ascii(vec![-17, 26])));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn binary_section_is_default() {
        let mut writer = PayloadWriter::new();
        writer.write_pod(&2u32).write_pod(&-17i32).write_pod(&26i32).write_pod(&500u32);
        let payload = writer.finish();

        let mut reader = PayloadReader::new(&payload);
        assert_eq!(Args::read(&mut reader), Ok(Args::Binary(vec![-17, 26])));
        assert_eq!(reader.read_optional_u32(), Some(500));
    }

    #[test]
    fn zero_args_leave_following_fields_alone() {
        let mut writer = PayloadWriter::new();
        writer.write_pod(&0u32).write_pod(&ASCII_MARKER);
        let payload = writer.finish();

        let mut reader = PayloadReader::new(&payload);
        assert!(Args::read(&mut reader).unwrap().is_empty());
        assert_eq!(reader.read_optional_u32(), Some(ASCII_MARKER));
    }

    #[test]
    fn oversized_argc_is_rejected() {
        let payload = (MAX_WIRE_ARGS + 1).to_le_bytes();
        let mut reader = PayloadReader::new(&payload);
        assert_eq!(Args::read(&mut reader), Err(Status::Param));
    }

    #[test]
    fn truncated_sections_are_rejected() {
        let mut payload = ascii_section(&["123"]);
        payload.pop();
        assert_eq!(Args::read(&mut PayloadReader::new(&payload)), Err(Status::Param));

        let payload = [2u8, 0, 0, 0, 1, 0, 0, 0];
        assert_eq!(Args::read(&mut PayloadReader::new(&payload)), Err(Status::Param));
    }

    #[test]
    fn writer_avoids_marker_collision() {
        let mut writer = PayloadWriter::new();
        let used = write_args(&mut writer, &[-1, 5], ArgEncoding::Binary);
        assert_eq!(used, ArgEncoding::Ascii);

        let payload = writer.finish();
        assert_eq!(
            Args::read(&mut PayloadReader::new(&payload)),
            Ok(Args::Ascii(vec![-1, 5]))
        );
    }

    #[test]
    fn writer_round_trips_both_forms() {
        for encoding in [ArgEncoding::Binary, ArgEncoding::Ascii] {
            let mut writer = PayloadWriter::new();
            assert_eq!(write_args(&mut writer, &[3, -4, 0x7FFF_FFFF], encoding), encoding);
            let payload = writer.finish();
            let args = Args::read(&mut PayloadReader::new(&payload)).unwrap();
            assert_eq!(args.values(), &[3, -4, 0x7FFF_FFFF]);
            assert_eq!(args.encoding(), encoding);
        }
    }

    #[test]
    fn padded_truncates_and_fills() {
        let args = Args::Binary((1..=10).collect());
        assert_eq!(args.padded::<8>(), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(Args::Ascii(vec![9]).padded::<3>(), [9, 0, 0]);
    }
}
