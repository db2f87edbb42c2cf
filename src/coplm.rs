//! `.coplm` note streams and their translation into VM scripts.
//!
//! A `.coplm` file is a packed little-endian header followed by fixed-size
//! note records:
//!
//! ```text
//! header (24 bytes)
//!   [u8; 4] magic = "CPLM"
//!   u8      version = 1
//!   u8      reserved
//!   u16     flags        bit 0: light the LED while a note sounds
//!   u32     buzz_pin
//!   u32     led_pin
//!   u32     gap_ms       silence after every note
//!   u32     notes_count
//! note (8 bytes) x notes_count
//!   u8      midi note, 0 = rest
//!   u8      reserved0
//!   u16     reserved1
//!   u32     dur_us
//! ```

use crate::types::encoding::{Decode, DecodeError, Encode};
use copro_derive::{BinaryCodec, Error};
use std::fmt::Write as _;
use std::io;
use std::path::Path;

pub const MAGIC: [u8; 4] = *b"CPLM";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 24;
pub const NOTE_LEN: usize = 8;
/// Light the LED while a note sounds.
pub const FLAG_LED: u16 = 1 << 0;

#[derive(Debug, Error)]
pub enum CoplmError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("bad magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("truncated: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },
}

impl From<DecodeError> for CoplmError {
    fn from(_: DecodeError) -> Self {
        CoplmError::Truncated {
            expected: HEADER_LEN,
            actual: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, BinaryCodec)]
struct Header {
    magic: [u8; 4],
    version: u8,
    reserved: u8,
    flags: u16,
    buzz_pin: u32,
    led_pin: u32,
    gap_ms: u32,
    notes_count: u32,
}

/// One note record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, BinaryCodec)]
pub struct Note {
    /// MIDI note number; 0 is a rest.
    pub note: u8,
    pub reserved0: u8,
    pub reserved1: u16,
    pub dur_us: u32,
}

impl Note {
    pub fn new(note: u8, dur_us: u32) -> Self {
        Self {
            note,
            dur_us,
            ..Self::default()
        }
    }

    pub fn is_rest(&self) -> bool {
        self.note == 0
    }

    /// Equal-tempered frequency with A4 (note 69) at 440 Hz.
    pub fn frequency_hz(&self) -> f64 {
        440.0 * 2f64.powf((self.note as f64 - 69.0) / 12.0)
    }

    /// Half of one square-wave period, at least 1 µs.
    pub fn half_period_us(&self) -> u32 {
        ((500_000.0 / self.frequency_hz()).round() as u32).max(1)
    }
}

/// A decoded `.coplm` stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoteStream {
    pub flags: u16,
    pub buzz_pin: u32,
    pub led_pin: u32,
    pub gap_ms: u32,
    pub notes: Vec<Note>,
}

impl NoteStream {
    pub fn from_bytes(data: &[u8]) -> Result<Self, CoplmError> {
        if data.len() < HEADER_LEN {
            return Err(CoplmError::Truncated {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }

        let mut input = data;
        let header = Header::decode(&mut input)?;
        if header.magic != MAGIC {
            return Err(CoplmError::BadMagic(header.magic));
        }
        if header.version != VERSION {
            return Err(CoplmError::UnsupportedVersion(header.version));
        }

        let expected = (header.notes_count as usize)
            .checked_mul(NOTE_LEN)
            .and_then(|n| n.checked_add(HEADER_LEN))
            .unwrap_or(usize::MAX);
        if data.len() < expected {
            return Err(CoplmError::Truncated {
                expected,
                actual: data.len(),
            });
        }

        let notes = (0..header.notes_count)
            .map(|_| Note::decode(&mut input))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            flags: header.flags,
            buzz_pin: header.buzz_pin,
            led_pin: header.led_pin,
            gap_ms: header.gap_ms,
            notes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let header = Header {
            magic: MAGIC,
            version: VERSION,
            reserved: 0,
            flags: self.flags,
            buzz_pin: self.buzz_pin,
            led_pin: self.led_pin,
            gap_ms: self.gap_ms,
            notes_count: self.notes.len() as u32,
        };

        let mut out = Vec::with_capacity(HEADER_LEN + NOTE_LEN * self.notes.len());
        header.encode(&mut out);
        for note in &self.notes {
            note.encode(&mut out);
        }
        out
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, CoplmError> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), CoplmError> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    /// Total playing time including gaps, in microseconds.
    pub fn duration_us(&self) -> u64 {
        self.notes
            .iter()
            .map(|n| n.dur_us as u64 + self.gap_ms as u64 * 1000)
            .sum()
    }

    /// Generates a script that plays the stream by toggling the buzzer pin.
    ///
    /// Each sounding note becomes one counted loop with its own label, so a
    /// stream needs one label per note; long streams need raised VM limits.
    pub fn to_script(&self) -> String {
        let led = self.flags & FLAG_LED != 0;
        let mut script = String::new();

        let _ = writeln!(script, "# {} notes", self.notes.len());
        let _ = writeln!(script, "PINMODE {} OUTPUT", self.buzz_pin);
        if led {
            let _ = writeln!(script, "PINMODE {} OUTPUT", self.led_pin);
        }

        for (i, note) in self.notes.iter().enumerate() {
            if note.is_rest() {
                push_delay(&mut script, note.dur_us);
            } else {
                let half = note.half_period_us();
                let cycles = (note.dur_us / (2 * half)).max(1);
                if led {
                    let _ = writeln!(script, "DWRITE {} HIGH", self.led_pin);
                }
                let _ = writeln!(
                    script,
                    "LET R1 {cycles}\nn{i}: DWRITE {pin} HIGH; DELAY_US {half}; DWRITE {pin} LOW; DELAY_US {half}; SUB R1 1; IF R1 > 0 GOTO n{i}",
                    pin = self.buzz_pin,
                );
                if led {
                    let _ = writeln!(script, "DWRITE {} LOW", self.led_pin);
                }
            }
            if self.gap_ms > 0 {
                let _ = writeln!(script, "DELAY {}", self.gap_ms);
            }
        }

        script.push_str("RET 0\n");
        script
    }
}

/// Emits a delay of `us` microseconds as whole milliseconds plus remainder.
fn push_delay(script: &mut String, us: u32) {
    let (ms, rest) = (us / 1000, us % 1000);
    if ms > 0 {
        let _ = writeln!(script, "DELAY {ms}");
    }
    if rest > 0 {
        let _ = writeln!(script, "DELAY_US {rest}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::pins::PinEvent;
    use crate::vm::{CancelToken, Mailbox, SimPins, Vm};
    use std::sync::Arc;

    fn stream() -> NoteStream {
        NoteStream {
            flags: FLAG_LED,
            buzz_pin: 9,
            led_pin: 13,
            gap_ms: 0,
            notes: vec![Note::new(69, 4_544), Note::new(0, 1_500), Note::new(81, 1_136)],
        }
    }

    #[test]
    fn header_and_note_sizes() {
        let bytes = stream().to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN + 3 * NOTE_LEN);
        assert_eq!(&bytes[..4], b"CPLM");
        assert_eq!(bytes[4], VERSION);
        // notes_count
        assert_eq!(&bytes[20..24], &3u32.to_le_bytes());
        // first note: 69, dur 4544
        assert_eq!(&bytes[24..32], &[69, 0, 0, 0, 0xC0, 0x11, 0, 0]);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tune.coplm");
        stream().write_to(&path).unwrap();
        assert_eq!(NoteStream::read_from(&path).unwrap(), stream());
    }

    #[test]
    fn rejects_bad_input() {
        let mut bytes = stream().to_bytes();
        assert!(matches!(
            NoteStream::from_bytes(&bytes[..10]),
            Err(CoplmError::Truncated { expected: HEADER_LEN, actual: 10 })
        ));
        assert!(matches!(
            NoteStream::from_bytes(&bytes[..30]),
            Err(CoplmError::Truncated { expected: 48, actual: 30 })
        ));

        bytes[4] = 2;
        assert!(matches!(NoteStream::from_bytes(&bytes), Err(CoplmError::UnsupportedVersion(2))));
        bytes[0] = b'X';
        assert!(matches!(NoteStream::from_bytes(&bytes), Err(CoplmError::BadMagic(_))));

        let missing = tempfile::tempdir().unwrap().path().join("none.coplm");
        assert!(matches!(NoteStream::read_from(missing), Err(CoplmError::Io(_))));
    }

    #[test]
    fn a4_half_period() {
        assert_eq!(Note::new(69, 0).half_period_us(), 1136);
        assert_eq!(Note::new(81, 0).half_period_us(), 568);
    }

    #[test]
    fn generated_script_plays_on_the_vm() {
        let script = stream().to_script();
        assert!(script.contains("PINMODE 9 OUTPUT"));
        assert!(script.contains("DELAY 1\nDELAY_US 500"));

        let pins = Arc::new(SimPins::recording());
        let mut vm = Vm::new(pins.clone(), Mailbox::new(8), CancelToken::new());
        let outcome = vm.run(script.as_bytes(), &[], 0).unwrap();
        assert!(outcome.success());

        let buzz_highs = pins
            .take_events()
            .iter()
            .filter(|e| matches!(e, PinEvent::Digital(9, true)))
            .count();
        // 4544 / 2272 = 2 cycles, then 1136 / 1136 = 1 cycle
        assert_eq!(buzz_highs, 3);
        assert_eq!(pins.level(13), Some(0));
    }
}
