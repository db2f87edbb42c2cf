//! Frame header, command table, status codes and CRC32.
//!
//! Every message on the link is a fixed 20-byte [`FrameHeader`] followed by
//! `len` payload bytes. The header's CRC covers the payload only and is 0 for
//! empty payloads. Responses echo the request command with bit `0x80` set.
//!
//! # Frame Layout
//!
//! ```text
//! u32 magic   = 0x30525043 ("CPR0" on the wire)
//! u16 version = 0x0001
//! u16 cmd       bit 0x80 set on responses
//! u32 seq
//! u32 len       payload length
//! u32 crc32     CRC32-IEEE of payload, 0 if len == 0
//! ```

use crate::types::encoding::{Decode, DecodeError, Encode};
use copro_derive::{BinaryCodec, Error};

/// Frame magic, little-endian bytes spell `CPR0`.
pub const MAGIC: u32 = 0x3052_5043;
/// Protocol version carried in every header.
pub const VERSION: u16 = 0x0001;
/// Encoded size of [`FrameHeader`].
pub const HEADER_LEN: usize = 20;
/// Set on the `cmd` field of every response.
pub const RESPONSE_BIT: u16 = 0x80;
/// Initial CRC register value.
pub const CRC_SEED: u32 = 0xFFFF_FFFF;
/// Expected-CRC value meaning "accept whatever the device computed".
pub const CRC_TRUST_DEVICE: u32 = 0xFFFF_FFFF;

/// Invokes a callback macro with the complete command table.
///
/// Each entry is `Variant = code, "NAME"`.
#[macro_export]
macro_rules! for_each_command {
    ($callback:ident) => {
        $callback! {
            /// Protocol version and capability bits.
            Hello = 0x01, "HELLO",
            /// Implementation flags, blob length and mailbox capacity.
            Info = 0x02, "INFO",
            /// Allocate the blob buffer: `u32 total_len`.
            LoadBegin = 0x10, "LOAD_BEGIN",
            /// Append raw bytes to the blob buffer.
            LoadData = 0x11, "LOAD_DATA",
            /// Verify the blob: `u32 expected_crc32`.
            LoadEnd = 0x12, "LOAD_END",
            /// Run the loaded blob: `u32 argc, i32 argv[argc], u32 timeout_ms`.
            Exec = 0x20, "EXEC",
            /// Current exec state.
            Status = 0x21, "STATUS",
            /// Read the mailbox: `u32 max_bytes`.
            MailboxRead = 0x22, "MAILBOX_RD",
            /// Raise the cancellation flag.
            Cancel = 0x23, "CANCEL",
            /// Drop loaded code, clear the mailbox, return to idle.
            Reset = 0x24, "RESET",
            /// Allocate the script buffer: `u32 total_len`.
            ScriptBegin = 0x30, "SCRIPT_BEGIN",
            /// Append script text.
            ScriptData = 0x31, "SCRIPT_DATA",
            /// Verify the script: `u32 expected_crc32` (`0xFFFFFFFF` trusts the device).
            ScriptEnd = 0x32, "SCRIPT_END",
            /// Run the loaded script on the VM.
            ScriptExec = 0x33, "SCRIPT_EXEC",
            /// Call a registered host function by name.
            Func = 0x40, "FUNC",
            /// Enter in-system-programming mode.
            IspEnter = 0x60, "ISP_ENTER",
            /// Leave in-system-programming mode.
            IspExit = 0x61, "ISP_EXIT",
        }
    };
}

macro_rules! define_commands {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $code:literal, $mnemonic:literal
        ),* $(,)?
    ) => {
        /// Request command codes. Responses carry `code | 0x80`.
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
        #[repr(u16)]
        pub enum Command {
            $(
                $(#[$doc])*
                $name = $code,
            )*
        }

        impl Command {
            /// Every command in table order.
            pub const ALL: &'static [Command] = &[$(Command::$name),*];

            /// Wire name as used in logs and by the CLI.
            pub const fn name(self) -> &'static str {
                match self {
                    $( Command::$name => $mnemonic, )*
                }
            }
        }

        impl TryFrom<u16> for Command {
            type Error = Status;

            fn try_from(code: u16) -> Result<Self, Self::Error> {
                match code {
                    $( $code => Ok(Command::$name), )*
                    _ => Err(Status::BadCmd),
                }
            }
        }
    };
}

for_each_command!(define_commands);

impl Command {
    /// Code carried by responses to this command.
    pub const fn response_code(self) -> u16 {
        self as u16 | RESPONSE_BIT
    }
}

/// Status code carried as the first `i32` of most response payloads.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, BinaryCodec, Error)]
#[binary_codec(repr = "i32")]
#[repr(i32)]
pub enum Status {
    #[error("ok")]
    Ok = 0,
    #[error("bad magic")]
    BadMagic = -1,
    #[error("bad version")]
    BadVersion = -2,
    #[error("unknown command")]
    BadCmd = -3,
    #[error("malformed or missing parameter")]
    Param = -4,
    #[error("operation not valid in current state")]
    State = -5,
    #[error("out of memory")]
    NoMem = -6,
    #[error("length mismatch or overflow")]
    Size = -7,
    #[error("crc mismatch")]
    Crc = -8,
    #[error("timed out")]
    Timeout = -9,
    #[error("execution failed")]
    Exec = -10,
}

impl Status {
    /// Maps a raw wire value back to a status.
    pub fn from_code(code: i32) -> Option<Status> {
        Status::decode(&mut code.to_le_bytes().as_slice()).ok()
    }

    pub const fn code(self) -> i32 {
        self as i32
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// Fixed 20-byte frame header.
#[derive(Clone, Copy, Debug, Eq, PartialEq, BinaryCodec)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub cmd: u16,
    pub seq: u32,
    pub len: u32,
    pub crc32: u32,
}

impl FrameHeader {
    /// Builds a request header for `payload`.
    pub fn request(cmd: Command, seq: u32, payload: &[u8]) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            cmd: cmd as u16,
            seq,
            len: payload.len() as u32,
            crc32: payload_crc(payload),
        }
    }

    /// Decodes a header from exactly [`HEADER_LEN`] bytes.
    pub fn parse(raw: &[u8; HEADER_LEN]) -> Result<Self, DecodeError> {
        Self::from_bytes(raw)
    }

    /// Encodes to the fixed-size wire form.
    pub fn to_array(&self) -> [u8; HEADER_LEN] {
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&self.to_bytes());
        raw
    }

    pub fn is_response(&self) -> bool {
        self.cmd & RESPONSE_BIT != 0
    }

    /// Request command code with the response bit stripped.
    pub fn base_cmd(&self) -> u16 {
        self.cmd & !RESPONSE_BIT
    }

    /// Framing-level checks done before any handler sees the frame.
    pub fn validate(&self) -> Result<Command, Status> {
        if self.magic != MAGIC {
            return Err(Status::BadMagic);
        }
        if self.version != VERSION {
            return Err(Status::BadVersion);
        }
        Command::try_from(self.base_cmd())
    }

    /// Whether this header answers the request `cmd`.
    pub fn answers(&self, cmd: Command) -> bool {
        self.is_response() && self.base_cmd() == cmd as u16
    }
}

/// Builds the header of a response to `request_cmd`.
pub fn make_response_header(request_cmd: u16, seq: u32, len: u32, crc: u32) -> FrameHeader {
    FrameHeader {
        magic: MAGIC,
        version: VERSION,
        cmd: request_cmd | RESPONSE_BIT,
        seq,
        len,
        crc32: crc,
    }
}

/// CRC32-IEEE (reflected, polynomial 0xEDB88320) starting from register `seed`,
/// output XORed with 0xFFFFFFFF.
pub fn crc32_ieee(data: &[u8], seed: u32) -> u32 {
    // crc32fast keeps the finalized form; the raw register is its complement.
    let mut hasher = crc32fast::Hasher::new_with_initial(!seed);
    hasher.update(data);
    hasher.finalize()
}

/// CRC field value for a payload: 0 when empty.
pub fn payload_crc(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        0
    } else {
        crc32_ieee(payload, CRC_SEED)
    }
}

/// Rolling CRC32 over a stream of chunks.
#[derive(Clone, Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
}

impl Crc32 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// CRC of everything fed so far.
    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    pub fn reset(&mut self) {
        self.hasher.reset();
    }
}

impl std::fmt::Debug for Crc32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Crc32({:#010x})", self.value())
    }
}
