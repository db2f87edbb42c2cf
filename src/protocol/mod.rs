//! Wire protocol between the host and the co-processor.
//!
//! - [`frame`]: 20-byte header, command and status codes, CRC32
//! - [`payload`]: bounds-checked readers and status-first writers
//! - [`args`]: dual-form argument sections for SCRIPT_EXEC and FUNC

pub mod args;
pub mod frame;
pub mod payload;

pub use frame::{Command, FrameHeader, Status};
