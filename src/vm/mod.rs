//! Line-oriented scripting VM for hardware sequencing.
//!
//! Scripts are plain text executed statement by statement against sixteen
//! `i32` registers, a pin bank and a shared mailbox. Runs are bounded by a
//! wall-clock budget and a cooperative cancel flag.
//!
//! ```text
//! PINMODE 13 OUTPUT
//! LET R1 5
//! blink: DWRITE 13 HIGH; DELAY 100; DWRITE 13 LOW; DELAY 100
//! SUB R1 1
//! IF R1 > 0 GOTO blink
//! PRINT "done"
//! RET R0
//! ```
//!
//! # Modules
//!
//! - [`program`]: statement/label tables over an immutable buffer
//! - [`statement`]: keyword table
//! - [`machine`]: the interpreter loop
//! - [`pins`]: hardware seam and the in-memory pin bank
//! - [`mailbox`]: shared text buffer
//! - [`cancel`]: cancellation flag
//! - [`errors`]: table overflow errors

pub mod cancel;
pub mod errors;
pub mod machine;
pub mod mailbox;
pub mod pins;
pub mod program;
pub mod statement;

pub use cancel::CancelToken;
pub use errors::VmError;
pub use machine::{RunEnd, RunOutcome, Vm};
pub use mailbox::Mailbox;
pub use pins::{PinMode, Pins, SimPins};
pub use program::VmLimits;
