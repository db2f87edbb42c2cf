//! Wire encoding primitives.
//!
//! - [`encoding`]: `Encode`/`Decode` traits for the packed little-endian format
//!   used by frame headers, replies and `.coplm` files

pub mod encoding;
