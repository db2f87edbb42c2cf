//! Derive macros for the copro crate.
//!
//! Provides:
//! - `#[derive(BinaryCodec)]` - little-endian wire encoding for frame headers,
//!   reply structs and protocol enums
//! - `#[derive(Error)]` - `Display`/`Error` boilerplate with optional `#[from]` conversions

mod binary_codec;
mod error;

use proc_macro::TokenStream;

/// Implements `Encode` and `Decode` for wire structs and enums.
///
/// Enums may select the discriminant width with `#[binary_codec(repr = "u16")]`
/// (any of `u8`, `u16`, `u32`, `i8`, `i16`, `i32`; defaults to `u8`).
#[proc_macro_derive(BinaryCodec, attributes(binary_codec))]
pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    binary_codec::derive_binary_codec(input)
}

/// Implements `Display` and `Error`, plus `From` for fields marked `#[from]`.
#[proc_macro_derive(Error, attributes(error, from))]
pub fn derive_error(input: TokenStream) -> TokenStream {
    error::derive_error(input)
}
