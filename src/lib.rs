//! Co-processor execution bridge.
//!
//! A host talks to a co-processor over a slow byte link using CRC-checked
//! frames. The co-processor accepts raw Thumb blobs and script text in
//! chunks, runs them on a worker with a time budget and a cancel flag, and
//! reports results and mailbox text back.
//!
//! - [`protocol`]: frame header, command and status codes, payload helpers
//! - [`vm`]: line-oriented scripting VM
//! - [`exec`]: upload buffers, native runners and the worker bridge
//! - [`device`]: command dispatcher and frame server
//! - [`network`]: links, frame codec and the host RPC client
//! - [`coplm`]: `.coplm` note streams and script generation

pub mod coplm;
pub mod device;
pub mod exec;
pub mod network;
pub mod protocol;
pub mod types;
pub mod utils;
pub mod vm;
