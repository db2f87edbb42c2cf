//! Host/device transport.
//!
//! - [`link`]: byte-stream links (in-memory and TCP)
//! - [`codec`]: paced frame writer and resynchronising frame reader
//! - [`client`]: typed RPC calls for the host

pub mod client;
pub mod codec;
pub mod link;

pub use client::{ClientConfig, RpcClient, RpcError};
pub use codec::{Frame, FrameCodec};
pub use link::{Link, LocalLink, TcpLink};
