//! Device side of the protocol.
//!
//! - [`dispatcher`]: command handlers and device state
//! - [`functions`]: host function registry for FUNC
//! - [`server`]: frame loop over a link

pub mod dispatcher;
pub mod functions;
pub mod server;

pub use dispatcher::{DeviceConfig, Dispatcher};
pub use functions::FunctionRegistry;
pub use server::DeviceServer;
