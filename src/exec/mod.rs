//! Loading and running uploaded code.
//!
//! - [`loader`]: BEGIN/DATA/END buffers for blobs and scripts
//! - [`bridge`]: job hand-off to the worker thread
//! - [`native`]: ways of calling a Thumb blob

pub mod bridge;
pub mod loader;
pub mod native;

pub use bridge::{Bridge, Engine, Job, JobState};
pub use loader::{ExecState, LoadBuffer, LoadKind};
pub use native::{NativeRunner, ThumbEmulator, default_runner};
