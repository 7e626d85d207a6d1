//! Turns composited windows and outputs into PipeWire video streams.
//!
//! [`ScreenCastManager`] is the entry point: it creates one
//! [`StreamSession`] per request and routes frames, damage, pointer updates
//! and source removal to it. Sessions negotiate formats and buffers over a
//! [`StreamTransport`] and fill dequeued buffers through a
//! [`CaptureBackend`].

pub use smithay::backend::allocator::{Fourcc, Modifier as DrmModifier, format::FormatSet};
pub use smithay::reexports::calloop::LoopHandle;

pub mod backend;
pub mod capture;
pub mod config;
pub mod cursor;
pub mod error;
pub mod fence;
pub mod format;
pub mod manager;
pub mod meta;
pub mod pool;
pub mod session;
pub mod source;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod tests;

pub use crate::backend::{CaptureBackend, GlesCaptureBackend};
pub use crate::config::{CursorMode, CursorSettings, StreamConfig};
pub use crate::cursor::{CursorImage, PointerState};
pub use crate::error::{CaptureDrop, CaptureOutcome, ScreencastError};
pub use crate::fence::Reactor;
pub use crate::format::PixelFormat;
pub use crate::manager::{CastRegistry, ScreenCastManager, ScreencastRequest};
pub use crate::session::{SessionEvent, StreamSession};
pub use crate::source::{CastOutput, CastTarget, CastWindow, ScreenCastSource};
pub use crate::transport::{PipeWireCore, PipeWireTransport, StreamTransport, TransportFactory};
