//! Preview window seam.
//!
//! The compositor owns a queue of buffers. The HAL dequeues them, write-locks
//! them while the sensor fills them, then unlocks and enqueues them for display.

pub mod display;

use std::time::Duration;

use crate::capture::frame::{Dimension, PixelFormat};
use crate::error::HalResult;
use crate::mem::BufferBlock;

pub use display::{ChannelWindow, DisplayedFrame};

/// Compositor-side identity of a window buffer
pub type BufferId = u64;

#[derive(Debug, Clone)]
pub struct WindowBuffer {
    pub id: BufferId,
    pub block: BufferBlock,
}

/// Native-window operations consumed by the display-backed pool
pub trait PreviewWindow: Send + Sync {
    fn min_undequeued_buffer_count(&self) -> HalResult<usize>;
    fn set_buffer_count(&self, count: usize) -> HalResult<()>;
    fn set_buffers_geometry(&self, dim: Dimension, format: PixelFormat) -> HalResult<()>;
    fn dequeue_buffer(&self) -> HalResult<WindowBuffer>;
    /// Take the write lock before hardware fills the buffer.
    fn lock_buffer(&self, id: BufferId) -> HalResult<()>;
    fn unlock_buffer(&self, id: BufferId) -> HalResult<()>;
    fn enqueue_buffer(&self, id: BufferId, timestamp: Duration) -> HalResult<()>;
    fn cancel_buffer(&self, id: BufferId) -> HalResult<()>;
}
