//! Lower driver seam: channel/stream plumbing, buffer queueing and events.
//!
//! The HAL core only talks to hardware through [`CameraOps`]. [`sim`] provides
//! a software implementation that produces synthetic frames.

pub mod sim;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capture::frame::{
    BufDef, BufferReturn, Dimension, FrameLenOffset, Handle, PixelFormat, StreamType, SuperBuf,
};
use crate::error::HalResult;

pub use sim::{DriverCall, Fault, SimDriver, SimProvider};

/// Asynchronous notifications raised by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraEvent {
    ZoomDone { zoom: u32 },
    AutoFocusDone { focused: bool },
    MapDone,
    UnmapDone,
}

pub type EventCallback = Arc<dyn Fn(CameraEvent) + Send + Sync>;

/// Per-buffer data-ready callback registered for each stream
pub type FrameCallback = Arc<dyn Fn(SuperBuf) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    Continuous,
    /// Produce this many frames after start, then go quiet
    Burst(u32),
}

/// Everything the driver needs to run one stream
#[derive(Clone)]
pub struct StreamConfig {
    pub stream_type: StreamType,
    pub dim: Dimension,
    pub format: PixelFormat,
    pub layout: FrameLenOffset,
    pub mode: StreamingMode,
    pub bufs: Vec<BufDef>,
    /// Buffers to queue immediately; the rest stay with the HAL until queued
    pub reg_flags: Vec<bool>,
    pub data_cb: FrameCallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Facing {
    Back,
    Front,
}

/// Static description of a sensor, served before open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub camera_id: u32,
    pub facing: Facing,
    pub orientation: u32,
    pub preview_sizes: Vec<Dimension>,
    pub picture_sizes: Vec<Dimension>,
    pub video_sizes: Vec<Dimension>,
    pub preview_formats: Vec<PixelFormat>,
    pub max_zoom: u32,
    /// Stride alignment the ISP requires
    pub padding: u32,
    pub supports_zsl: bool,
    pub supports_auto_focus: bool,
    pub max_num_faces: u32,
}

/// Operations exposed by an opened camera.
///
/// Buffers travel back through the [`BufferReturn`] supertrait, which is
/// also the returner embedded in every [`SuperBuf`] the driver emits.
pub trait CameraOps: BufferReturn {
    fn camera_handle(&self) -> Handle;
    fn query_capability(&self) -> HalResult<Capabilities>;
    fn register_event_notify(&self, cb: EventCallback) -> HalResult<()>;

    fn add_channel(&self) -> HalResult<Handle>;
    fn delete_channel(&self, channel: Handle) -> HalResult<()>;
    fn add_stream(&self, channel: Handle) -> HalResult<Handle>;
    fn delete_stream(&self, channel: Handle, stream: Handle) -> HalResult<()>;
    fn config_stream(&self, channel: Handle, stream: Handle, config: StreamConfig) -> HalResult<()>;
    fn start_channel(&self, channel: Handle) -> HalResult<()>;
    /// After this returns no data callback for the channel fires.
    fn stop_channel(&self, channel: Handle) -> HalResult<()>;

    fn qbuf(&self, channel: Handle, buf: &BufDef) -> HalResult<()> {
        self.buf_done(channel, buf)
    }

    /// Commit a batch of changed parameters.
    fn set_parms(&self, parms: &BTreeMap<String, String>) -> HalResult<()>;
    fn do_auto_focus(&self) -> HalResult<()>;
    fn cancel_auto_focus(&self) -> HalResult<()>;

    /// Feed `input` through the ISP again; the result arrives on `stream`'s callback.
    fn do_reprocess(&self, channel: Handle, stream: Handle, input: &BufDef) -> HalResult<()>;

    fn close(&self) -> HalResult<()>;
}

/// Enumerates and opens cameras for the registry
pub trait CameraProvider: Send + Sync {
    fn num_cameras(&self) -> usize;
    fn capabilities(&self, camera_id: u32) -> HalResult<Capabilities>;
    fn open(&self, camera_id: u32) -> HalResult<Arc<dyn CameraOps>>;
}
