//! Stream geometry and buffer pools derived from the committed parameters.

use std::sync::Arc;

use crate::capture::frame::{Dimension, PixelFormat, StreamType, METADATA_BUF_LEN};
use crate::channel::{StreamAllocator, StreamInfo};
use crate::display::PreviewWindow;
use crate::driver::StreamingMode;
use crate::error::{HalError, HalResult};
use crate::mem::{CameraMemory, DisplayMemory, MemfdBackend, StreamMemory, VideoMemory};
use crate::CameraConfig;

use super::parameters::Parameters;

/// Allocator for the streams of one channel
pub(crate) struct StreamPlan<'a> {
    pub params: &'a Parameters,
    pub camera: &'a CameraConfig,
    /// Window-backed preview buffers when set
    pub window: Option<Arc<dyn PreviewWindow>>,
    /// Snapshot-side streams stop after this many frames
    pub burst: Option<u32>,
    pub snapshot_bufs: usize,
    pub store_metadata: bool,
}

impl<'a> StreamPlan<'a> {
    pub fn new(params: &'a Parameters, camera: &'a CameraConfig) -> Self {
        Self {
            params,
            camera,
            window: None,
            burst: None,
            snapshot_bufs: camera.snapshot_buffers,
            store_metadata: false,
        }
    }

    pub fn with_window(mut self, window: Option<Arc<dyn PreviewWindow>>) -> Self {
        self.window = window;
        self
    }

    /// Capture `num` frames; every one of them needs its own buffer.
    pub fn burst(mut self, num: u32) -> Self {
        self.burst = Some(num);
        self.snapshot_bufs = self.camera.snapshot_buffers.max(num as usize);
        self
    }

    /// Keep a rolling history deep enough for zero-shutter-lag capture.
    pub fn zsl(mut self) -> Self {
        self.burst = None;
        self.snapshot_bufs = self.camera.zsl_depth + self.camera.snapshot_buffers;
        self
    }

    pub fn store_metadata(mut self, on: bool) -> Self {
        self.store_metadata = on;
        self
    }
}

impl StreamAllocator for StreamPlan<'_> {
    fn stream_info(&self, stream_type: StreamType) -> HalResult<StreamInfo> {
        let p = self.params;
        let snapshot_mode = match self.burst {
            Some(n) => StreamingMode::Burst(n),
            None => StreamingMode::Continuous,
        };
        let (dim, format, mode, buf_count) = match stream_type {
            StreamType::Preview => (
                p.preview_size(),
                p.preview_format(),
                StreamingMode::Continuous,
                self.camera.preview_buffers,
            ),
            StreamType::Metadata => (
                Dimension::new(METADATA_BUF_LEN as u32, 1),
                PixelFormat::Nv21,
                StreamingMode::Continuous,
                self.camera.metadata_buffers,
            ),
            StreamType::Video => (
                p.video_size(),
                PixelFormat::Nv21,
                StreamingMode::Continuous,
                self.camera.video_buffers,
            ),
            StreamType::Snapshot => (p.picture_size(), PixelFormat::Nv21, snapshot_mode, self.snapshot_bufs),
            StreamType::Postview => {
                let dim = p.thumbnail_size().ok_or_else(|| {
                    HalError::InvalidOperation("postview requested with thumbnails disabled".into())
                })?;
                (dim, PixelFormat::Nv21, snapshot_mode, self.snapshot_bufs)
            }
            StreamType::Raw => (p.picture_size(), PixelFormat::Raw8, snapshot_mode, self.snapshot_bufs),
            StreamType::Reprocess => (
                p.picture_size(),
                PixelFormat::Nv21,
                StreamingMode::Continuous,
                self.camera.snapshot_buffers,
            ),
        };
        Ok(StreamInfo {
            stream_type,
            dim,
            format,
            mode,
            buf_count,
        })
    }

    fn allocate_stream_buf(&self, info: &StreamInfo, size: usize) -> HalResult<Box<dyn CameraMemory>> {
        let mut memory: Box<dyn CameraMemory> = match (info.stream_type, &self.window) {
            (StreamType::Preview, Some(window)) => {
                Box::new(DisplayMemory::new(window.clone(), info.dim, info.format))
            }
            (StreamType::Video, _) => Box::new(VideoMemory::new(Arc::new(MemfdBackend), self.store_metadata)),
            _ => Box::new(StreamMemory::default()),
        };
        memory.allocate(info.buf_count, size)?;
        Ok(memory)
    }
}
