//! Frame descriptors shared by the driver, streams, channels and the post-processor.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{HalError, HalResult};
use crate::mem::block::BufferBlock;

/// Opaque handle for cameras, channels and streams. Zero is never valid.
pub type Handle = u32;

/// Hardware data path carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    Preview,
    Postview,
    Metadata,
    Snapshot,
    Video,
    Raw,
    Reprocess,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Nv12,
    Nv21,
    Yv12,
    Nv16,
    Rgb24,
    Raw8,
}

impl PixelFormat {
    /// Framework parameter spelling
    pub fn as_param(&self) -> &'static str {
        match self {
            PixelFormat::Nv12 => "yuv420sp-nv12",
            PixelFormat::Nv21 => "yuv420sp",
            PixelFormat::Yv12 => "yuv420p",
            PixelFormat::Nv16 => "yuv422sp",
            PixelFormat::Rgb24 => "rgb888",
            PixelFormat::Raw8 => "raw8",
        }
    }

    pub fn from_param(s: &str) -> Option<Self> {
        match s {
            "yuv420sp-nv12" => Some(PixelFormat::Nv12),
            "yuv420sp" => Some(PixelFormat::Nv21),
            "yuv420p" => Some(PixelFormat::Yv12),
            "yuv422sp" => Some(PixelFormat::Nv16),
            "rgb888" => Some(PixelFormat::Rgb24),
            "raw8" => Some(PixelFormat::Raw8),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Dimension {
    pub width: u32,
    pub height: u32,
}

impl Dimension {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parses the `WxH` form used by parameter strings.
    pub fn parse(s: &str) -> Option<Self> {
        let (w, h) = s.split_once('x')?;
        Some(Self::new(w.trim().parse().ok()?, h.trim().parse().ok()?))
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Placement of one plane inside a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneOffset {
    /// Bytes in this plane
    pub len: usize,
    /// Start of the plane from the beginning of the buffer
    pub offset: usize,
    pub stride: u32,
    pub scanline: u32,
}

/// Per-frame plane layout, computed once per stream configuration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameLenOffset {
    pub planes: Vec<PlaneOffset>,
    pub frame_len: usize,
}

/// Fixed size of one encoded metadata record buffer
pub const METADATA_BUF_LEN: usize = 4096;

fn align(v: u32, to: u32) -> u32 {
    if to <= 1 {
        v
    } else {
        v.div_ceil(to) * to
    }
}

impl FrameLenOffset {
    /// Lay out planes for `dim` in `format`, padding each stride to `padding` bytes.
    pub fn compute(dim: Dimension, format: PixelFormat, padding: u32) -> Self {
        let stride = align(dim.width, padding);
        let scanline = align(dim.height, 2);
        let luma = (stride * scanline) as usize;
        let planes: Vec<(usize, u32, u32)> = match format {
            PixelFormat::Nv12 | PixelFormat::Nv21 => {
                vec![(luma, stride, scanline), (luma / 2, stride, scanline / 2)]
            }
            PixelFormat::Nv16 => vec![(luma, stride, scanline), (luma, stride, scanline)],
            PixelFormat::Yv12 => {
                let cstride = align(stride / 2, 16);
                let chroma = (cstride * scanline / 2) as usize;
                vec![
                    (luma, stride, scanline),
                    (chroma, cstride, scanline / 2),
                    (chroma, cstride, scanline / 2),
                ]
            }
            PixelFormat::Rgb24 => {
                let s = align(dim.width * 3, padding);
                vec![((s * dim.height) as usize, s, dim.height)]
            }
            PixelFormat::Raw8 => vec![((stride * dim.height) as usize, stride, dim.height)],
        };

        let mut offset = 0;
        let planes = planes
            .into_iter()
            .map(|(len, stride, scanline)| {
                let p = PlaneOffset {
                    len,
                    offset,
                    stride,
                    scanline,
                };
                offset += len;
                p
            })
            .collect();
        Self {
            planes,
            frame_len: offset,
        }
    }

    /// Single-plane layout for the metadata stream
    pub fn metadata() -> Self {
        Self {
            planes: vec![PlaneOffset {
                len: METADATA_BUF_LEN,
                offset: 0,
                stride: METADATA_BUF_LEN as u32,
                scanline: 1,
            }],
            frame_len: METADATA_BUF_LEN,
        }
    }
}

/// One filled (or fillable) buffer of a stream
#[derive(Debug, Clone)]
pub struct BufDef {
    pub stream: Handle,
    pub stream_type: StreamType,
    /// Slot in the owning pool
    pub index: usize,
    /// Driver frame counter, used to match buffers across streams
    pub frame_idx: u64,
    pub fd: RawFd,
    pub frame_len: usize,
    pub planes: Vec<PlaneOffset>,
    pub block: BufferBlock,
    pub timestamp: Duration,
}

impl BufDef {
    /// Copy of the frame payload
    pub fn data(&self) -> Bytes {
        self.block.read(0, self.frame_len)
    }
}

/// Capability that takes a buffer back into the driver's free queue
pub trait BufferReturn: Send + Sync {
    fn buf_done(&self, channel: Handle, buf: &BufDef) -> HalResult<()>;
}

/// A set of buffers from one channel, matched on frame index.
///
/// The set goes back to the driver exactly once: explicitly via
/// [`SuperBuf::release`], or implicitly when dropped. [`SuperBuf::detach`]
/// hands ownership elsewhere (the display queue) so nothing is returned.
pub struct SuperBuf {
    pub camera: Handle,
    pub channel: Handle,
    bufs: Vec<BufDef>,
    returner: Option<Arc<dyn BufferReturn>>,
}

impl std::fmt::Debug for SuperBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuperBuf")
            .field("camera", &self.camera)
            .field("channel", &self.channel)
            .field("bufs", &self.bufs.len())
            .field("frame_idx", &self.frame_idx())
            .finish()
    }
}

impl SuperBuf {
    pub fn new(
        camera: Handle,
        channel: Handle,
        bufs: Vec<BufDef>,
        returner: Arc<dyn BufferReturn>,
    ) -> Self {
        Self {
            camera,
            channel,
            bufs,
            returner: Some(returner),
        }
    }

    /// Merge single-stream sets into one matched set.
    pub fn combine(camera: Handle, channel: Handle, parts: Vec<SuperBuf>) -> Self {
        let mut bufs = Vec::new();
        let mut returner = None;
        for part in parts {
            let (b, r) = part.into_parts();
            bufs.extend(b);
            returner = returner.or(r);
        }
        Self {
            camera,
            channel,
            bufs,
            returner,
        }
    }

    pub fn bufs(&self) -> &[BufDef] {
        &self.bufs
    }

    pub fn num_bufs(&self) -> usize {
        self.bufs.len()
    }

    pub fn find(&self, ty: StreamType) -> Option<&BufDef> {
        self.bufs.iter().find(|b| b.stream_type == ty)
    }

    pub fn find_stream(&self, stream: Handle) -> Option<&BufDef> {
        self.bufs.iter().find(|b| b.stream == stream)
    }

    pub fn frame_idx(&self) -> u64 {
        self.bufs.first().map(|b| b.frame_idx).unwrap_or(0)
    }

    /// Remove one stream's buffer into its own set, sharing the returner.
    pub fn split_off(&mut self, stream: Handle) -> Option<SuperBuf> {
        let pos = self.bufs.iter().position(|b| b.stream == stream)?;
        let buf = self.bufs.remove(pos);
        Some(SuperBuf {
            camera: self.camera,
            channel: self.channel,
            bufs: vec![buf],
            returner: self.returner.clone(),
        })
    }

    /// Return every buffer to the driver.
    pub fn release(mut self) -> HalResult<()> {
        self.return_all()
    }

    /// Take the buffers without returning them; the caller now owns their fate.
    pub fn detach(self) -> Vec<BufDef> {
        self.into_parts().0
    }

    fn into_parts(mut self) -> (Vec<BufDef>, Option<Arc<dyn BufferReturn>>) {
        (std::mem::take(&mut self.bufs), self.returner.take())
    }

    fn return_all(&mut self) -> HalResult<()> {
        let Some(returner) = self.returner.take() else {
            return Ok(());
        };
        let mut first_err = None;
        for buf in self.bufs.drain(..) {
            if let Err(e) = returner.buf_done(self.channel, &buf) {
                warn!(stream = buf.stream, index = buf.index, "buf_done failed: {}", e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for SuperBuf {
    fn drop(&mut self) {
        let _ = self.return_all();
    }
}

/// A detected face, in sensor coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaceRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub score: u8,
}

/// Per-frame statistics delivered on the metadata stream
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataRecord {
    pub frame_idx: u64,
    pub focus_state: u8,
    pub faces: Vec<FaceRect>,
    pub histogram: Vec<u32>,
}

impl MetadataRecord {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(METADATA_BUF_LEN);
        out.put_u64_le(self.frame_idx);
        out.put_u8(self.focus_state);
        out.put_u16_le(self.faces.len() as u16);
        for f in &self.faces {
            out.put_i32_le(f.left);
            out.put_i32_le(f.top);
            out.put_i32_le(f.right);
            out.put_i32_le(f.bottom);
            out.put_u8(f.score);
        }
        out.put_u16_le(self.histogram.len() as u16);
        for bin in &self.histogram {
            out.put_u32_le(*bin);
        }
        out.freeze()
    }

    pub fn decode(mut data: &[u8]) -> HalResult<Self> {
        let short = || HalError::InvalidArgument("truncated metadata record".into());
        if data.remaining() < 11 {
            return Err(short());
        }
        let frame_idx = data.get_u64_le();
        let focus_state = data.get_u8();
        let n_faces = data.get_u16_le() as usize;
        if data.remaining() < n_faces * 17 + 2 {
            return Err(short());
        }
        let faces = (0..n_faces)
            .map(|_| FaceRect {
                left: data.get_i32_le(),
                top: data.get_i32_le(),
                right: data.get_i32_le(),
                bottom: data.get_i32_le(),
                score: data.get_u8(),
            })
            .collect();
        let n_bins = data.get_u16_le() as usize;
        if data.remaining() < n_bins * 4 {
            return Err(short());
        }
        let histogram = (0..n_bins).map(|_| data.get_u32_le()).collect();
        Ok(Self {
            frame_idx,
            focus_state,
            faces,
            histogram,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::block::{AnonBackend, MemoryBackend};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(Handle, usize)>>);

    impl BufferReturn for Recorder {
        fn buf_done(&self, _channel: Handle, buf: &BufDef) -> HalResult<()> {
            self.0.lock().unwrap().push((buf.stream, buf.index));
            Ok(())
        }
    }

    fn buf(stream: Handle, index: usize) -> BufDef {
        BufDef {
            stream,
            stream_type: StreamType::Preview,
            index,
            frame_idx: 7,
            fd: -1,
            frame_len: 16,
            planes: Vec::new(),
            block: AnonBackend.allocate(4096).unwrap(),
            timestamp: Duration::ZERO,
        }
    }

    #[test]
    fn nv21_layout() {
        let l = FrameLenOffset::compute(Dimension::new(640, 480), PixelFormat::Nv21, 32);
        assert_eq!(l.planes.len(), 2);
        assert_eq!(l.planes[0].len, 640 * 480);
        assert_eq!(l.planes[1].offset, 640 * 480);
        assert_eq!(l.frame_len, 640 * 480 * 3 / 2);
    }

    #[test]
    fn stride_is_padded() {
        let l = FrameLenOffset::compute(Dimension::new(100, 10), PixelFormat::Nv12, 64);
        assert_eq!(l.planes[0].stride, 128);
    }

    #[test]
    fn dropped_superbuf_returns_once() {
        let rec = Arc::new(Recorder::default());
        let sb = SuperBuf::new(1, 2, vec![buf(3, 0), buf(4, 1)], rec.clone());
        drop(sb);
        assert_eq!(rec.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn released_superbuf_does_not_double_return() {
        let rec = Arc::new(Recorder::default());
        let sb = SuperBuf::new(1, 2, vec![buf(3, 0)], rec.clone());
        sb.release().unwrap();
        assert_eq!(rec.0.lock().unwrap().as_slice(), &[(3, 0)]);
    }

    #[test]
    fn detached_superbuf_is_not_returned() {
        let rec = Arc::new(Recorder::default());
        let sb = SuperBuf::new(1, 2, vec![buf(3, 0)], rec.clone());
        let bufs = sb.detach();
        assert_eq!(bufs.len(), 1);
        assert!(rec.0.lock().unwrap().is_empty());
    }

    #[test]
    fn split_off_keeps_both_halves_returnable() {
        let rec = Arc::new(Recorder::default());
        let mut sb = SuperBuf::new(1, 2, vec![buf(3, 0), buf(4, 0)], rec.clone());
        let part = sb.split_off(4).unwrap();
        assert_eq!(sb.num_bufs(), 1);
        drop(part);
        drop(sb);
        assert_eq!(rec.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn metadata_record_decodes_what_it_encodes() {
        let rec = MetadataRecord {
            frame_idx: 42,
            focus_state: 2,
            faces: vec![FaceRect {
                left: -5,
                top: 1,
                right: 20,
                bottom: 30,
                score: 90,
            }],
            histogram: vec![1, 2, 3],
        };
        assert_eq!(MetadataRecord::decode(&rec.encode()).unwrap(), rec);
        assert!(MetadataRecord::decode(&[0u8; 4]).is_err());
    }
}
