//! Channels: streams that start and stop as one unit.
//!
//! Streams registered without their own callback are bundled: their frames are
//! matched on frame index and delivered as one [`SuperBuf`] to the channel
//! callback. In burst mode matched sets are kept in a [`ZslRing`] until a
//! picture is requested.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info, instrument, warn};

use super::stream::{FrameSink, Stream, StreamAllocator, StreamCallback};
use crate::capture::frame::{Handle, StreamType, SuperBuf};
use crate::driver::CameraOps;
use crate::error::{HalError, HalResult};
use crate::mem::BufferBlock;
use crate::pipeline::ZslRing;

/// Incomplete sets older than this many frames are given up on
const MAX_PENDING_SETS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelType {
    /// Preview and snapshot, with a rolling history for zero-shutter-lag capture
    Zsl,
    /// Snapshot and postview for a regular still capture
    Capture,
    Preview,
    Video,
    Snapshot,
    Raw,
    Metadata,
    Reprocess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMode {
    /// Every matched set goes to the callback
    Continuous,
    /// Matched sets are retained and delivered on request
    Burst,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelAttr {
    pub notify_mode: NotifyMode,
    pub zsl_depth: usize,
    pub bundle_cap: usize,
}

impl Default for ChannelAttr {
    fn default() -> Self {
        Self {
            notify_mode: NotifyMode::Continuous,
            zsl_depth: 2,
            bundle_cap: 4,
        }
    }
}

/// Consumer of matched sets
pub type ChannelCallback = Arc<dyn Fn(SuperBuf) + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

struct Matcher {
    camera: Handle,
    channel: Handle,
    expected: usize,
    pending: BTreeMap<u64, Vec<SuperBuf>>,
    ring: Option<ZslRing>,
    requested: u32,
}

impl Matcher {
    /// Take one stream's frame; returns whatever is now ready to deliver.
    fn accept(&mut self, part: SuperBuf) -> Vec<SuperBuf> {
        let idx = part.frame_idx();
        let entry = self.pending.entry(idx).or_default();
        let stream = part.bufs().first().map(|b| b.stream);
        if let Some(pos) = entry
            .iter()
            .position(|p| p.bufs().first().map(|b| b.stream) == stream)
        {
            warn!(frame_idx = idx, "Duplicate frame for stream, replacing");
            entry.remove(pos);
        }
        entry.push(part);

        if entry.len() < self.expected {
            while self.pending.len() > MAX_PENDING_SETS {
                if let Some((stale, _)) = self.pending.pop_first() {
                    debug!(frame_idx = stale, "Dropping unmatched frame set");
                }
            }
            return Vec::new();
        }

        let parts = self.pending.remove(&idx).unwrap_or_default();
        // anything older can no longer complete
        let newer = self.pending.split_off(&idx);
        let stale = std::mem::replace(&mut self.pending, newer);
        drop(stale);

        let set = SuperBuf::combine(self.camera, self.channel, parts);
        match self.ring.as_mut() {
            Some(_) if self.requested > 0 => {
                self.requested -= 1;
                vec![set]
            }
            Some(ring) => {
                ring.push(set);
                Vec::new()
            }
            None => vec![set],
        }
    }

    fn request(&mut self, num: u32) -> Vec<SuperBuf> {
        self.requested += num;
        let mut out = Vec::new();
        if let Some(ring) = self.ring.as_mut() {
            while self.requested > 0 {
                let Some(set) = ring.pop() else { break };
                self.requested -= 1;
                out.push(set);
            }
        }
        out
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.requested = 0;
        if let Some(ring) = self.ring.as_mut() {
            let returned = ring.flush();
            let (written, read, overwritten) = ring.stats();
            debug!(returned, written, read, overwritten, "ZSL history flushed");
        }
    }
}

/// Video frames lent to the application until it hands them back
#[derive(Clone, Default)]
pub struct LentFrames(Arc<Mutex<Vec<SuperBuf>>>);

impl LentFrames {
    pub fn hold(&self, frame: SuperBuf) {
        lock(&self.0).push(frame);
    }

    /// Remove the lent set holding buffer `index` of `stream`.
    pub fn take(&self, stream: Handle, index: usize) -> Option<SuperBuf> {
        let mut held = lock(&self.0);
        let pos = held
            .iter()
            .position(|sb| sb.find_stream(stream).is_some_and(|b| b.index == index))?;
        Some(held.remove(pos))
    }

    pub fn release_all(&self) -> usize {
        let frames: Vec<SuperBuf> = lock(&self.0).drain(..).collect();
        let n = frames.len();
        for f in frames {
            if let Err(e) = f.release() {
                warn!("Returning lent frame failed: {}", e);
            }
        }
        n
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Channel {
    camera: Handle,
    handle: Handle,
    kind: ChannelType,
    attr: ChannelAttr,
    ops: Arc<dyn CameraOps>,
    streams: Mutex<Vec<Arc<Stream>>>,
    matcher: Arc<Mutex<Matcher>>,
    data_cb: Option<ChannelCallback>,
    running: AtomicBool,
    lent: LentFrames,
}

impl Channel {
    pub fn new(
        ops: Arc<dyn CameraOps>,
        kind: ChannelType,
        attr: ChannelAttr,
        data_cb: Option<ChannelCallback>,
    ) -> HalResult<Self> {
        let camera = ops.camera_handle();
        let handle = ops.add_channel()?;
        let ring = (attr.notify_mode == NotifyMode::Burst).then(|| ZslRing::new(attr.zsl_depth));
        debug!(handle, ?kind, "Channel added");
        Ok(Self {
            camera,
            handle,
            kind,
            attr,
            ops,
            streams: Mutex::new(Vec::new()),
            matcher: Arc::new(Mutex::new(Matcher {
                camera,
                channel: handle,
                expected: 0,
                pending: BTreeMap::new(),
                ring,
                requested: 0,
            })),
            data_cb,
            running: AtomicBool::new(false),
            lent: LentFrames::default(),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn kind(&self) -> ChannelType {
        self.kind
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn lent_frames(&self) -> LentFrames {
        self.lent.clone()
    }

    fn make_sink(&self) -> FrameSink {
        let matcher = self.matcher.clone();
        let cb = self.data_cb.clone();
        Arc::new(move |part| {
            let ready = lock(&matcher).accept(part);
            deliver(&cb, ready);
        })
    }

    /// Create a stream in this channel. Without `cb` the stream joins the bundle.
    pub fn add_stream(
        &self,
        allocator: &dyn StreamAllocator,
        stream_type: StreamType,
        padding: u32,
        cb: Option<StreamCallback>,
    ) -> HalResult<Arc<Stream>> {
        if self.is_running() {
            return Err(HalError::InvalidOperation(
                "cannot add a stream to a running channel".into(),
            ));
        }
        let count = lock(&self.streams).len();
        if count >= self.attr.bundle_cap {
            error!(count, cap = self.attr.bundle_cap, "Stream number exceeds bundle limit");
            return Err(HalError::BadValue(format!(
                "channel already holds {count} streams"
            )));
        }
        let bundled = cb.is_none();
        let sink = bundled.then(|| self.make_sink());
        let stream = Stream::create(
            self.camera,
            self.handle,
            self.ops.clone(),
            allocator,
            stream_type,
            padding,
            cb,
            sink,
        )?;
        if bundled {
            lock(&self.matcher).expected += 1;
        }
        lock(&self.streams).push(stream.clone());
        Ok(stream)
    }

    pub fn streams(&self) -> Vec<Arc<Stream>> {
        lock(&self.streams).clone()
    }

    pub fn stream_by_handle(&self, handle: Handle) -> Option<Arc<Stream>> {
        lock(&self.streams)
            .iter()
            .find(|s| s.handle() == handle)
            .cloned()
    }

    pub fn stream_by_type(&self, ty: StreamType) -> Option<Arc<Stream>> {
        lock(&self.streams)
            .iter()
            .find(|s| s.is_type_of(ty))
            .cloned()
    }

    /// Start every stream and then the driver channel; unwinds on failure.
    #[instrument(skip(self), fields(channel = self.handle, kind = ?self.kind))]
    pub fn start(&self) -> HalResult<()> {
        if self.is_running() {
            return Ok(());
        }
        let streams = self.streams();
        for (i, s) in streams.iter().enumerate() {
            if let Err(e) = s.start() {
                error!(stream = s.handle(), "Stream start failed: {}", e);
                streams[..i].iter().for_each(|s| s.stop());
                return Err(e);
            }
        }
        if let Err(e) = self.ops.start_channel(self.handle) {
            error!("Driver channel start failed: {}", e);
            streams.iter().for_each(|s| s.stop());
            return Err(e);
        }
        self.running.store(true, Ordering::SeqCst);
        info!(streams = streams.len(), "Channel started");
        Ok(())
    }

    /// Stop the driver side, then every stream. Retained and lent frames are returned.
    #[instrument(skip(self), fields(channel = self.handle, kind = ?self.kind))]
    pub fn stop(&self) -> HalResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.ops.stop_channel(self.handle);
        if let Err(e) = &result {
            error!("Driver channel stop failed: {}", e);
        }
        for s in self.streams() {
            s.stop();
        }
        lock(&self.matcher).flush();
        let lent = self.lent.release_all();
        if lent > 0 {
            debug!(lent, "Returned lent frames");
        }
        info!("Channel stopped");
        result
    }

    /// Return a matched set to the driver as one unit.
    pub fn buf_done(&self, frame: SuperBuf) -> HalResult<()> {
        frame.release()
    }

    /// Deliver `num` retained sets, oldest first; later matches fill the rest.
    pub fn take_picture(&self, num: u32) -> HalResult<()> {
        if self.attr.notify_mode != NotifyMode::Burst {
            return Err(HalError::InvalidOperation(format!(
                "{:?} channel does not retain frames",
                self.kind
            )));
        }
        let ready = lock(&self.matcher).request(num);
        deliver(&self.data_cb, ready);
        Ok(())
    }

    pub fn cancel_picture(&self) -> HalResult<()> {
        lock(&self.matcher).requested = 0;
        Ok(())
    }

    /// Give a lent video buffer back, identified by its frame or metadata block.
    pub fn release_frame(&self, block: &BufferBlock, metadata: bool) -> HalResult<()> {
        for s in self.streams() {
            let index = s.with_memory(|m| m.match_buf_index(block, metadata));
            if let Some(index) = index {
                return match self.lent.take(s.handle(), index) {
                    Some(frame) => frame.release(),
                    None => {
                        debug!(index, "Frame already returned");
                        Ok(())
                    }
                };
            }
        }
        Err(HalError::NotFound("frame does not belong to this channel".into()))
    }

    /// Send the main image of `frame` through the reprocess stream.
    pub fn do_reprocess(&self, frame: &SuperBuf) -> HalResult<()> {
        if !self.is_running() {
            return Err(HalError::InvalidOperation("reprocess channel not started".into()));
        }
        let stream = self
            .stream_by_type(StreamType::Reprocess)
            .ok_or_else(|| HalError::NotFound("no reprocess stream".into()))?;
        let input = frame
            .find(StreamType::Snapshot)
            .or_else(|| frame.bufs().first())
            .ok_or_else(|| HalError::InvalidArgument("empty frame".into()))?;
        self.ops.do_reprocess(self.handle, stream.handle(), input)
    }
}

fn deliver(cb: &Option<ChannelCallback>, ready: Vec<SuperBuf>) {
    for set in ready {
        match cb {
            Some(cb) => cb(set),
            None => drop(set),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(channel = self.handle, "Stop on delete failed: {}", e);
        }
        for s in lock(&self.streams).drain(..) {
            s.release();
        }
        if let Err(e) = self.ops.delete_channel(self.handle) {
            warn!(channel = self.handle, "delete_channel failed: {}", e);
        }
        debug!(channel = self.handle, kind = ?self.kind, "Channel deleted");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capture::frame::{Dimension, PixelFormat};
    use crate::channel::stream::StreamInfo;
    use crate::driver::sim::default_capabilities;
    use crate::driver::{Fault, SimDriver, StreamingMode};
    use crate::mem::{CameraMemory, StreamMemory};

    struct TestAllocator;

    impl StreamAllocator for TestAllocator {
        fn stream_info(&self, stream_type: StreamType) -> HalResult<StreamInfo> {
            Ok(StreamInfo {
                stream_type,
                dim: Dimension::new(64, 48),
                format: PixelFormat::Nv21,
                mode: StreamingMode::Continuous,
                buf_count: 4,
            })
        }

        fn allocate_stream_buf(
            &self,
            info: &StreamInfo,
            size: usize,
        ) -> HalResult<Box<dyn CameraMemory>> {
            let mut mem = StreamMemory::default();
            mem.allocate(info.buf_count, size)?;
            Ok(Box::new(mem))
        }
    }

    fn driver() -> Arc<SimDriver> {
        SimDriver::new(0, default_capabilities(0), 200)
    }

    #[test]
    fn bundled_streams_arrive_matched() {
        let d = driver();
        let (tx, rx) = flume::unbounded();
        let ch = Channel::new(
            d.clone(),
            ChannelType::Capture,
            ChannelAttr::default(),
            Some(Arc::new(move |sb| {
                let _ = tx.send(sb);
            })),
        )
        .unwrap();
        ch.add_stream(&TestAllocator, StreamType::Snapshot, 32, None).unwrap();
        ch.add_stream(&TestAllocator, StreamType::Postview, 32, None).unwrap();
        ch.start().unwrap();
        let set = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(set.num_bufs(), 2);
        assert!(set.find(StreamType::Snapshot).is_some());
        assert!(set.find(StreamType::Postview).is_some());
        ch.buf_done(set).unwrap();
        ch.stop().unwrap();
        rx.drain().for_each(drop);
        assert_eq!(d.outstanding(), 0);
        assert_eq!(d.double_returns(), 0);
    }

    #[test]
    fn per_stream_callback_bypasses_matcher() {
        let d = driver();
        let (tx, rx) = flume::unbounded();
        let ch = Channel::new(d.clone(), ChannelType::Preview, ChannelAttr::default(), None).unwrap();
        let cb: StreamCallback = Arc::new(move |sb, stream| {
            let _ = tx.send((sb.frame_idx(), stream.stream_type()));
        });
        ch.add_stream(&TestAllocator, StreamType::Preview, 32, Some(cb)).unwrap();
        ch.start().unwrap();
        let (_, ty) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(ty, StreamType::Preview);
        ch.stop().unwrap();
        // no callback fires once stop has returned
        let _ = rx.drain().count();
        assert!(rx.recv_timeout(Duration::from_millis(30)).is_err());
        assert_eq!(d.outstanding(), 0);
    }

    #[test]
    fn failed_start_stops_streams() {
        let d = driver();
        let ch = Channel::new(d.clone(), ChannelType::Preview, ChannelAttr::default(), None).unwrap();
        let s = ch.add_stream(&TestAllocator, StreamType::Preview, 32, None).unwrap();
        d.inject(Fault::StartChannel);
        assert!(ch.start().is_err());
        assert!(!s.is_active());
        assert!(!ch.is_running());
    }

    #[test]
    fn bundle_cap_is_enforced() {
        let d = driver();
        let attr = ChannelAttr {
            bundle_cap: 1,
            ..Default::default()
        };
        let ch = Channel::new(d, ChannelType::Raw, attr, None).unwrap();
        ch.add_stream(&TestAllocator, StreamType::Raw, 32, None).unwrap();
        assert!(matches!(
            ch.add_stream(&TestAllocator, StreamType::Raw, 32, None),
            Err(HalError::BadValue(_))
        ));
    }

    #[test]
    fn zsl_ring_serves_take_picture() {
        let d = driver();
        let (tx, rx) = flume::unbounded();
        let attr = ChannelAttr {
            notify_mode: NotifyMode::Burst,
            zsl_depth: 2,
            bundle_cap: 4,
        };
        let ch = Channel::new(
            d.clone(),
            ChannelType::Zsl,
            attr,
            Some(Arc::new(move |sb| {
                let _ = tx.send(sb);
            })),
        )
        .unwrap();
        ch.add_stream(&TestAllocator, StreamType::Snapshot, 32, None).unwrap();
        ch.start().unwrap();
        // nothing is delivered until asked for
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        ch.take_picture(1).unwrap();
        let set = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(set.num_bufs(), 1);
        drop(set);
        ch.stop().unwrap();
        assert_eq!(d.outstanding(), 0);
    }

    #[test]
    fn lent_frames_return_on_release_or_stop() {
        let d = driver();
        let ch = Channel::new(d.clone(), ChannelType::Video, ChannelAttr::default(), None).unwrap();
        let lent = ch.lent_frames();
        let (tx, rx) = flume::unbounded();
        let held = lent.clone();
        let cb: StreamCallback = Arc::new(move |sb, _stream| {
            let block = sb.bufs()[0].block.clone();
            held.hold(sb);
            let _ = tx.send(block);
        });
        ch.add_stream(&TestAllocator, StreamType::Video, 32, Some(cb)).unwrap();
        ch.start().unwrap();
        let block = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        ch.release_frame(&block, false).unwrap();
        ch.stop().unwrap();
        assert!(lent.is_empty());
        assert_eq!(d.outstanding(), 0);
    }
}
