//! State shared by a camera's control, its stream callbacks and its post-processor.
//!
//! Callbacks hold a [`Weak`] to the hub so channels owned by the hub never
//! keep it alive. Nothing here talks to the state machine except through the
//! event-only [`EventSender`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use bytes::{BufMut, Bytes, BytesMut};
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use super::parameters::Parameters;
use crate::callbacks::{CameraCallbacks, FrameFaces, MsgType};
use crate::capture::frame::{Handle, MetadataRecord, StreamType, SuperBuf};
use crate::channel::{Channel, ChannelCallback, ChannelType, LentFrames, Stream, StreamCallback};
use crate::driver::{CameraEvent, CameraOps, Capabilities, EventCallback};
use crate::error::{HalError, HalResult};
use crate::postproc::{EncodeSettings, JpegEngine, JpegEvent, PostProcHost, PostProcessor, StreamShape};
use crate::state_machine::{EventSender, HalEvent};
use crate::HalConfig;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Progress of the capture in flight
#[derive(Debug, Default)]
struct CaptureProgress {
    expected: u32,
    finished: u32,
    shutter_sent: bool,
}

pub(crate) struct Hub {
    pub(crate) ops: Arc<dyn CameraOps>,
    pub(crate) caps: Capabilities,
    pub(crate) config: HalConfig,
    pub(crate) postproc: PostProcessor,
    callbacks: RwLock<Option<Arc<dyn CameraCallbacks>>>,
    msg_types: AtomicU32,
    events: OnceCell<EventSender>,
    channels: Mutex<BTreeMap<ChannelType, Arc<Channel>>>,
    settings: Mutex<EncodeSettings>,
    capture: Mutex<CaptureProgress>,
    face_detection: AtomicBool,
    histogram: AtomicBool,
    // one histogram goes out per HistogramSendData
    histogram_send: AtomicBool,
}

impl Hub {
    pub(crate) fn new(
        ops: Arc<dyn CameraOps>,
        caps: Capabilities,
        config: HalConfig,
        engine: Arc<dyn JpegEngine>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            let host: Arc<dyn PostProcHost> = Arc::new(PpHost(me.clone()));
            Self {
                ops,
                caps,
                config,
                postproc: PostProcessor::new(host, engine),
                callbacks: RwLock::new(None),
                msg_types: AtomicU32::new(0),
                events: OnceCell::new(),
                channels: Mutex::new(BTreeMap::new()),
                settings: Mutex::new(EncodeSettings::default()),
                capture: Mutex::new(CaptureProgress::default()),
                face_detection: AtomicBool::new(false),
                histogram: AtomicBool::new(false),
                histogram_send: AtomicBool::new(false),
            }
        })
    }

    /// Wire the hub to its state machine. Only the first call has an effect.
    pub(crate) fn attach(&self, events: EventSender) {
        if self.events.set(events).is_err() {
            warn!("Event sender already attached");
        }
    }

    pub(crate) fn submit_event(&self, event: HalEvent) {
        match self.events.get() {
            Some(tx) => {
                if let Err(e) = tx.submit_event(event) {
                    debug!("Event dropped: {}", e);
                }
            }
            None => debug!(?event, "No state machine attached, event dropped"),
        }
    }

    pub(crate) fn set_callbacks(&self, cbs: Option<Arc<dyn CameraCallbacks>>) {
        *self.callbacks.write().unwrap_or_else(|p| p.into_inner()) = cbs;
    }

    fn callbacks(&self) -> Option<Arc<dyn CameraCallbacks>> {
        self.callbacks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub(crate) fn enable_msg_type(&self, msg: MsgType) {
        self.msg_types.fetch_or(msg.0, Ordering::SeqCst);
    }

    pub(crate) fn disable_msg_type(&self, msg: MsgType) {
        self.msg_types.fetch_and(!msg.0, Ordering::SeqCst);
    }

    pub(crate) fn msg_type_enabled(&self, msg: MsgType) -> bool {
        MsgType(self.msg_types.load(Ordering::SeqCst)).intersects(msg)
    }

    /// Enabled callback for `msg`, if any
    fn callback_for(&self, msg: MsgType) -> Option<Arc<dyn CameraCallbacks>> {
        self.callbacks().filter(|_| self.msg_type_enabled(msg))
    }

    pub(crate) fn notify(&self, msg: MsgType, ext1: i32, ext2: i32) {
        if let Some(cb) = self.callback_for(msg) {
            cb.notify(msg, ext1, ext2);
        }
    }

    /// Data callback; finished images also count toward the capture in flight.
    pub(crate) fn send_data(&self, msg: MsgType, data: Bytes, index: u32, metadata: Option<&FrameFaces>) {
        match self.callback_for(msg) {
            Some(cb) => cb.data(msg, data, index, metadata),
            None if msg == MsgType::RAW_IMAGE => self.notify(MsgType::RAW_IMAGE_NOTIFY, 0, 0),
            None => {}
        }
        if msg == MsgType::COMPRESSED_IMAGE || msg == MsgType::RAW_IMAGE {
            self.image_finished();
        }
    }

    /// Notify callback; an error during a capture finishes one image.
    pub(crate) fn send_notify(&self, msg: MsgType, ext1: i32, ext2: i32) {
        self.notify(msg, ext1, ext2);
        if msg == MsgType::ERROR {
            self.image_finished();
        }
    }

    pub(crate) fn begin_capture(&self, expected: u32) {
        *lock(&self.capture) = CaptureProgress {
            expected,
            ..Default::default()
        };
    }

    pub(crate) fn end_capture(&self) {
        *lock(&self.capture) = CaptureProgress::default();
    }

    /// True for the first frame of a capture
    fn mark_shutter(&self) -> bool {
        let mut c = lock(&self.capture);
        let first = c.expected > 0 && !c.shutter_sent;
        c.shutter_sent |= first;
        first
    }

    fn image_finished(&self) {
        let done = {
            let mut c = lock(&self.capture);
            if c.expected == 0 {
                return;
            }
            c.finished += 1;
            let done = c.finished >= c.expected;
            if done {
                *c = CaptureProgress::default();
            }
            done
        };
        if done {
            info!("All images of the capture delivered");
            self.submit_event(HalEvent::SnapshotDone);
        }
    }

    pub(crate) fn channel(&self, kind: ChannelType) -> Option<Arc<Channel>> {
        lock(&self.channels).get(&kind).cloned()
    }

    pub(crate) fn has_channel(&self, kind: ChannelType) -> bool {
        lock(&self.channels).contains_key(&kind)
    }

    pub(crate) fn insert_channel(&self, channel: Channel) -> Arc<Channel> {
        let channel = Arc::new(channel);
        let old = lock(&self.channels).insert(channel.kind(), channel.clone());
        // stream workers take the map lock, so the old channel stops outside it
        if let Some(old) = old {
            warn!(kind = ?old.kind(), "Replaced a live channel");
            if let Err(e) = old.stop() {
                warn!("Replaced channel stop failed: {}", e);
            }
        }
        channel
    }

    /// Stop and delete the channel of `kind`, outside the map lock.
    pub(crate) fn delete_channel(&self, kind: ChannelType) {
        let Some(channel) = lock(&self.channels).remove(&kind) else {
            return;
        };
        if let Err(e) = channel.stop() {
            warn!(?kind, "Channel stop failed: {}", e);
        }
        drop(channel);
    }

    pub(crate) fn delete_all_channels(&self) {
        let all = std::mem::take(&mut *lock(&self.channels));
        for (kind, channel) in all {
            if let Err(e) = channel.stop() {
                warn!(?kind, "Channel stop failed: {}", e);
            }
        }
    }

    fn stream_shape(&self, handle: Handle) -> Option<StreamShape> {
        let channels: Vec<Arc<Channel>> = lock(&self.channels).values().cloned().collect();
        channels.iter().find_map(|c| c.stream_by_handle(handle)).map(|s| StreamShape {
            dim: s.dim(),
            format: s.format(),
            layout: s.frame_offset().clone(),
        })
    }

    pub(crate) fn update_settings(&self, params: &Parameters) {
        *lock(&self.settings) = EncodeSettings {
            quality: params.jpeg_quality(),
            thumbnail_quality: params.thumbnail_quality(),
            rotation: params.rotation(),
        };
    }

    pub(crate) fn set_face_detection(&self, on: bool) -> HalResult<()> {
        self.set_driver_flag("face-detection", on)?;
        self.face_detection.store(on, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn set_histogram(&self, on: bool) -> HalResult<()> {
        self.set_driver_flag("histogram", on)?;
        self.histogram.store(on, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn request_histogram(&self) -> HalResult<()> {
        if !self.histogram.load(Ordering::SeqCst) {
            return Err(HalError::InvalidOperation("histogram is off".into()));
        }
        self.histogram_send.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_driver_flag(&self, key: &str, on: bool) -> HalResult<()> {
        let value = if on { "on" } else { "off" };
        self.ops
            .set_parms(&BTreeMap::from([(key.to_string(), value.to_string())]))
    }

    pub(crate) fn dump(&self) -> String {
        let channels: Vec<String> = lock(&self.channels)
            .values()
            .map(|c| {
                format!(
                    "{:?}#{:x}(streams={}, running={}, lent={})",
                    c.kind(),
                    c.handle(),
                    c.streams().len(),
                    c.is_running(),
                    c.lent_frames().len()
                )
            })
            .collect();
        let [input_pp, ongoing_pp, input_jpeg, ongoing_jpeg] = self.postproc.queue_depths();
        let capture = lock(&self.capture);
        format!(
            "camera {}: msg_types={:#x} channels=[{}] postproc(active={}, input_pp={input_pp}, \
             ongoing_pp={ongoing_pp}, input_jpeg={input_jpeg}, ongoing_jpeg={ongoing_jpeg}) \
             capture={}/{} faces={} histogram={}",
            self.caps.camera_id,
            self.msg_types.load(Ordering::SeqCst),
            channels.join(", "),
            self.postproc.is_active(),
            capture.finished,
            capture.expected,
            self.face_detection.load(Ordering::SeqCst),
            self.histogram.load(Ordering::SeqCst),
        )
    }

    pub(crate) fn driver_events(self: &Arc<Self>) -> EventCallback {
        let me = Arc::downgrade(self);
        Arc::new(move |event| {
            let Some(hub) = me.upgrade() else { return };
            match event {
                CameraEvent::AutoFocusDone { focused } => {
                    hub.submit_event(HalEvent::FocusUpdate { focused })
                }
                CameraEvent::ZoomDone { zoom } => hub.submit_event(HalEvent::ZoomDone { zoom }),
                CameraEvent::MapDone | CameraEvent::UnmapDone => debug!(?event, "Buffer mapping"),
            }
        })
    }

    pub(crate) fn preview_callback(self: &Arc<Self>, display: bool) -> StreamCallback {
        let me = Arc::downgrade(self);
        Arc::new(move |frame, stream| match me.upgrade() {
            Some(hub) => hub.on_preview_frame(frame, stream, display),
            None => drop(frame),
        })
    }

    pub(crate) fn metadata_callback(self: &Arc<Self>) -> StreamCallback {
        let me = Arc::downgrade(self);
        Arc::new(move |frame, _stream| match me.upgrade() {
            Some(hub) => hub.on_metadata(frame),
            None => drop(frame),
        })
    }

    pub(crate) fn video_callback(self: &Arc<Self>, lent: LentFrames, store_metadata: bool) -> StreamCallback {
        let me = Arc::downgrade(self);
        Arc::new(move |frame, stream| match me.upgrade() {
            Some(hub) => hub.on_video_frame(frame, stream, &lent, store_metadata),
            None => drop(frame),
        })
    }

    pub(crate) fn reprocess_callback(self: &Arc<Self>) -> StreamCallback {
        let me = Arc::downgrade(self);
        Arc::new(move |frame, _stream| {
            let Some(hub) = me.upgrade() else { return };
            if let Err(e) = hub.postproc.process_pp_data(frame) {
                warn!("Reprocessed frame dropped: {}", e);
            }
        })
    }

    /// Matched snapshot sets: ZSL, capture, snapshot and raw channels.
    pub(crate) fn capture_callback(self: &Arc<Self>) -> ChannelCallback {
        let me = Arc::downgrade(self);
        Arc::new(move |frame| match me.upgrade() {
            Some(hub) => hub.on_capture_frame(frame),
            None => drop(frame),
        })
    }

    fn on_preview_frame(&self, frame: SuperBuf, stream: &Stream, display: bool) {
        let Some(buf) = frame.bufs().first() else {
            return;
        };
        let (index, timestamp) = (buf.index, buf.timestamp);
        if let Some(cb) = self.callback_for(MsgType::PREVIEW_FRAME) {
            cb.data(MsgType::PREVIEW_FRAME, buf.data(), index as u32, None);
        }
        if !display {
            drop(frame);
            return;
        }
        // the window owns the buffer until it gives one back
        frame.detach();
        if let Err(e) = stream.display_buffer(index, timestamp) {
            warn!(index, "Display failed, returning buffer: {}", e);
            if let Err(e) = stream.buf_done(index) {
                warn!(index, "Return after display failure failed: {}", e);
            }
        }
    }

    fn on_metadata(&self, frame: SuperBuf) {
        let record = match frame.bufs().first().map(|b| MetadataRecord::decode(&b.data())) {
            Some(Ok(r)) => r,
            Some(Err(e)) => {
                debug!("Undecodable metadata: {}", e);
                return;
            }
            None => return,
        };
        drop(frame);

        if self.face_detection.load(Ordering::SeqCst) {
            if let Some(cb) = self.callback_for(MsgType::PREVIEW_METADATA) {
                let faces = FrameFaces {
                    faces: record.faces,
                };
                cb.data(MsgType::PREVIEW_METADATA, Bytes::new(), 0, Some(&faces));
            }
        }
        if !record.histogram.is_empty() && self.histogram_send.swap(false, Ordering::SeqCst) {
            if let Some(cb) = self.callback_for(MsgType::HISTOGRAM) {
                let mut bins = BytesMut::with_capacity(record.histogram.len() * 4);
                record.histogram.iter().for_each(|b| bins.put_u32_le(*b));
                cb.data(MsgType::HISTOGRAM, bins.freeze(), 0, None);
            }
        }
    }

    fn on_video_frame(&self, frame: SuperBuf, stream: &Stream, lent: &LentFrames, store_metadata: bool) {
        let Some(cb) = self.callback_for(MsgType::VIDEO_FRAME) else {
            drop(frame);
            return;
        };
        let Some(buf) = frame.bufs().first() else {
            return;
        };
        let (index, timestamp) = (buf.index, buf.timestamp);
        let handed = if store_metadata {
            stream.with_memory(|m| m.metadata(index))
        } else {
            Some(buf.block.clone())
        };
        let Some(handed) = handed else {
            warn!(index, "Video buffer has no metadata handle");
            return;
        };
        lent.hold(frame);
        cb.data_timestamp(timestamp, MsgType::VIDEO_FRAME, &handed, index as u32);
    }

    fn on_capture_frame(&self, frame: SuperBuf) {
        if self.mark_shutter() {
            self.notify(MsgType::SHUTTER, 0, 0);
        }
        if let Some(pv) = frame.find(StreamType::Postview) {
            if let Some(cb) = self.callback_for(MsgType::POSTVIEW_FRAME) {
                cb.data(MsgType::POSTVIEW_FRAME, pv.data(), pv.index as u32, None);
            }
        }
        if let Err(e) = self.postproc.process_data(frame) {
            warn!("Captured frame dropped: {}", e);
            self.image_finished();
        }
    }
}

/// The post-processor's view of its camera
struct PpHost(Weak<Hub>);

impl PpHost {
    fn hub(&self) -> HalResult<Arc<Hub>> {
        self.0.upgrade().ok_or(HalError::Shutdown)
    }
}

impl PostProcHost for PpHost {
    fn need_reprocess(&self) -> bool {
        self.0
            .upgrade()
            .is_some_and(|h| h.has_channel(ChannelType::Reprocess))
    }

    fn reprocess(&self, frame: &SuperBuf) -> HalResult<()> {
        self.hub()?
            .channel(ChannelType::Reprocess)
            .ok_or_else(|| HalError::NotFound("reprocess channel".into()))?
            .do_reprocess(frame)
    }

    fn encode_settings(&self) -> EncodeSettings {
        self.0
            .upgrade()
            .map(|h| *lock(&h.settings))
            .unwrap_or_default()
    }

    fn stream_shape(&self, stream: Handle) -> Option<StreamShape> {
        self.0.upgrade()?.stream_shape(stream)
    }

    fn jpeg_done(&self, evt: JpegEvent) {
        if let Some(hub) = self.0.upgrade() {
            hub.submit_event(HalEvent::JpegNotify(evt));
        }
    }

    fn send_data(&self, msg: MsgType, data: Bytes, index: u32, metadata: Option<&FrameFaces>) {
        if let Some(hub) = self.0.upgrade() {
            hub.send_data(msg, data, index, metadata);
        }
    }

    fn send_notify(&self, msg: MsgType, ext1: i32, ext2: i32) {
        if let Some(hub) = self.0.upgrade() {
            hub.send_notify(msg, ext1, ext2);
        }
    }
}
