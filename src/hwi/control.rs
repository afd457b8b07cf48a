//! Channel and parameter work behind the state machine.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::hub::Hub;
use super::parameters::{Parameters, PictureFormat};
use super::streams::StreamPlan;
use crate::callbacks::{CameraCallbacks, MsgType};
use crate::capture::frame::StreamType;
use crate::channel::{Channel, ChannelAttr, ChannelCallback, ChannelType, NotifyMode, StreamCallback};
use crate::display::PreviewWindow;
use crate::error::{HalError, HalResult};
use crate::mem::BufferBlock;
use crate::postproc::JpegEvent;
use crate::state_machine::{CameraCommand, CameraControl};

/// Channels that exist only while preview runs
const PREVIEW_CHANNELS: [ChannelType; 4] = [
    ChannelType::Preview,
    ChannelType::Zsl,
    ChannelType::Metadata,
    ChannelType::Video,
];

/// Channels of a still capture
const CAPTURE_CHANNELS: [ChannelType; 4] = [
    ChannelType::Capture,
    ChannelType::Snapshot,
    ChannelType::Raw,
    ChannelType::Reprocess,
];

pub(crate) struct HwiControl {
    hub: Arc<Hub>,
    params: Parameters,
    staged: Option<Parameters>,
    window: Option<Arc<dyn PreviewWindow>>,
    /// Display mode of the last prepared preview
    display: bool,
    store_metadata: bool,
}

impl HwiControl {
    pub(crate) fn new(hub: Arc<Hub>, params: Parameters) -> Self {
        hub.update_settings(&params);
        Self {
            hub,
            params,
            staged: None,
            window: None,
            display: false,
            store_metadata: false,
        }
    }

    fn attr(&self, notify_mode: NotifyMode) -> ChannelAttr {
        let cam = &self.hub.config.camera;
        ChannelAttr {
            notify_mode,
            zsl_depth: cam.zsl_depth,
            bundle_cap: cam.bundle_cap,
        }
    }

    fn plan(&self) -> StreamPlan<'_> {
        StreamPlan::new(&self.params, &self.hub.config.camera)
    }

    fn new_channel(
        &self,
        kind: ChannelType,
        notify_mode: NotifyMode,
        cb: Option<ChannelCallback>,
    ) -> HalResult<Channel> {
        Channel::new(self.hub.ops.clone(), kind, self.attr(notify_mode), cb)
    }

    /// Add `streams` to a new channel of `kind` and put it in the map.
    fn build_channel(
        &self,
        kind: ChannelType,
        notify_mode: NotifyMode,
        cb: Option<ChannelCallback>,
        plan: &StreamPlan<'_>,
        streams: Vec<(StreamType, Option<StreamCallback>)>,
    ) -> HalResult<Arc<Channel>> {
        let channel = self.new_channel(kind, notify_mode, cb)?;
        let padding = self.hub.caps.padding;
        for (stream_type, cb) in streams {
            // a failed add drops the channel, which releases what was added
            channel.add_stream(plan, stream_type, padding, cb)?;
        }
        Ok(self.hub.insert_channel(channel))
    }

    fn preview_window(&self) -> Option<Arc<dyn PreviewWindow>> {
        if self.display {
            self.window.clone()
        } else {
            None
        }
    }

    fn build_preview_channels(&self) -> HalResult<()> {
        let plan = self.plan().with_window(self.preview_window());
        let preview_cb = self.hub.preview_callback(plan.window.is_some());

        if self.params.zsl_enabled() {
            let plan = plan.zsl();
            self.build_channel(
                ChannelType::Zsl,
                NotifyMode::Burst,
                Some(self.hub.capture_callback()),
                &plan,
                vec![
                    (StreamType::Preview, Some(preview_cb)),
                    (StreamType::Snapshot, None),
                ],
            )?;
            self.build_channel(
                ChannelType::Metadata,
                NotifyMode::Continuous,
                None,
                &plan,
                vec![(StreamType::Metadata, Some(self.hub.metadata_callback()))],
            )?;
        } else {
            self.build_channel(
                ChannelType::Preview,
                NotifyMode::Continuous,
                None,
                &plan,
                vec![
                    (StreamType::Metadata, Some(self.hub.metadata_callback())),
                    (StreamType::Preview, Some(preview_cb)),
                ],
            )?;
        }
        if self.params.recording_hint() {
            self.build_video_channel()?;
        }
        Ok(())
    }

    fn build_video_channel(&self) -> HalResult<Arc<Channel>> {
        if let Some(video) = self.hub.channel(ChannelType::Video) {
            return Ok(video);
        }
        let channel = self.new_channel(ChannelType::Video, NotifyMode::Continuous, None)?;
        let plan = self.plan().store_metadata(self.store_metadata);
        let cb = self.hub.video_callback(channel.lent_frames(), self.store_metadata);
        channel.add_stream(&plan, StreamType::Video, self.hub.caps.padding, Some(cb))?;
        Ok(self.hub.insert_channel(channel))
    }

    fn delete_channels(&self, kinds: &[ChannelType]) {
        for kind in kinds {
            self.hub.delete_channel(*kind);
        }
    }

    /// Reprocess channel in front of the encoder, when configured.
    fn start_reprocess_channel(&self) -> HalResult<()> {
        if !self.hub.config.postproc.reprocess || self.hub.has_channel(ChannelType::Reprocess) {
            return Ok(());
        }
        let plan = self.plan();
        let channel = self.build_channel(
            ChannelType::Reprocess,
            NotifyMode::Continuous,
            None,
            &plan,
            vec![(StreamType::Reprocess, Some(self.hub.reprocess_callback()))],
        )?;
        channel.start()
    }

    fn start_capture_channel(&self, num: u32) -> HalResult<()> {
        let plan = self.plan().burst(num);
        let cb = Some(self.hub.capture_callback());
        let channel = match self.params.picture_format() {
            PictureFormat::Raw => {
                self.build_channel(ChannelType::Raw, NotifyMode::Continuous, cb, &plan, vec![(StreamType::Raw, None)])?
            }
            PictureFormat::Jpeg if self.params.thumbnail_size().is_some() => self.build_channel(
                ChannelType::Capture,
                NotifyMode::Continuous,
                cb,
                &plan,
                vec![(StreamType::Snapshot, None), (StreamType::Postview, None)],
            )?,
            PictureFormat::Jpeg => self.build_channel(
                ChannelType::Snapshot,
                NotifyMode::Continuous,
                cb,
                &plan,
                vec![(StreamType::Snapshot, None)],
            )?,
        };
        channel.start()
    }

    fn capture(&mut self) -> HalResult<()> {
        let num = self.params.num_snapshots();
        self.hub.postproc.start()?;
        self.hub.begin_capture(num);
        self.start_reprocess_channel()?;

        if self.params.zsl_enabled() {
            let zsl = self
                .hub
                .channel(ChannelType::Zsl)
                .ok_or_else(|| HalError::InvalidOperation("ZSL channel not running".into()))?;
            info!(num, "ZSL capture");
            return zsl.take_picture(num);
        }

        // the sensor switches from preview to capture
        self.stop_preview()?;
        info!(num, format = ?self.params.picture_format(), "Still capture");
        self.start_capture_channel(num)
    }
}

impl CameraControl for HwiControl {
    fn set_preview_window(&mut self, window: Option<Arc<dyn PreviewWindow>>) -> HalResult<()> {
        self.window = window;
        Ok(())
    }

    fn has_preview_window(&self) -> bool {
        self.window.is_some()
    }

    fn set_callbacks(&mut self, callbacks: Option<Arc<dyn CameraCallbacks>>) -> HalResult<()> {
        self.hub.set_callbacks(callbacks);
        Ok(())
    }

    fn enable_msg_type(&mut self, msg: MsgType) -> HalResult<()> {
        self.hub.enable_msg_type(msg);
        Ok(())
    }

    fn disable_msg_type(&mut self, msg: MsgType) -> HalResult<()> {
        self.hub.disable_msg_type(msg);
        Ok(())
    }

    fn msg_type_enabled(&self, msg: MsgType) -> bool {
        self.hub.msg_type_enabled(msg)
    }

    fn update_parameters(&mut self, params: &str) -> HalResult<bool> {
        let update = Parameters::unflatten(params)?;
        let (merged, restart) = self.params.merge(&update, &self.hub.caps)?;
        debug!(restart, "Parameters staged");
        self.staged = Some(merged);
        Ok(restart)
    }

    fn commit_parameters(&mut self) -> HalResult<()> {
        let Some(staged) = self.staged.take() else {
            return Ok(());
        };
        let changed = staged.diff(&self.params);
        if changed.is_empty() {
            return Ok(());
        }
        self.hub.ops.set_parms(&changed)?;
        info!(keys = ?changed.keys().collect::<Vec<_>>(), "Parameters committed");
        self.params = staged;
        self.hub.update_settings(&self.params);
        Ok(())
    }

    fn discard_parameters(&mut self) {
        self.staged = None;
    }

    fn get_parameters(&self) -> String {
        self.params.flatten()
    }

    #[instrument(skip(self))]
    fn prepare_preview(&mut self, with_display: bool) -> HalResult<()> {
        if with_display && self.window.is_none() {
            return Err(HalError::InvalidOperation("no preview window".into()));
        }
        self.display = with_display;
        if PREVIEW_CHANNELS[..3].iter().any(|k| self.hub.has_channel(*k)) {
            return Ok(());
        }
        if let Err(e) = self.build_preview_channels() {
            self.unprepare_preview();
            return Err(e);
        }
        Ok(())
    }

    fn unprepare_preview(&mut self) {
        self.delete_channels(&PREVIEW_CHANNELS);
    }

    /// Start the preview channels, building them again after a stop.
    #[instrument(skip(self))]
    fn start_preview(&mut self) -> HalResult<()> {
        if !PREVIEW_CHANNELS[..3].iter().any(|k| self.hub.has_channel(*k)) {
            self.display = self.display && self.window.is_some();
            self.build_preview_channels()?;
        }
        if self.params.zsl_enabled() {
            self.hub.postproc.start()?;
        }
        let mut started = Vec::new();
        for kind in [ChannelType::Metadata, ChannelType::Zsl, ChannelType::Preview] {
            let Some(channel) = self.hub.channel(kind) else {
                continue;
            };
            if let Err(e) = channel.start() {
                started.iter().for_each(|c: &Arc<Channel>| {
                    if let Err(e) = c.stop() {
                        warn!(kind = ?c.kind(), "Stop after failed preview start failed: {}", e);
                    }
                });
                return Err(e);
            }
            started.push(channel);
        }
        info!(display = self.display, zsl = self.params.zsl_enabled(), "Preview started");
        Ok(())
    }

    #[instrument(skip(self))]
    fn stop_preview(&mut self) -> HalResult<()> {
        if self.params.zsl_enabled() {
            self.hub.postproc.stop();
        }
        self.delete_channels(&PREVIEW_CHANNELS);
        info!("Preview stopped");
        Ok(())
    }

    fn drop_preview_channels(&mut self) -> HalResult<()> {
        self.delete_channels(&PREVIEW_CHANNELS);
        Ok(())
    }

    fn store_metadata_in_buffers(&mut self, enable: bool) -> HalResult<()> {
        if self.store_metadata == enable {
            return Ok(());
        }
        match self.hub.channel(ChannelType::Video) {
            Some(video) if video.is_running() => {
                return Err(HalError::InvalidOperation(
                    "metadata mode cannot change while recording".into(),
                ));
            }
            // a prepared video channel is rebuilt with the new pool on start
            Some(_) => self.hub.delete_channel(ChannelType::Video),
            None => {}
        }
        self.store_metadata = enable;
        Ok(())
    }

    #[instrument(skip(self))]
    fn start_recording(&mut self) -> HalResult<()> {
        let video = self.build_video_channel()?;
        if let Err(e) = video.start() {
            self.hub.delete_channel(ChannelType::Video);
            return Err(e);
        }
        info!(size = %self.params.video_size(), "Recording started");
        Ok(())
    }

    #[instrument(skip(self))]
    fn stop_recording(&mut self) -> HalResult<()> {
        // lent frames go back with the channel
        self.hub.delete_channel(ChannelType::Video);
        info!("Recording stopped");
        Ok(())
    }

    fn release_recording_frame(&mut self, frame: &BufferBlock) -> HalResult<()> {
        match self.hub.channel(ChannelType::Video) {
            Some(video) => video.release_frame(frame, self.store_metadata),
            None => {
                debug!("Recording frame released after the video channel went away");
                Ok(())
            }
        }
    }

    fn auto_focus(&mut self) -> HalResult<()> {
        if !self.hub.caps.supports_auto_focus || self.params.focus_mode() != "auto" {
            // nothing to move, report focused at once
            self.hub.notify(MsgType::FOCUS, 1, 0);
            return Ok(());
        }
        self.hub.ops.do_auto_focus()
    }

    fn cancel_auto_focus(&mut self) -> HalResult<()> {
        if !self.hub.caps.supports_auto_focus {
            return Ok(());
        }
        self.hub.ops.cancel_auto_focus()
    }

    #[instrument(skip(self))]
    fn take_picture(&mut self) -> HalResult<()> {
        if let Err(e) = self.capture() {
            if let Err(e) = self.cancel_picture() {
                warn!("Cancel after failed capture failed: {}", e);
            }
            // the machine leaves preview behind whichever path failed
            self.delete_channels(&PREVIEW_CHANNELS);
            return Err(e);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn cancel_picture(&mut self) -> HalResult<()> {
        self.hub.end_capture();
        self.hub.postproc.stop();
        self.delete_channels(&CAPTURE_CHANNELS);
        if let Some(zsl) = self.hub.channel(ChannelType::Zsl) {
            zsl.cancel_picture()?;
            // the state machine treats the capture as the end of preview
            self.delete_channels(&PREVIEW_CHANNELS);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn take_live_snapshot(&mut self) -> HalResult<()> {
        if !self.hub.channel(ChannelType::Video).is_some_and(|v| v.is_running()) {
            return Err(HalError::InvalidOperation("live snapshot needs a running video channel".into()));
        }
        let result = self.hub.postproc.start().and_then(|_| {
            self.hub.begin_capture(1);
            self.start_reprocess_channel()?;
            let plan = self.plan().burst(1);
            let channel = self.build_channel(
                ChannelType::Snapshot,
                NotifyMode::Continuous,
                Some(self.hub.capture_callback()),
                &plan,
                vec![(StreamType::Snapshot, None)],
            )?;
            channel.start()
        });
        if let Err(e) = result {
            if let Err(e) = self.cancel_live_snapshot() {
                warn!("Cancel after failed live snapshot failed: {}", e);
            }
            return Err(e);
        }
        info!("Live snapshot requested");
        Ok(())
    }

    fn cancel_live_snapshot(&mut self) -> HalResult<()> {
        self.hub.end_capture();
        self.hub.postproc.stop();
        self.delete_channels(&[ChannelType::Snapshot, ChannelType::Reprocess]);
        Ok(())
    }

    fn send_command(&mut self, cmd: CameraCommand) -> HalResult<()> {
        match cmd {
            CameraCommand::StartFaceDetection => {
                if self.hub.caps.max_num_faces == 0 {
                    return Err(HalError::BadValue("face detection not supported".into()));
                }
                self.hub.set_face_detection(true)
            }
            CameraCommand::StopFaceDetection => self.hub.set_face_detection(false),
            CameraCommand::HistogramOn => self.hub.set_histogram(true),
            CameraCommand::HistogramOff => self.hub.set_histogram(false),
            CameraCommand::HistogramSendData => self.hub.request_histogram(),
        }
    }

    fn dump(&self) -> String {
        format!("{} staged={}", self.hub.dump(), self.staged.is_some())
    }

    fn release(&mut self) -> HalResult<()> {
        self.hub.end_capture();
        self.hub.postproc.stop();
        self.hub.delete_all_channels();
        info!("Camera resources released");
        Ok(())
    }

    fn process_focus_update(&mut self, focused: bool) -> HalResult<()> {
        self.hub.notify(MsgType::FOCUS, i32::from(focused), 0);
        Ok(())
    }

    fn process_zoom_done(&mut self, zoom: u32) -> HalResult<()> {
        let zoom = i32::try_from(zoom).map_err(|_| HalError::BadValue(format!("zoom {zoom}")))?;
        self.hub.notify(MsgType::ZOOM, zoom, 1);
        Ok(())
    }

    fn process_jpeg_notify(&mut self, evt: JpegEvent) -> HalResult<()> {
        self.hub.postproc.process_jpeg_evt(evt)
    }
}

impl Drop for HwiControl {
    fn drop(&mut self) {
        self.hub.postproc.stop();
        self.hub.delete_all_channels();
        self.hub.postproc.deinit();
        if let Err(e) = self.hub.ops.close() {
            warn!("Driver close failed: {}", e);
        }
        debug!(camera = self.hub.caps.camera_id, "Camera control dropped");
    }
}
