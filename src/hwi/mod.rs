//! Hardware interface: one opened camera.
//!
//! [`Camera`] is the host-facing surface. Every call becomes one API request to
//! the camera's state machine and blocks until its result comes back. The
//! work itself happens in the control the state machine owns.

mod control;
mod hub;
pub mod parameters;
mod streams;

use std::sync::Arc;

use flume::Receiver;
use tracing::{info, instrument, warn};

use self::control::HwiControl;
use self::hub::Hub;
use self::parameters::Parameters;
use crate::callbacks::{CameraCallbacks, MsgType};
use crate::display::PreviewWindow;
use crate::driver::{CameraOps, Capabilities};
use crate::error::{HalError, HalResult};
use crate::mem::BufferBlock;
use crate::postproc::SoftwareJpegEngine;
use crate::state_machine::{ApiRequest, ApiResult, CameraCommand, State, StateMachine};
use crate::HalConfig;

pub struct Camera {
    id: u32,
    caps: Capabilities,
    sm: StateMachine,
}

impl Camera {
    /// Bring up the camera behind `ops`: parameters, post-processor, driver
    /// events and the state machine, in that order.
    #[instrument(skip(ops, config))]
    pub fn open(id: u32, ops: Arc<dyn CameraOps>, config: &HalConfig) -> HalResult<Self> {
        let caps = ops.query_capability()?;
        let params = Parameters::defaults(&caps, &config.camera, &config.postproc)?;
        let engine = Arc::new(SoftwareJpegEngine::with_workers(config.postproc.encoder_workers)?);
        let hub = Hub::new(ops.clone(), caps.clone(), config.clone(), engine);

        let setup = hub
            .postproc
            .init()
            .and_then(|_| ops.register_event_notify(hub.driver_events()))
            .and_then(|_| ops.set_parms(&params.diff(&Parameters::default())));
        if let Err(e) = setup {
            hub.postproc.deinit();
            if let Err(e) = ops.close() {
                warn!(id, "Close after failed setup failed: {}", e);
            }
            return Err(e);
        }

        // from here the control owns teardown
        let control = HwiControl::new(hub.clone(), params);
        let sm = StateMachine::new(Box::new(control), config.state_machine)?;
        hub.attach(sm.event_sender());
        info!(id, facing = ?caps.facing, "Camera opened");
        Ok(Self { id, caps, sm })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn state(&self) -> State {
        self.sm.state()
    }

    /// Every state entered from now on, in order.
    pub fn watch_states(&self) -> Receiver<State> {
        self.sm.watch_states()
    }

    fn call(&self, request: ApiRequest) -> HalResult<ApiResult> {
        let result = self.sm.submit_api(request);
        result.status.clone()?;
        Ok(result)
    }

    fn flag(&self, request: ApiRequest) -> HalResult<bool> {
        let kind = request.kind();
        self.call(request)?
            .enabled()
            .ok_or_else(|| HalError::InvalidOperation(format!("{kind:?} returned no flag")))
    }

    fn text(&self, request: ApiRequest) -> HalResult<String> {
        let kind = request.kind();
        self.call(request)?
            .params()
            .map(str::to_string)
            .ok_or_else(|| HalError::InvalidOperation(format!("{kind:?} returned no text")))
    }

    pub fn set_preview_window(&self, window: Option<Arc<dyn PreviewWindow>>) -> HalResult<()> {
        self.call(ApiRequest::SetPreviewWindow(window)).map(drop)
    }

    pub fn set_callbacks(&self, callbacks: Option<Arc<dyn CameraCallbacks>>) -> HalResult<()> {
        self.call(ApiRequest::SetCallbacks(callbacks)).map(drop)
    }

    pub fn enable_msg_type(&self, msg: MsgType) -> HalResult<()> {
        self.call(ApiRequest::EnableMsgType(msg)).map(drop)
    }

    pub fn disable_msg_type(&self, msg: MsgType) -> HalResult<()> {
        self.call(ApiRequest::DisableMsgType(msg)).map(drop)
    }

    pub fn msg_type_enabled(&self, msg: MsgType) -> HalResult<bool> {
        self.flag(ApiRequest::MsgTypeEnabled(msg))
    }

    pub fn set_parameters(&self, params: &str) -> HalResult<()> {
        self.call(ApiRequest::SetParams(params.to_string())).map(drop)
    }

    pub fn get_parameters(&self) -> HalResult<String> {
        self.text(ApiRequest::GetParams)
    }

    /// Hand back a string obtained from [`Camera::get_parameters`].
    pub fn put_parameters(&self, params: String) -> HalResult<()> {
        self.call(ApiRequest::PutParams(params)).map(drop)
    }

    pub fn start_preview(&self) -> HalResult<()> {
        self.call(ApiRequest::StartPreview).map(drop)
    }

    pub fn start_no_display_preview(&self) -> HalResult<()> {
        self.call(ApiRequest::StartNoDisplayPreview).map(drop)
    }

    pub fn stop_preview(&self) -> HalResult<()> {
        self.call(ApiRequest::StopPreview).map(drop)
    }

    pub fn preview_enabled(&self) -> HalResult<bool> {
        self.flag(ApiRequest::PreviewEnabled)
    }

    pub fn store_metadata_in_buffers(&self, enable: bool) -> HalResult<()> {
        self.call(ApiRequest::StoreMetadataInBuffers(enable)).map(drop)
    }

    pub fn start_recording(&self) -> HalResult<()> {
        self.call(ApiRequest::StartRecording).map(drop)
    }

    pub fn stop_recording(&self) -> HalResult<()> {
        self.call(ApiRequest::StopRecording).map(drop)
    }

    pub fn recording_enabled(&self) -> HalResult<bool> {
        self.flag(ApiRequest::RecordingEnabled)
    }

    /// Return a video frame received through `data_timestamp`.
    pub fn release_recording_frame(&self, frame: BufferBlock) -> HalResult<()> {
        self.call(ApiRequest::ReleaseRecordingFrame(frame)).map(drop)
    }

    pub fn auto_focus(&self) -> HalResult<()> {
        self.call(ApiRequest::StartAutoFocus).map(drop)
    }

    pub fn cancel_auto_focus(&self) -> HalResult<()> {
        self.call(ApiRequest::StopAutoFocus).map(drop)
    }

    pub fn take_picture(&self) -> HalResult<()> {
        self.call(ApiRequest::TakePicture).map(drop)
    }

    pub fn cancel_picture(&self) -> HalResult<()> {
        self.call(ApiRequest::CancelPicture).map(drop)
    }

    pub fn send_command(&self, cmd: CameraCommand) -> HalResult<()> {
        self.call(ApiRequest::SendCommand(cmd)).map(drop)
    }

    pub fn dump(&self) -> HalResult<String> {
        self.text(ApiRequest::Dump)
    }

    pub fn release(&self) -> HalResult<()> {
        self.call(ApiRequest::Release).map(drop)
    }

    /// Stop the state machine; its control tears down channels and closes the driver.
    pub fn close(self) {
        self.sm.shutdown();
        info!(id = self.id, "Camera closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use flume::Sender;

    use super::*;
    use crate::callbacks::FrameFaces;
    use crate::display::ChannelWindow;
    use crate::driver::{CameraProvider, SimDriver, SimProvider};

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug)]
    enum Cb {
        Notify(MsgType, i32),
        Data(MsgType, Bytes, Option<FrameFaces>),
        Video(BufferBlock),
    }

    struct Sink(Sender<Cb>);

    impl CameraCallbacks for Sink {
        fn notify(&self, msg: MsgType, ext1: i32, _ext2: i32) {
            let _ = self.0.send(Cb::Notify(msg, ext1));
        }

        fn data(&self, msg: MsgType, data: Bytes, _index: u32, metadata: Option<&FrameFaces>) {
            let _ = self.0.send(Cb::Data(msg, data, metadata.cloned()));
        }

        fn data_timestamp(&self, _ts: Duration, _msg: MsgType, frame: &BufferBlock, _index: u32) {
            let _ = self.0.send(Cb::Video(frame.clone()));
        }
    }

    struct Rig {
        cam: Camera,
        driver: Arc<SimDriver>,
        cbs: Receiver<Cb>,
    }

    fn rig_with(config: HalConfig) -> Rig {
        let provider = SimProvider::new(1, 60);
        let ops = provider.open(0).unwrap();
        let driver = provider.driver(0).unwrap();
        let cam = Camera::open(0, ops, &config).unwrap();
        let (tx, cbs) = flume::unbounded();
        cam.set_callbacks(Some(Arc::new(Sink(tx)))).unwrap();
        Rig { cam, driver, cbs }
    }

    fn rig() -> Rig {
        rig_with(HalConfig::default())
    }

    impl Rig {
        /// Next callback matching `f`, skipping the rest.
        fn wait_for<T>(&self, mut f: impl FnMut(Cb) -> Option<T>) -> T {
            let deadline = std::time::Instant::now() + WAIT;
            loop {
                let left = deadline.saturating_duration_since(std::time::Instant::now());
                let cb = self.cbs.recv_timeout(left).expect("callback did not arrive");
                if let Some(v) = f(cb) {
                    return v;
                }
            }
        }

        fn wait_state(&self, states: &Receiver<State>, want: State) {
            loop {
                if states.recv_timeout(WAIT).expect("state not reached") == want {
                    return;
                }
            }
        }
    }

    #[test]
    fn open_pushes_initial_parameters() {
        let r = rig();
        let parms = r.driver.parms();
        assert_eq!(parms.get("preview-size").map(String::as_str), Some("640x480"));
        assert!(!parms.contains_key("max-zoom"));
        assert_eq!(r.cam.state(), State::PreviewStopped);
    }

    #[test]
    fn no_display_preview_sends_frames() {
        let r = rig();
        r.cam.enable_msg_type(MsgType::PREVIEW_FRAME).unwrap();
        r.cam.start_no_display_preview().unwrap();
        let len = r.wait_for(|cb| match cb {
            Cb::Data(MsgType::PREVIEW_FRAME, data, _) => Some(data.len()),
            _ => None,
        });
        assert!(len >= 640 * 480 * 3 / 2);
        r.cam.stop_preview().unwrap();
        assert_eq!(r.driver.outstanding(), 0);
    }

    #[test]
    fn display_preview_reaches_window() {
        let r = rig();
        let (window, frames) = ChannelWindow::new(2, 8);
        r.cam.set_preview_window(Some(window)).unwrap();
        r.cam.start_preview().unwrap();
        assert_eq!(r.cam.state(), State::Previewing);
        let shown = frames.recv_timeout(WAIT).unwrap();
        assert_eq!(shown.dim.width, 640);
        r.cam.stop_preview().unwrap();
        assert_eq!(r.driver.double_returns(), 0);
    }

    #[test]
    fn snapshot_delivers_jpeg_then_stops() {
        let r = rig();
        r.cam
            .enable_msg_type(MsgType::SHUTTER | MsgType::COMPRESSED_IMAGE)
            .unwrap();
        let states = r.cam.watch_states();
        r.cam.start_no_display_preview().unwrap();
        r.cam.take_picture().unwrap();

        r.wait_for(|cb| matches!(cb, Cb::Notify(MsgType::SHUTTER, _)).then_some(()));
        let jpeg = r.wait_for(|cb| match cb {
            Cb::Data(MsgType::COMPRESSED_IMAGE, data, _) => Some(data),
            _ => None,
        });
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        r.wait_state(&states, State::PreviewStopped);
        assert_eq!(r.driver.outstanding(), 0);
        assert_eq!(r.driver.double_returns(), 0);
    }

    #[test]
    fn auto_focus_and_zoom_notify() {
        let r = rig();
        r.cam.enable_msg_type(MsgType::FOCUS | MsgType::ZOOM).unwrap();
        r.cam.start_no_display_preview().unwrap();
        r.cam.auto_focus().unwrap();
        let focused = r.wait_for(|cb| match cb {
            Cb::Notify(MsgType::FOCUS, ext1) => Some(ext1),
            _ => None,
        });
        assert_eq!(focused, 1);

        r.cam.set_parameters("zoom=5").unwrap();
        let zoom = r.wait_for(|cb| match cb {
            Cb::Notify(MsgType::ZOOM, ext1) => Some(ext1),
            _ => None,
        });
        assert_eq!(zoom, 5);
        assert!(r.cam.get_parameters().unwrap().contains("zoom=5"));
    }

    #[test]
    fn recording_lends_frames_until_released() {
        let r = rig();
        r.cam.enable_msg_type(MsgType::VIDEO_FRAME).unwrap();
        r.cam.start_no_display_preview().unwrap();
        r.cam.start_recording().unwrap();
        assert!(r.cam.recording_enabled().unwrap());

        let frame = r.wait_for(|cb| match cb {
            Cb::Video(block) => Some(block),
            _ => None,
        });
        r.cam.release_recording_frame(frame).unwrap();
        r.cam.stop_recording().unwrap();
        r.cam.stop_preview().unwrap();
        assert_eq!(r.driver.outstanding(), 0);
        assert_eq!(r.driver.double_returns(), 0);
    }

    #[test]
    fn face_detection_reaches_metadata_callback() {
        let r = rig();
        r.cam.enable_msg_type(MsgType::PREVIEW_METADATA).unwrap();
        r.cam.start_no_display_preview().unwrap();
        r.cam.send_command(CameraCommand::StartFaceDetection).unwrap();
        let faces = r.wait_for(|cb| match cb {
            Cb::Data(MsgType::PREVIEW_METADATA, _, Some(f)) if !f.faces.is_empty() => Some(f),
            _ => None,
        });
        assert_eq!(faces.faces.len(), 1);
        assert!(matches!(
            r.cam.send_command(CameraCommand::HistogramSendData),
            Err(HalError::InvalidOperation(_))
        ));
    }

    #[test]
    fn raw_capture_skips_encoder() {
        let r = rig();
        r.cam.enable_msg_type(MsgType::RAW_IMAGE).unwrap();
        r.cam.set_parameters("picture-format=raw;picture-size=640x480").unwrap();
        let states = r.cam.watch_states();
        r.cam.start_no_display_preview().unwrap();
        r.cam.take_picture().unwrap();
        let len = r.wait_for(|cb| match cb {
            Cb::Data(MsgType::RAW_IMAGE, data, _) => Some(data.len()),
            _ => None,
        });
        assert!(len >= 640 * 480);
        r.wait_state(&states, State::PreviewStopped);
    }

    #[test]
    fn close_returns_every_buffer() {
        let r = rig();
        r.cam.start_no_display_preview().unwrap();
        let driver = r.driver.clone();
        r.cam.close();
        assert_eq!(driver.outstanding(), 0);
        assert_eq!(driver.num_channels(), 0);
    }
}
