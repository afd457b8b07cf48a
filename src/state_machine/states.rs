//! Per-state request handling.
//!
//! Each state is a unit struct implementing [`StateHandler`]. Requests valid in
//! every state (callbacks, message types, parameter reads, dumps) never reach
//! the handlers; everything else is routed by category and rejected with
//! `InvalidOperation` unless the state overrides that category.

use tracing::{error, warn};

use super::command::{ApiKind, ApiRequest, HalEvent, ResultPayload};
use super::control::CameraControl;
use crate::error::{HalError, HalResult};
use crate::StateMachineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    PreviewStopped = 0,
    /// Preview requested but no window to draw into yet
    PreviewReady,
    Previewing,
    PictureTaking,
    Recording,
    /// Live snapshot while recording
    VideoPictureTaking,
    /// Live snapshot still finishing after recording stopped
    PreviewPictureTaking,
}

impl State {
    pub fn is_preview_running(self) -> bool {
        matches!(
            self,
            State::Previewing
                | State::Recording
                | State::VideoPictureTaking
                | State::PreviewPictureTaking
        )
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => State::PreviewReady,
            2 => State::Previewing,
            3 => State::PictureTaking,
            4 => State::Recording,
            5 => State::VideoPictureTaking,
            6 => State::PreviewPictureTaking,
            _ => State::PreviewStopped,
        }
    }
}

/// Outcome of one handled command
#[derive(Debug)]
pub struct Step {
    pub status: HalResult<()>,
    pub payload: ResultPayload,
    pub next: Option<State>,
}

impl Step {
    pub fn ok() -> Self {
        Self::status(Ok(()))
    }

    pub fn status(status: HalResult<()>) -> Self {
        Self {
            status,
            payload: ResultPayload::None,
            next: None,
        }
    }

    /// Move to `next` whatever `status` says.
    pub fn to(status: HalResult<()>, next: State) -> Self {
        Self {
            next: Some(next),
            ..Self::status(status)
        }
    }

    fn with_payload(payload: ResultPayload) -> Self {
        Self {
            payload,
            ..Self::ok()
        }
    }

    fn invalid(kind: ApiKind, state: State) -> Self {
        error!(?kind, ?state, "Cannot handle request in this state");
        Self::status(Err(HalError::invalid_in_state(kind, state)))
    }
}

pub struct Ctx<'a> {
    pub control: &'a mut dyn CameraControl,
    pub policy: StateMachineConfig,
}

pub trait StateHandler: Send + Sync {
    fn state(&self) -> State;

    /// SetPreviewWindow, StartPreview, StartNoDisplayPreview, StopPreview
    fn on_preview(&self, _ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        Step::invalid(request.kind(), self.state())
    }

    /// StartRecording, StopRecording, ReleaseRecordingFrame
    fn on_recording(&self, _ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        Step::invalid(request.kind(), self.state())
    }

    /// TakePicture, CancelPicture
    fn on_capture(&self, _ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        Step::invalid(request.kind(), self.state())
    }

    /// StartAutoFocus, StopAutoFocus, SendCommand
    fn on_control(&self, ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        Step::status(control_request(ctx, request))
    }

    fn on_set_params(&self, ctx: &mut Ctx<'_>, params: &str) -> Step {
        Step::status(update_and_commit(ctx, params))
    }

    fn on_release(&self, _ctx: &mut Ctx<'_>) -> Step {
        Step::invalid(ApiKind::Release, self.state())
    }

    fn on_event(&self, ctx: &mut Ctx<'_>, event: HalEvent) -> Step {
        common_event(self.state(), ctx, event)
    }

    fn preview_enabled(&self) -> bool {
        self.state().is_preview_running()
    }

    fn recording_enabled(&self) -> bool {
        false
    }
}

fn control_request(ctx: &mut Ctx<'_>, request: ApiRequest) -> HalResult<()> {
    match request {
        ApiRequest::StartAutoFocus => ctx.control.auto_focus(),
        ApiRequest::StopAutoFocus => ctx.control.cancel_auto_focus(),
        ApiRequest::SendCommand(cmd) => ctx.control.send_command(cmd),
        other => Err(HalError::InvalidArgument(format!("{:?} is not a control request", other.kind()))),
    }
}

fn update_and_commit(ctx: &mut Ctx<'_>, params: &str) -> HalResult<()> {
    ctx.control.update_parameters(params)?;
    ctx.control.commit_parameters()
}

fn prepare_and_start(ctx: &mut Ctx<'_>, display: bool) -> HalResult<()> {
    ctx.control.prepare_preview(display)?;
    if let Err(e) = ctx.control.start_preview() {
        ctx.control.unprepare_preview();
        return Err(e);
    }
    Ok(())
}

/// Parameters that need a restart: stop preview, commit, start again.
/// A failed restart leaves the camera stopped.
fn set_params_restarting_preview(ctx: &mut Ctx<'_>, params: &str) -> Step {
    let restart = match ctx.control.update_parameters(params) {
        Ok(r) => r,
        Err(e) => return Step::status(Err(e)),
    };
    if !restart {
        return Step::status(ctx.control.commit_parameters());
    }
    if let Err(e) = ctx.control.stop_preview() {
        warn!("Stop before restart failed: {}", e);
    }
    let committed = ctx.control.commit_parameters();
    match committed.and_then(|_| ctx.control.start_preview()) {
        Ok(()) => Step::ok(),
        Err(e) => {
            error!("Preview restart failed: {}", e);
            ctx.control.unprepare_preview();
            Step::to(Err(e), State::PreviewStopped)
        }
    }
}

/// Parameters during recording: rejected with `BadValue` when they need a
/// restart, unless the policy allows tearing the whole pipeline down.
fn set_params_while_recording(ctx: &mut Ctx<'_>, params: &str, allow_restart: bool) -> Step {
    let restart = match ctx.control.update_parameters(params) {
        Ok(r) => r,
        Err(e) => return Step::status(Err(e)),
    };
    if !restart {
        return Step::status(ctx.control.commit_parameters());
    }
    if !allow_restart {
        error!("Parameters requiring a restart cannot be set while recording");
        ctx.control.discard_parameters();
        return Step::status(Err(HalError::BadValue(
            "parameter change needs a restart during recording".into(),
        )));
    }

    if let Err(e) = ctx.control.stop_recording() {
        warn!("Stop recording before restart failed: {}", e);
    }
    if let Err(e) = ctx.control.stop_preview() {
        warn!("Stop preview before restart failed: {}", e);
    }
    let restarted = ctx
        .control
        .commit_parameters()
        .and_then(|_| ctx.control.start_preview())
        .and_then(|_| ctx.control.start_recording());
    match restarted {
        Ok(()) => Step::ok(),
        Err(e) => {
            error!("Recording restart failed: {}", e);
            if let Err(e) = ctx.control.stop_recording() {
                warn!("Stop recording after failed restart failed: {}", e);
            }
            if let Err(e) = ctx.control.stop_preview() {
                warn!("Stop preview after failed restart failed: {}", e);
            }
            ctx.control.unprepare_preview();
            Step::to(Err(e), State::PreviewStopped)
        }
    }
}

pub struct PreviewStopped;
pub struct PreviewReady;
pub struct Previewing;
pub struct PictureTaking;
pub struct Recording;
pub struct VideoPictureTaking;
pub struct PreviewPictureTaking;

impl StateHandler for PreviewStopped {
    fn state(&self) -> State {
        State::PreviewStopped
    }

    fn on_preview(&self, ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        match request {
            ApiRequest::SetPreviewWindow(w) => Step::status(ctx.control.set_preview_window(w)),
            ApiRequest::StartPreview if !ctx.control.has_preview_window() => {
                Step::to(Ok(()), State::PreviewReady)
            }
            ApiRequest::StartPreview => match prepare_and_start(ctx, true) {
                Ok(()) => Step::to(Ok(()), State::Previewing),
                Err(e) => Step::status(Err(e)),
            },
            ApiRequest::StartNoDisplayPreview => match prepare_and_start(ctx, false) {
                Ok(()) => Step::to(Ok(()), State::Previewing),
                Err(e) => Step::status(Err(e)),
            },
            // already stopped
            ApiRequest::StopPreview => Step::ok(),
            other => Step::invalid(other.kind(), self.state()),
        }
    }

    fn on_control(&self, _ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        Step::invalid(request.kind(), self.state())
    }

    fn on_release(&self, ctx: &mut Ctx<'_>) -> Step {
        Step::status(ctx.control.release())
    }
}

impl StateHandler for PreviewReady {
    fn state(&self) -> State {
        State::PreviewReady
    }

    fn on_preview(&self, ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        match request {
            ApiRequest::SetPreviewWindow(w) => {
                if let Err(e) = ctx.control.set_preview_window(w) {
                    return Step::status(Err(e));
                }
                if !ctx.control.has_preview_window() {
                    return Step::ok();
                }
                match prepare_and_start(ctx, true) {
                    Ok(()) => Step::to(Ok(()), State::Previewing),
                    Err(e) => Step::to(Err(e), State::PreviewStopped),
                }
            }
            ApiRequest::StartPreview => Step::ok(),
            ApiRequest::StopPreview => {
                ctx.control.unprepare_preview();
                Step::to(Ok(()), State::PreviewStopped)
            }
            other => Step::invalid(other.kind(), self.state()),
        }
    }

    fn preview_enabled(&self) -> bool {
        true
    }
}

impl StateHandler for Previewing {
    fn state(&self) -> State {
        State::Previewing
    }

    fn on_preview(&self, ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        match request {
            ApiRequest::StartPreview | ApiRequest::StartNoDisplayPreview => Step::ok(),
            ApiRequest::StopPreview => Step::to(ctx.control.stop_preview(), State::PreviewStopped),
            other => Step::invalid(other.kind(), self.state()),
        }
    }

    fn on_recording(&self, ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        match request {
            ApiRequest::StartRecording => match ctx.control.start_recording() {
                Ok(()) => Step::to(Ok(()), State::Recording),
                Err(e) => Step::status(Err(e)),
            },
            other => Step::invalid(other.kind(), self.state()),
        }
    }

    fn on_capture(&self, ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        match request {
            // a failed capture leaves preview torn down
            ApiRequest::TakePicture => match ctx.control.take_picture() {
                Ok(()) => Step::to(Ok(()), State::PictureTaking),
                Err(e) => Step::to(Err(e), State::PreviewStopped),
            },
            other => Step::invalid(other.kind(), self.state()),
        }
    }

    fn on_set_params(&self, ctx: &mut Ctx<'_>, params: &str) -> Step {
        set_params_restarting_preview(ctx, params)
    }
}

impl StateHandler for PictureTaking {
    fn state(&self) -> State {
        State::PictureTaking
    }

    fn on_preview(&self, _ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        match request {
            // preview is already down for the capture
            ApiRequest::StopPreview => Step::ok(),
            other => Step::invalid(other.kind(), self.state()),
        }
    }

    fn on_capture(&self, ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        match request {
            ApiRequest::CancelPicture => {
                Step::to(ctx.control.cancel_picture(), State::PreviewStopped)
            }
            other => Step::invalid(other.kind(), self.state()),
        }
    }

    fn on_event(&self, ctx: &mut Ctx<'_>, event: HalEvent) -> Step {
        match event {
            HalEvent::SnapshotDone => Step::to(ctx.control.cancel_picture(), State::PreviewStopped),
            other => common_event(self.state(), ctx, other),
        }
    }
}

impl StateHandler for Recording {
    fn state(&self) -> State {
        State::Recording
    }

    fn on_recording(&self, ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        match request {
            ApiRequest::StartRecording => Step::ok(),
            ApiRequest::StopRecording => Step::to(ctx.control.stop_recording(), State::Previewing),
            ApiRequest::ReleaseRecordingFrame(frame) => {
                Step::status(ctx.control.release_recording_frame(&frame))
            }
            other => Step::invalid(other.kind(), self.state()),
        }
    }

    fn on_capture(&self, ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        match request {
            ApiRequest::TakePicture => match ctx.control.take_live_snapshot() {
                Ok(()) => Step::to(Ok(()), State::VideoPictureTaking),
                Err(e) => Step::status(Err(e)),
            },
            other => Step::invalid(other.kind(), self.state()),
        }
    }

    fn on_set_params(&self, ctx: &mut Ctx<'_>, params: &str) -> Step {
        let allow = ctx.policy.allow_restart_while_recording;
        set_params_while_recording(ctx, params, allow)
    }

    fn recording_enabled(&self) -> bool {
        true
    }
}

impl StateHandler for VideoPictureTaking {
    fn state(&self) -> State {
        State::VideoPictureTaking
    }

    fn on_recording(&self, ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        match request {
            ApiRequest::StopRecording => {
                Step::to(ctx.control.stop_recording(), State::PreviewPictureTaking)
            }
            ApiRequest::ReleaseRecordingFrame(frame) => {
                Step::status(ctx.control.release_recording_frame(&frame))
            }
            other => Step::invalid(other.kind(), self.state()),
        }
    }

    fn on_capture(&self, ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        match request {
            ApiRequest::CancelPicture => {
                Step::to(ctx.control.cancel_live_snapshot(), State::Recording)
            }
            other => Step::invalid(other.kind(), self.state()),
        }
    }

    fn on_set_params(&self, ctx: &mut Ctx<'_>, params: &str) -> Step {
        set_params_while_recording(ctx, params, false)
    }

    fn on_event(&self, ctx: &mut Ctx<'_>, event: HalEvent) -> Step {
        match event {
            HalEvent::SnapshotDone => {
                Step::to(ctx.control.cancel_live_snapshot(), State::Recording)
            }
            other => common_event(self.state(), ctx, other),
        }
    }

    fn recording_enabled(&self) -> bool {
        true
    }
}

impl StateHandler for PreviewPictureTaking {
    fn state(&self) -> State {
        State::PreviewPictureTaking
    }

    fn on_preview(&self, ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        match request {
            // the snapshot keeps going without preview
            ApiRequest::StopPreview => {
                Step::to(ctx.control.drop_preview_channels(), State::PictureTaking)
            }
            other => Step::invalid(other.kind(), self.state()),
        }
    }

    fn on_recording(&self, ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        match request {
            ApiRequest::StartRecording => match ctx.control.start_recording() {
                Ok(()) => Step::to(Ok(()), State::VideoPictureTaking),
                Err(e) => Step::status(Err(e)),
            },
            ApiRequest::ReleaseRecordingFrame(frame) => {
                Step::status(ctx.control.release_recording_frame(&frame))
            }
            other => Step::invalid(other.kind(), self.state()),
        }
    }

    fn on_capture(&self, ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
        match request {
            ApiRequest::CancelPicture => {
                Step::to(ctx.control.cancel_live_snapshot(), State::Previewing)
            }
            other => Step::invalid(other.kind(), self.state()),
        }
    }

    fn on_set_params(&self, ctx: &mut Ctx<'_>, params: &str) -> Step {
        set_params_restarting_preview(ctx, params)
    }

    fn on_event(&self, ctx: &mut Ctx<'_>, event: HalEvent) -> Step {
        match event {
            HalEvent::SnapshotDone => {
                Step::to(ctx.control.cancel_live_snapshot(), State::Previewing)
            }
            other => common_event(self.state(), ctx, other),
        }
    }
}

/// Focus, zoom and encoder events are handled the same way in every state.
fn common_event(state: State, ctx: &mut Ctx<'_>, event: HalEvent) -> Step {
    match event {
        HalEvent::FocusUpdate { focused } => Step::status(ctx.control.process_focus_update(focused)),
        HalEvent::ZoomDone { zoom } => Step::status(ctx.control.process_zoom_done(zoom)),
        HalEvent::JpegNotify(evt) => Step::status(ctx.control.process_jpeg_notify(evt)),
        HalEvent::SnapshotDone => {
            error!(?state, "Snapshot done outside a capture");
            Step::status(Err(HalError::invalid_in_state("SnapshotDone", state)))
        }
    }
}

pub fn handler_for(state: State) -> &'static dyn StateHandler {
    match state {
        State::PreviewStopped => &PreviewStopped,
        State::PreviewReady => &PreviewReady,
        State::Previewing => &Previewing,
        State::PictureTaking => &PictureTaking,
        State::Recording => &Recording,
        State::VideoPictureTaking => &VideoPictureTaking,
        State::PreviewPictureTaking => &PreviewPictureTaking,
    }
}

/// Route one API request: shared requests are answered here, the rest go to the state.
pub fn dispatch_api(handler: &dyn StateHandler, ctx: &mut Ctx<'_>, request: ApiRequest) -> Step {
    match request {
        ApiRequest::SetCallbacks(cbs) => Step::status(ctx.control.set_callbacks(cbs)),
        ApiRequest::EnableMsgType(m) => Step::status(ctx.control.enable_msg_type(m)),
        ApiRequest::DisableMsgType(m) => Step::status(ctx.control.disable_msg_type(m)),
        ApiRequest::MsgTypeEnabled(m) => {
            Step::with_payload(ResultPayload::Enabled(ctx.control.msg_type_enabled(m)))
        }
        ApiRequest::GetParams => Step::with_payload(ResultPayload::Params(ctx.control.get_parameters())),
        // the framework hands back a string it got from GetParams
        ApiRequest::PutParams(_) => Step::ok(),
        ApiRequest::StoreMetadataInBuffers(on) => {
            Step::status(ctx.control.store_metadata_in_buffers(on))
        }
        ApiRequest::Dump => Step::with_payload(ResultPayload::Params(ctx.control.dump())),
        ApiRequest::PreviewEnabled => {
            Step::with_payload(ResultPayload::Enabled(handler.preview_enabled()))
        }
        ApiRequest::RecordingEnabled => {
            Step::with_payload(ResultPayload::Enabled(handler.recording_enabled()))
        }
        ApiRequest::SetParams(params) => handler.on_set_params(ctx, &params),
        ApiRequest::Release => handler.on_release(ctx),
        r @ (ApiRequest::SetPreviewWindow(_)
        | ApiRequest::StartPreview
        | ApiRequest::StartNoDisplayPreview
        | ApiRequest::StopPreview) => handler.on_preview(ctx, r),
        r @ (ApiRequest::StartRecording
        | ApiRequest::StopRecording
        | ApiRequest::ReleaseRecordingFrame(_)) => handler.on_recording(ctx, r),
        r @ (ApiRequest::TakePicture | ApiRequest::CancelPicture) => handler.on_capture(ctx, r),
        r @ (ApiRequest::StartAutoFocus | ApiRequest::StopAutoFocus | ApiRequest::SendCommand(_)) => {
            handler.on_control(ctx, r)
        }
    }
}
