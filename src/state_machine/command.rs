//! Commands carried from framework and driver threads to the state machine worker.

use std::sync::Arc;

use flume::Sender;

use crate::callbacks::{CameraCallbacks, MsgType};
use crate::display::PreviewWindow;
use crate::error::HalResult;
use crate::mem::BufferBlock;
use crate::postproc::JpegEvent;

/// `send_command` verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraCommand {
    StartFaceDetection,
    StopFaceDetection,
    HistogramOn,
    HistogramOff,
    /// Deliver the next histogram that arrives
    HistogramSendData,
}

/// Framework API calls. Payloads are owned by the request.
pub enum ApiRequest {
    SetPreviewWindow(Option<Arc<dyn PreviewWindow>>),
    SetCallbacks(Option<Arc<dyn CameraCallbacks>>),
    EnableMsgType(MsgType),
    DisableMsgType(MsgType),
    MsgTypeEnabled(MsgType),
    SetParams(String),
    GetParams,
    PutParams(String),
    StartPreview,
    StartNoDisplayPreview,
    StopPreview,
    PreviewEnabled,
    StoreMetadataInBuffers(bool),
    StartRecording,
    StopRecording,
    RecordingEnabled,
    ReleaseRecordingFrame(BufferBlock),
    StartAutoFocus,
    StopAutoFocus,
    TakePicture,
    CancelPicture,
    SendCommand(CameraCommand),
    Dump,
    Release,
}

/// Payload-free tag of an [`ApiRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiKind {
    SetPreviewWindow,
    SetCallbacks,
    EnableMsgType,
    DisableMsgType,
    MsgTypeEnabled,
    SetParams,
    GetParams,
    PutParams,
    StartPreview,
    StartNoDisplayPreview,
    StopPreview,
    PreviewEnabled,
    StoreMetadataInBuffers,
    StartRecording,
    StopRecording,
    RecordingEnabled,
    ReleaseRecordingFrame,
    StartAutoFocus,
    StopAutoFocus,
    TakePicture,
    CancelPicture,
    SendCommand,
    Dump,
    Release,
}

impl ApiRequest {
    pub fn kind(&self) -> ApiKind {
        match self {
            ApiRequest::SetPreviewWindow(_) => ApiKind::SetPreviewWindow,
            ApiRequest::SetCallbacks(_) => ApiKind::SetCallbacks,
            ApiRequest::EnableMsgType(_) => ApiKind::EnableMsgType,
            ApiRequest::DisableMsgType(_) => ApiKind::DisableMsgType,
            ApiRequest::MsgTypeEnabled(_) => ApiKind::MsgTypeEnabled,
            ApiRequest::SetParams(_) => ApiKind::SetParams,
            ApiRequest::GetParams => ApiKind::GetParams,
            ApiRequest::PutParams(_) => ApiKind::PutParams,
            ApiRequest::StartPreview => ApiKind::StartPreview,
            ApiRequest::StartNoDisplayPreview => ApiKind::StartNoDisplayPreview,
            ApiRequest::StopPreview => ApiKind::StopPreview,
            ApiRequest::PreviewEnabled => ApiKind::PreviewEnabled,
            ApiRequest::StoreMetadataInBuffers(_) => ApiKind::StoreMetadataInBuffers,
            ApiRequest::StartRecording => ApiKind::StartRecording,
            ApiRequest::StopRecording => ApiKind::StopRecording,
            ApiRequest::RecordingEnabled => ApiKind::RecordingEnabled,
            ApiRequest::ReleaseRecordingFrame(_) => ApiKind::ReleaseRecordingFrame,
            ApiRequest::StartAutoFocus => ApiKind::StartAutoFocus,
            ApiRequest::StopAutoFocus => ApiKind::StopAutoFocus,
            ApiRequest::TakePicture => ApiKind::TakePicture,
            ApiRequest::CancelPicture => ApiKind::CancelPicture,
            ApiRequest::SendCommand(_) => ApiKind::SendCommand,
            ApiRequest::Dump => ApiKind::Dump,
            ApiRequest::Release => ApiKind::Release,
        }
    }
}

impl std::fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiRequest::SetParams(p) | ApiRequest::PutParams(p) => {
                write!(f, "{:?}({} bytes)", self.kind(), p.len())
            }
            ApiRequest::EnableMsgType(m)
            | ApiRequest::DisableMsgType(m)
            | ApiRequest::MsgTypeEnabled(m) => write!(f, "{:?}({:#x})", self.kind(), m.0),
            ApiRequest::SendCommand(c) => write!(f, "SendCommand({c:?})"),
            _ => write!(f, "{:?}", self.kind()),
        }
    }
}

/// Asynchronous inputs from the driver, the encoder and the HAL itself
#[derive(Debug)]
pub enum HalEvent {
    /// Auto-focus finished, converted from the driver event
    FocusUpdate { focused: bool },
    ZoomDone { zoom: u32 },
    JpegNotify(JpegEvent),
    /// All expected JPEGs of a capture were delivered
    SnapshotDone,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResultPayload {
    #[default]
    None,
    Enabled(bool),
    Params(String),
}

/// Exactly one of these answers each API request
#[derive(Debug, Clone)]
pub struct ApiResult {
    pub request: ApiKind,
    pub status: HalResult<()>,
    pub payload: ResultPayload,
}

impl ApiResult {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn enabled(&self) -> Option<bool> {
        match self.payload {
            ResultPayload::Enabled(e) => Some(e),
            _ => None,
        }
    }

    pub fn params(&self) -> Option<&str> {
        match &self.payload {
            ResultPayload::Params(p) => Some(p),
            _ => None,
        }
    }
}

pub(crate) enum Command {
    Api {
        request: ApiRequest,
        reply: Sender<ApiResult>,
    },
    Event(HalEvent),
}
