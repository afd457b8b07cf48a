//! Application-facing callbacks and message types.

use std::time::Duration;

use bytes::Bytes;

use crate::capture::frame::FaceRect;
use crate::mem::BufferBlock;

/// Message-type bit set, as used by the enable/disable API and every callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MsgType(pub u32);

impl MsgType {
    pub const ERROR: MsgType = MsgType(0x0001);
    pub const SHUTTER: MsgType = MsgType(0x0002);
    pub const FOCUS: MsgType = MsgType(0x0004);
    pub const ZOOM: MsgType = MsgType(0x0008);
    pub const PREVIEW_FRAME: MsgType = MsgType(0x0010);
    pub const VIDEO_FRAME: MsgType = MsgType(0x0020);
    pub const POSTVIEW_FRAME: MsgType = MsgType(0x0040);
    pub const RAW_IMAGE: MsgType = MsgType(0x0080);
    pub const COMPRESSED_IMAGE: MsgType = MsgType(0x0100);
    pub const RAW_IMAGE_NOTIFY: MsgType = MsgType(0x0200);
    pub const PREVIEW_METADATA: MsgType = MsgType(0x0400);
    pub const FOCUS_MOVE: MsgType = MsgType(0x0800);
    pub const HISTOGRAM: MsgType = MsgType(0x1000);
    pub const ALL: MsgType = MsgType(0xFFFF);

    pub fn contains(self, other: MsgType) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when any bit of `other` is set
    pub fn intersects(self, other: MsgType) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for MsgType {
    type Output = MsgType;

    fn bitor(self, rhs: MsgType) -> MsgType {
        MsgType(self.0 | rhs.0)
    }
}

/// `ext1` of an `ERROR` notify
pub const ERROR_UNKNOWN: i32 = 1;
pub const ERROR_SERVER_DIED: i32 = 100;

/// Per-frame extras delivered alongside preview data
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameFaces {
    pub faces: Vec<FaceRect>,
}

/// Callbacks registered by the framework
pub trait CameraCallbacks: Send + Sync {
    fn notify(&self, msg: MsgType, ext1: i32, ext2: i32);

    fn data(&self, msg: MsgType, data: Bytes, index: u32, metadata: Option<&FrameFaces>);

    /// Video frames. The framework hands `frame` back through `release_recording_frame`.
    fn data_timestamp(&self, timestamp: Duration, msg: MsgType, frame: &BufferBlock, index: u32);
}
