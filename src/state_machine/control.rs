use std::sync::Arc;

use crate::callbacks::{CameraCallbacks, MsgType};
use crate::display::PreviewWindow;
use crate::error::HalResult;
use crate::mem::BufferBlock;
use crate::postproc::JpegEvent;

use super::command::CameraCommand;

/// Camera operations the state handlers drive. Only the worker thread calls these.
pub trait CameraControl: Send {
    fn set_preview_window(&mut self, window: Option<Arc<dyn PreviewWindow>>) -> HalResult<()>;
    fn has_preview_window(&self) -> bool;
    fn set_callbacks(&mut self, callbacks: Option<Arc<dyn CameraCallbacks>>) -> HalResult<()>;

    fn enable_msg_type(&mut self, msg: MsgType) -> HalResult<()>;
    fn disable_msg_type(&mut self, msg: MsgType) -> HalResult<()>;
    fn msg_type_enabled(&self, msg: MsgType) -> bool;

    /// Validate and stage `params`. Returns whether the preview must restart to apply them.
    fn update_parameters(&mut self, params: &str) -> HalResult<bool>;
    /// Apply staged parameters and push them to the driver.
    fn commit_parameters(&mut self) -> HalResult<()>;
    /// Forget staged parameters.
    fn discard_parameters(&mut self);
    fn get_parameters(&self) -> String;

    /// Build the preview channel; `with_display` selects window-backed buffers.
    fn prepare_preview(&mut self, with_display: bool) -> HalResult<()>;
    fn unprepare_preview(&mut self);
    fn start_preview(&mut self) -> HalResult<()>;
    fn stop_preview(&mut self) -> HalResult<()>;
    /// Stop and delete the preview and video channels, leaving capture running.
    fn drop_preview_channels(&mut self) -> HalResult<()>;

    fn store_metadata_in_buffers(&mut self, enable: bool) -> HalResult<()>;
    fn start_recording(&mut self) -> HalResult<()>;
    fn stop_recording(&mut self) -> HalResult<()>;
    fn release_recording_frame(&mut self, frame: &BufferBlock) -> HalResult<()>;

    fn auto_focus(&mut self) -> HalResult<()>;
    fn cancel_auto_focus(&mut self) -> HalResult<()>;

    fn take_picture(&mut self) -> HalResult<()>;
    fn cancel_picture(&mut self) -> HalResult<()>;
    fn take_live_snapshot(&mut self) -> HalResult<()>;
    fn cancel_live_snapshot(&mut self) -> HalResult<()>;

    fn send_command(&mut self, cmd: CameraCommand) -> HalResult<()>;
    /// Human-readable state for diagnostics
    fn dump(&self) -> String;
    fn release(&mut self) -> HalResult<()>;

    fn process_focus_update(&mut self, focused: bool) -> HalResult<()>;
    fn process_zoom_done(&mut self, zoom: u32) -> HalResult<()>;
    fn process_jpeg_notify(&mut self, evt: JpegEvent) -> HalResult<()>;
}
