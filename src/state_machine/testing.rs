//! Recording mock of [`CameraControl`] for state machine tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flume::{Receiver, Sender};

use super::command::CameraCommand;
use super::control::CameraControl;
use crate::callbacks::{CameraCallbacks, MsgType};
use crate::display::PreviewWindow;
use crate::error::{HalError, HalResult};
use crate::mem::BufferBlock;
use crate::postproc::JpegEvent;

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
    hold_dump: AtomicBool,
    parked: Option<(Sender<()>, Receiver<()>)>,
    release: Option<(Sender<()>, Receiver<()>)>,
}

pub struct MockControl {
    shared: Arc<Shared>,
    window: bool,
    msgs: MsgType,
}

/// Test-side view of a [`MockControl`] moved into the worker
#[derive(Clone)]
pub struct Probe(Arc<Shared>);

impl MockControl {
    pub fn new() -> (Self, Probe) {
        let shared = Arc::new(Shared {
            parked: Some(flume::unbounded()),
            release: Some(flume::unbounded()),
            ..Default::default()
        });
        (
            Self {
                shared: shared.clone(),
                window: false,
                msgs: MsgType(0),
            },
            Probe(shared),
        )
    }

    fn call(&self, name: &'static str) -> HalResult<()> {
        self.shared.calls.lock().unwrap().push(name.to_string());
        if self.shared.failing.lock().unwrap().contains(name) {
            return Err(HalError::Transport(format!("{name} failed")));
        }
        Ok(())
    }
}

impl Probe {
    pub fn calls(&self) -> Vec<String> {
        self.0.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.calls.lock().unwrap().clear();
    }

    pub fn fail(&self, name: &'static str) {
        self.0.failing.lock().unwrap().insert(name);
    }

    pub fn heal(&self, name: &'static str) {
        self.0.failing.lock().unwrap().remove(name);
    }

    pub fn hold_dump(&self) {
        self.0.hold_dump.store(true, Ordering::SeqCst);
    }

    pub fn wait_parked(&self) {
        let (_, rx) = self.0.parked.as_ref().unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    pub fn release_dump(&self) {
        let (tx, _) = self.0.release.as_ref().unwrap();
        tx.send(()).unwrap();
    }
}

impl CameraControl for MockControl {
    fn set_preview_window(&mut self, window: Option<Arc<dyn PreviewWindow>>) -> HalResult<()> {
        self.call("set_preview_window")?;
        self.window = window.is_some();
        Ok(())
    }

    fn has_preview_window(&self) -> bool {
        self.window
    }

    fn set_callbacks(&mut self, _callbacks: Option<Arc<dyn CameraCallbacks>>) -> HalResult<()> {
        self.call("set_callbacks")
    }

    fn enable_msg_type(&mut self, msg: MsgType) -> HalResult<()> {
        self.msgs = self.msgs | msg;
        Ok(())
    }

    fn disable_msg_type(&mut self, msg: MsgType) -> HalResult<()> {
        self.msgs = MsgType(self.msgs.0 & !msg.0);
        Ok(())
    }

    fn msg_type_enabled(&self, msg: MsgType) -> bool {
        self.msgs.intersects(msg)
    }

    /// Anything naming `preview-size` needs a restart.
    fn update_parameters(&mut self, params: &str) -> HalResult<bool> {
        self.call("update_parameters")?;
        Ok(params.contains("preview-size"))
    }

    fn commit_parameters(&mut self) -> HalResult<()> {
        self.call("commit_parameters")
    }

    fn discard_parameters(&mut self) {
        let _ = self.call("discard_parameters");
    }

    fn get_parameters(&self) -> String {
        let _ = self.call("get_parameters");
        "preview-size=640x480".into()
    }

    fn prepare_preview(&mut self, _display: bool) -> HalResult<()> {
        self.call("prepare_preview")
    }

    fn unprepare_preview(&mut self) {
        let _ = self.call("unprepare_preview");
    }

    fn start_preview(&mut self) -> HalResult<()> {
        self.call("start_preview")
    }

    fn stop_preview(&mut self) -> HalResult<()> {
        self.call("stop_preview")
    }

    fn drop_preview_channels(&mut self) -> HalResult<()> {
        self.call("drop_preview_channels")
    }

    fn store_metadata_in_buffers(&mut self, _enable: bool) -> HalResult<()> {
        self.call("store_metadata_in_buffers")
    }

    fn start_recording(&mut self) -> HalResult<()> {
        self.call("start_recording")
    }

    fn stop_recording(&mut self) -> HalResult<()> {
        self.call("stop_recording")
    }

    fn release_recording_frame(&mut self, _frame: &BufferBlock) -> HalResult<()> {
        self.call("release_recording_frame")
    }

    fn auto_focus(&mut self) -> HalResult<()> {
        self.call("auto_focus")
    }

    fn cancel_auto_focus(&mut self) -> HalResult<()> {
        self.call("cancel_auto_focus")
    }

    fn take_picture(&mut self) -> HalResult<()> {
        self.call("take_picture")
    }

    fn cancel_picture(&mut self) -> HalResult<()> {
        self.call("cancel_picture")
    }

    fn take_live_snapshot(&mut self) -> HalResult<()> {
        self.call("take_live_snapshot")
    }

    fn cancel_live_snapshot(&mut self) -> HalResult<()> {
        self.call("cancel_live_snapshot")
    }

    fn send_command(&mut self, _cmd: CameraCommand) -> HalResult<()> {
        self.call("send_command")
    }

    fn dump(&self) -> String {
        let _ = self.call("dump");
        if self.shared.hold_dump.swap(false, Ordering::SeqCst) {
            let (tx, _) = self.shared.parked.as_ref().unwrap();
            tx.send(()).unwrap();
            let (_, rx) = self.shared.release.as_ref().unwrap();
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        "mock".into()
    }

    fn release(&mut self) -> HalResult<()> {
        self.call("release")
    }

    fn process_focus_update(&mut self, _focused: bool) -> HalResult<()> {
        self.call("process_focus_update")
    }

    fn process_zoom_done(&mut self, _zoom: u32) -> HalResult<()> {
        self.call("process_zoom_done")
    }

    fn process_jpeg_notify(&mut self, _evt: JpegEvent) -> HalResult<()> {
        self.call("process_jpeg_notify")
    }
}
