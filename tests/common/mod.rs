//! Shared rig for the integration tests: a simulated camera with a recording sink.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use camhal::callbacks::{CameraCallbacks, FrameFaces, MsgType};
use camhal::driver::{CameraProvider, SimDriver, SimProvider};
use camhal::mem::BufferBlock;
use camhal::state_machine::State;
use camhal::{Camera, HalConfig};
use flume::{Receiver, Sender};

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Cb {
    Notify(MsgType, i32),
    Data(MsgType, Bytes),
    Video(BufferBlock),
}

struct Sink(Sender<Cb>);

impl CameraCallbacks for Sink {
    fn notify(&self, msg: MsgType, ext1: i32, _ext2: i32) {
        let _ = self.0.send(Cb::Notify(msg, ext1));
    }

    fn data(&self, msg: MsgType, data: Bytes, _index: u32, _metadata: Option<&FrameFaces>) {
        let _ = self.0.send(Cb::Data(msg, data));
    }

    fn data_timestamp(&self, _ts: Duration, _msg: MsgType, frame: &BufferBlock, _index: u32) {
        let _ = self.0.send(Cb::Video(frame.clone()));
    }
}

pub struct Rig {
    pub cam: Camera,
    pub driver: Arc<SimDriver>,
    pub cbs: Receiver<Cb>,
    pub states: Receiver<State>,
}

pub fn rig_with(config: HalConfig) -> Rig {
    let provider = SimProvider::new(1, 60);
    let ops = provider.open(0).unwrap();
    let driver = provider.driver(0).unwrap();
    let cam = Camera::open(0, ops, &config).unwrap();
    let (tx, cbs) = flume::unbounded();
    cam.set_callbacks(Some(Arc::new(Sink(tx)))).unwrap();
    let states = cam.watch_states();
    Rig {
        cam,
        driver,
        cbs,
        states,
    }
}

pub fn rig() -> Rig {
    rig_with(HalConfig::default())
}

impl Rig {
    /// Next callback matching `f`, skipping the rest.
    pub fn wait_for<T>(&self, mut f: impl FnMut(Cb) -> Option<T>) -> T {
        let deadline = Instant::now() + WAIT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let cb = self.cbs.recv_timeout(left).expect("callback did not arrive");
            if let Some(v) = f(cb) {
                return v;
            }
        }
    }

    pub fn wait_jpeg(&self) -> Bytes {
        self.wait_for(|cb| match cb {
            Cb::Data(MsgType::COMPRESSED_IMAGE, data) => Some(data),
            _ => None,
        })
    }

    /// Block until the camera enters `want`.
    pub fn wait_state(&self, want: State) {
        loop {
            if self.states.recv_timeout(WAIT).expect("state not reached") == want {
                return;
            }
        }
    }

    /// Forget transitions seen so far.
    pub fn clear_states(&self) {
        self.states.try_iter().for_each(drop);
    }

    /// Every driver buffer is back and none came back twice.
    pub fn assert_buffers_balanced(&self) {
        assert_eq!(self.driver.outstanding(), 0, "buffers still out");
        assert_eq!(self.driver.double_returns(), 0, "buffers returned twice");
    }
}
