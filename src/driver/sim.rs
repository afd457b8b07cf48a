//! Software camera driver.
//!
//! Each started channel gets one producer thread that fills queued buffers
//! with synthetic frames at the configured rate and services reprocess
//! requests. Buffer queueing, call history and fault injection are tracked
//! so tests can check ownership and sequencing.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use tracing::{debug, info, instrument, warn};

use super::{
    CameraEvent, CameraOps, CameraProvider, Capabilities, EventCallback, Facing, FrameCallback,
    StreamConfig, StreamingMode,
};
use crate::capture::frame::{
    BufDef, BufferReturn, Dimension, Handle, MetadataRecord, PixelFormat, StreamType, SuperBuf,
    FaceRect,
};
use crate::error::{HalError, HalResult};
use crate::utils::generate_handle;

/// Driver operations that can be made to fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    AddChannel,
    AddStream,
    ConfigStream,
    StartChannel,
    SetParms,
    AutoFocus,
    Reprocess,
}

/// Lifecycle calls recorded in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    StartChannel(Handle),
    StopChannel(Handle),
    SetParms(Vec<String>),
    AutoFocus,
    CancelAutoFocus,
    Reprocess(Handle),
}

enum WorkerCmd {
    Reprocess {
        stream: Handle,
        out_index: usize,
        input: BufDef,
    },
    Stop,
}

struct SimStream {
    config: Option<StreamConfig>,
    free: VecDeque<usize>,
    burst_left: Option<u32>,
}

struct ChannelWorker {
    tx: Sender<WorkerCmd>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SimChannel {
    streams: BTreeMap<Handle, SimStream>,
    worker: Option<ChannelWorker>,
    frame_idx: u64,
}

#[derive(Default)]
struct SimState {
    channels: HashMap<Handle, SimChannel>,
    event_cb: Option<EventCallback>,
    parms: BTreeMap<String, String>,
    focus_state: u8,
}

struct Delivery {
    cb: FrameCallback,
    buf: BufDef,
    format: PixelFormat,
}

pub struct SimDriver {
    me: Weak<SimDriver>,
    camera: Handle,
    caps: Capabilities,
    frame_interval: Duration,
    epoch: Instant,
    state: Mutex<SimState>,
    faults: Mutex<HashSet<Fault>>,
    calls: Mutex<Vec<DriverCall>>,
    qbuf_count: AtomicUsize,
    double_returns: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Sensor description used by the simulated cameras
pub fn default_capabilities(camera_id: u32) -> Capabilities {
    let back = camera_id == 0;
    Capabilities {
        camera_id,
        facing: if back { Facing::Back } else { Facing::Front },
        orientation: if back { 90 } else { 270 },
        preview_sizes: vec![
            Dimension::new(1280, 720),
            Dimension::new(640, 480),
            Dimension::new(320, 240),
        ],
        picture_sizes: vec![
            Dimension::new(1920, 1080),
            Dimension::new(1280, 720),
            Dimension::new(640, 480),
            Dimension::new(320, 240),
        ],
        video_sizes: vec![Dimension::new(1280, 720), Dimension::new(640, 480)],
        preview_formats: vec![PixelFormat::Nv21, PixelFormat::Nv12, PixelFormat::Yv12],
        max_zoom: 60,
        padding: 32,
        supports_zsl: true,
        supports_auto_focus: back,
        max_num_faces: 4,
    }
}

impl SimDriver {
    pub fn new(camera_id: u32, caps: Capabilities, fps: u32) -> Arc<Self> {
        let interval = Duration::from_micros(1_000_000 / u64::from(fps.max(1)));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            camera: generate_handle(camera_id as u8),
            caps,
            frame_interval: interval,
            epoch: Instant::now(),
            state: Mutex::new(SimState::default()),
            faults: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            qbuf_count: AtomicUsize::new(0),
            double_returns: AtomicUsize::new(0),
        })
    }

    pub fn inject(&self, fault: Fault) {
        lock(&self.faults).insert(fault);
    }

    pub fn clear_fault(&self, fault: Fault) {
        lock(&self.faults).remove(&fault);
    }

    fn check(&self, fault: Fault) -> HalResult<()> {
        if lock(&self.faults).contains(&fault) {
            return Err(HalError::Transport(format!("injected {fault:?} failure")));
        }
        Ok(())
    }

    fn record(&self, call: DriverCall) {
        lock(&self.calls).push(call);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn qbuf_count(&self) -> usize {
        self.qbuf_count.load(Ordering::SeqCst)
    }

    /// Buffers queued twice without being filled in between
    pub fn double_returns(&self) -> usize {
        self.double_returns.load(Ordering::SeqCst)
    }

    /// Registered buffers currently held outside the driver, across all streams
    pub fn outstanding(&self) -> usize {
        let state = lock(&self.state);
        state
            .channels
            .values()
            .flat_map(|c| c.streams.values())
            .filter_map(|s| s.config.as_ref().map(|cfg| (cfg, s)))
            .map(|(cfg, s)| {
                let registered = cfg.reg_flags.iter().filter(|r| **r).count();
                registered.saturating_sub(s.free.len())
            })
            .sum()
    }

    pub fn num_channels(&self) -> usize {
        lock(&self.state).channels.len()
    }

    pub fn parms(&self) -> BTreeMap<String, String> {
        lock(&self.state).parms.clone()
    }

    /// Raise a driver event as the hardware would.
    pub fn emit_event(&self, event: CameraEvent) {
        let cb = lock(&self.state).event_cb.clone();
        match cb {
            Some(cb) => cb(event),
            None => debug!(?event, "No event listener registered"),
        }
    }

    fn returner(&self) -> Option<Arc<dyn BufferReturn>> {
        self.me.upgrade().map(|d| d as Arc<dyn BufferReturn>)
    }

    fn spawn_worker(&self, channel: Handle) -> HalResult<ChannelWorker> {
        let (tx, rx) = unbounded();
        let me = self.me.clone();
        let interval = self.frame_interval;
        let handle = std::thread::Builder::new()
            .name(format!("sim-ch-{channel:x}"))
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Ok(WorkerCmd::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                    Ok(WorkerCmd::Reprocess {
                        stream,
                        out_index,
                        input,
                    }) => {
                        let Some(driver) = me.upgrade() else { break };
                        driver.finish_reprocess(channel, stream, out_index, &input);
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(driver) = me.upgrade() else { break };
                        driver.produce(channel);
                    }
                }
            })
            .map_err(|e| HalError::NoMemory(format!("spawn sim channel worker: {e}")))?;
        Ok(ChannelWorker { tx, handle })
    }

    /// One sensor tick: fill a free buffer on every producing stream.
    fn produce(&self, channel: Handle) {
        let (deliveries, record) = {
            let mut state = lock(&self.state);
            let faces = state.parms.get("face-detection").is_some_and(|v| v == "on");
            let histogram = state.parms.get("histogram").is_some_and(|v| v == "on");
            let focus_state = state.focus_state;
            let Some(chan) = state.channels.get_mut(&channel) else {
                return;
            };
            chan.frame_idx += 1;
            let frame_idx = chan.frame_idx;
            let timestamp = self.epoch.elapsed();
            let mut out = Vec::new();
            for s in chan.streams.values_mut() {
                let Some(cfg) = s.config.as_ref() else { continue };
                if cfg.stream_type == StreamType::Reprocess || s.burst_left == Some(0) {
                    continue;
                }
                let Some(index) = s.free.pop_front() else {
                    metrics::counter!("camhal_stream_frames_dropped_total").increment(1);
                    continue;
                };
                if let Some(left) = s.burst_left.as_mut() {
                    *left -= 1;
                }
                let mut buf = cfg.bufs[index].clone();
                buf.frame_idx = frame_idx;
                buf.timestamp = timestamp;
                out.push(Delivery {
                    cb: cfg.data_cb.clone(),
                    buf,
                    format: cfg.format,
                });
            }
            let record = MetadataRecord {
                frame_idx,
                focus_state,
                faces: if faces {
                    vec![FaceRect {
                        left: 100,
                        top: 80,
                        right: 220,
                        bottom: 230,
                        score: 95,
                    }]
                } else {
                    Vec::new()
                },
                histogram: if histogram { vec![1; 256] } else { Vec::new() },
            };
            (out, record)
        };

        let Some(returner) = self.returner() else { return };
        for d in deliveries {
            if d.buf.stream_type == StreamType::Metadata {
                d.buf.block.write_at(0, &record.encode());
            } else {
                fill_pattern(&d.buf, d.format);
            }
            let sb = SuperBuf::new(self.camera, channel, vec![d.buf], returner.clone());
            (d.cb)(sb);
        }
    }

    fn finish_reprocess(&self, channel: Handle, stream: Handle, out_index: usize, input: &BufDef) {
        let cfg = {
            let state = lock(&self.state);
            state
                .channels
                .get(&channel)
                .and_then(|c| c.streams.get(&stream))
                .and_then(|s| s.config.clone())
        };
        let (Some(cfg), Some(returner)) = (cfg, self.returner()) else {
            warn!(channel, stream, "Reprocess target vanished");
            return;
        };
        let mut out = cfg.bufs[out_index].clone();
        out.frame_idx = input.frame_idx;
        out.timestamp = input.timestamp;
        out.block.write_at(0, &input.data());
        (cfg.data_cb)(SuperBuf::new(self.camera, channel, vec![out], returner));
    }
}

/// Flat luma that changes with the frame counter, neutral chroma
fn fill_pattern(buf: &BufDef, format: PixelFormat) {
    let luma = 16 + (buf.frame_idx % 200) as u8;
    let Some(first) = buf.planes.first() else {
        return;
    };
    buf.block.write_at(first.offset, &vec![luma; first.len]);
    if matches!(format, PixelFormat::Rgb24 | PixelFormat::Raw8) {
        return;
    }
    for plane in &buf.planes[1..] {
        buf.block.write_at(plane.offset, &vec![128u8; plane.len]);
    }
}

impl BufferReturn for SimDriver {
    fn buf_done(&self, channel: Handle, buf: &BufDef) -> HalResult<()> {
        let mut state = lock(&self.state);
        let stream = state
            .channels
            .get_mut(&channel)
            .and_then(|c| c.streams.get_mut(&buf.stream))
            .ok_or_else(|| HalError::NotFound(format!("stream {:#x}", buf.stream)))?;
        self.qbuf_count.fetch_add(1, Ordering::SeqCst);
        if stream.free.contains(&buf.index) {
            self.double_returns.fetch_add(1, Ordering::SeqCst);
            warn!(stream = buf.stream, index = buf.index, "Buffer queued twice");
            return Ok(());
        }
        stream.free.push_back(buf.index);
        Ok(())
    }
}

impl CameraOps for SimDriver {
    fn camera_handle(&self) -> Handle {
        self.camera
    }

    fn query_capability(&self) -> HalResult<Capabilities> {
        Ok(self.caps.clone())
    }

    fn register_event_notify(&self, cb: EventCallback) -> HalResult<()> {
        lock(&self.state).event_cb = Some(cb);
        Ok(())
    }

    fn add_channel(&self) -> HalResult<Handle> {
        self.check(Fault::AddChannel)?;
        let mut state = lock(&self.state);
        let handle = generate_handle(state.channels.len() as u8);
        state.channels.insert(handle, SimChannel::default());
        Ok(handle)
    }

    fn delete_channel(&self, channel: Handle) -> HalResult<()> {
        let mut state = lock(&self.state);
        match state.channels.get(&channel) {
            None => Err(HalError::NotFound(format!("channel {channel:#x}"))),
            Some(c) if c.worker.is_some() => Err(HalError::InvalidOperation(
                "channel must be stopped before it is deleted".into(),
            )),
            Some(_) => {
                state.channels.remove(&channel);
                Ok(())
            }
        }
    }

    fn add_stream(&self, channel: Handle) -> HalResult<Handle> {
        self.check(Fault::AddStream)?;
        let mut state = lock(&self.state);
        let chan = state
            .channels
            .get_mut(&channel)
            .ok_or_else(|| HalError::NotFound(format!("channel {channel:#x}")))?;
        let handle = generate_handle(chan.streams.len() as u8);
        chan.streams.insert(
            handle,
            SimStream {
                config: None,
                free: VecDeque::new(),
                burst_left: None,
            },
        );
        Ok(handle)
    }

    fn delete_stream(&self, channel: Handle, stream: Handle) -> HalResult<()> {
        let mut state = lock(&self.state);
        let chan = state
            .channels
            .get_mut(&channel)
            .ok_or_else(|| HalError::NotFound(format!("channel {channel:#x}")))?;
        if chan.worker.is_some() {
            return Err(HalError::InvalidOperation(
                "cannot delete a stream of a running channel".into(),
            ));
        }
        chan.streams
            .remove(&stream)
            .map(|_| ())
            .ok_or_else(|| HalError::NotFound(format!("stream {stream:#x}")))
    }

    fn config_stream(&self, channel: Handle, stream: Handle, config: StreamConfig) -> HalResult<()> {
        self.check(Fault::ConfigStream)?;
        if config.reg_flags.len() != config.bufs.len() {
            return Err(HalError::InvalidArgument(
                "one registration flag per buffer".into(),
            ));
        }
        let mut state = lock(&self.state);
        let s = state
            .channels
            .get_mut(&channel)
            .and_then(|c| c.streams.get_mut(&stream))
            .ok_or_else(|| HalError::NotFound(format!("stream {stream:#x}")))?;
        s.free = config
            .reg_flags
            .iter()
            .enumerate()
            .filter(|(_, r)| **r)
            .map(|(i, _)| i)
            .collect();
        s.config = Some(config);
        Ok(())
    }

    #[instrument(skip(self))]
    fn start_channel(&self, channel: Handle) -> HalResult<()> {
        self.check(Fault::StartChannel)?;
        let mut state = lock(&self.state);
        let chan = state
            .channels
            .get_mut(&channel)
            .ok_or_else(|| HalError::NotFound(format!("channel {channel:#x}")))?;
        if chan.worker.is_some() {
            return Ok(());
        }
        for s in chan.streams.values_mut() {
            s.burst_left = match s.config.as_ref().map(|c| c.mode) {
                Some(StreamingMode::Burst(n)) => Some(n),
                _ => None,
            };
        }
        chan.worker = Some(self.spawn_worker(channel)?);
        drop(state);
        self.record(DriverCall::StartChannel(channel));
        info!(channel, "Sim channel started");
        Ok(())
    }

    #[instrument(skip(self))]
    fn stop_channel(&self, channel: Handle) -> HalResult<()> {
        let worker = {
            let mut state = lock(&self.state);
            let chan = state
                .channels
                .get_mut(&channel)
                .ok_or_else(|| HalError::NotFound(format!("channel {channel:#x}")))?;
            chan.worker.take()
        };
        let Some(worker) = worker else {
            return Ok(());
        };
        let _ = worker.tx.send(WorkerCmd::Stop);
        if worker.handle.join().is_err() {
            warn!(channel, "Sim channel worker panicked");
        }
        self.record(DriverCall::StopChannel(channel));
        info!(channel, "Sim channel stopped");
        Ok(())
    }

    fn set_parms(&self, parms: &BTreeMap<String, String>) -> HalResult<()> {
        self.check(Fault::SetParms)?;
        self.record(DriverCall::SetParms(parms.keys().cloned().collect()));
        let zoom = {
            let mut state = lock(&self.state);
            let before = state.parms.get("zoom").cloned();
            state
                .parms
                .extend(parms.iter().map(|(k, v)| (k.clone(), v.clone())));
            let after = state.parms.get("zoom").cloned();
            if after != before {
                after.and_then(|z| z.parse::<u32>().ok())
            } else {
                None
            }
        };
        if let Some(zoom) = zoom {
            self.emit_event(CameraEvent::ZoomDone { zoom });
        }
        Ok(())
    }

    fn do_auto_focus(&self) -> HalResult<()> {
        self.check(Fault::AutoFocus)?;
        self.record(DriverCall::AutoFocus);
        lock(&self.state).focus_state = 2;
        self.emit_event(CameraEvent::AutoFocusDone { focused: true });
        Ok(())
    }

    fn cancel_auto_focus(&self) -> HalResult<()> {
        self.record(DriverCall::CancelAutoFocus);
        lock(&self.state).focus_state = 0;
        Ok(())
    }

    fn do_reprocess(&self, channel: Handle, stream: Handle, input: &BufDef) -> HalResult<()> {
        self.check(Fault::Reprocess)?;
        let mut state = lock(&self.state);
        let chan = state
            .channels
            .get_mut(&channel)
            .ok_or_else(|| HalError::NotFound(format!("channel {channel:#x}")))?;
        let tx = chan
            .worker
            .as_ref()
            .map(|w| w.tx.clone())
            .ok_or_else(|| HalError::InvalidOperation("reprocess channel not started".into()))?;
        let out_index = chan
            .streams
            .get_mut(&stream)
            .ok_or_else(|| HalError::NotFound(format!("stream {stream:#x}")))?
            .free
            .pop_front()
            .ok_or_else(|| HalError::NoMemory("no free reprocess buffer".into()))?;
        drop(state);
        self.record(DriverCall::Reprocess(stream));
        tx.send(WorkerCmd::Reprocess {
            stream,
            out_index,
            input: input.clone(),
        })
        .map_err(|_| HalError::Shutdown)
    }

    fn close(&self) -> HalResult<()> {
        let channels: Vec<Handle> = lock(&self.state).channels.keys().copied().collect();
        for ch in channels {
            self.stop_channel(ch)?;
        }
        let mut state = lock(&self.state);
        state.channels.clear();
        state.event_cb = None;
        Ok(())
    }
}

/// Provider of simulated cameras
pub struct SimProvider {
    num_cameras: usize,
    fps: u32,
    opened: Mutex<HashMap<u32, Arc<SimDriver>>>,
}

impl SimProvider {
    pub fn new(num_cameras: usize, fps: u32) -> Self {
        Self {
            num_cameras,
            fps,
            opened: Mutex::new(HashMap::new()),
        }
    }

    /// Driver behind an opened camera, for fault injection.
    pub fn driver(&self, camera_id: u32) -> Option<Arc<SimDriver>> {
        lock(&self.opened).get(&camera_id).cloned()
    }
}

impl CameraProvider for SimProvider {
    fn num_cameras(&self) -> usize {
        self.num_cameras
    }

    fn capabilities(&self, camera_id: u32) -> HalResult<Capabilities> {
        if camera_id as usize >= self.num_cameras {
            return Err(HalError::OutOfRange {
                index: camera_id as usize,
                len: self.num_cameras,
            });
        }
        Ok(default_capabilities(camera_id))
    }

    fn open(&self, camera_id: u32) -> HalResult<Arc<dyn CameraOps>> {
        let caps = self.capabilities(camera_id)?;
        let driver = SimDriver::new(camera_id, caps, self.fps);
        lock(&self.opened).insert(camera_id, driver.clone());
        Ok(driver)
    }
}
