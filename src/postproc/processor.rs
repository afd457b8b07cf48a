//! Reprocess, encode and notify stages for captured frames.
//!
//! Frames enter through [`PostProcessor::process_data`]. The data-proc worker
//! either sends them through the reprocess channel or straight to the encoder;
//! encode completions come back through the state machine as JPEG events and
//! are delivered by the data-notify worker. Every frame accepted here goes back
//! to the driver exactly once, whatever the outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::{debug, error, info, instrument, warn};

use super::jpeg::{EncodeJob, JobId, JpegCallback, JpegEngine, JpegEvent, JpegStatus, SourceImage};
use crate::callbacks::{FrameFaces, MsgType, ERROR_UNKNOWN};
use crate::capture::frame::{BufDef, Dimension, FrameLenOffset, Handle, PixelFormat, StreamType, SuperBuf};
use crate::error::{HalError, HalResult};
use crate::mem::{CameraMemory, HeapMemory};
use crate::pipeline::{CmdKind, CmdThread, CmdWaker, CommandQueue};

/// Encoder settings in force when a job is queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeSettings {
    pub quality: u8,
    pub thumbnail_quality: u8,
    pub rotation: u32,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            quality: 85,
            thumbnail_quality: 75,
            rotation: 0,
        }
    }
}

/// Geometry of the stream a buffer came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamShape {
    pub dim: Dimension,
    pub format: PixelFormat,
    pub layout: FrameLenOffset,
}

/// What the post-processor needs from the camera that owns it
pub trait PostProcHost: Send + Sync {
    /// Route frames through the reprocess channel before encode.
    fn need_reprocess(&self) -> bool;

    /// Feed `frame` into the reprocess channel; the output arrives via `process_pp_data`.
    fn reprocess(&self, frame: &SuperBuf) -> HalResult<()>;

    fn encode_settings(&self) -> EncodeSettings;

    fn stream_shape(&self, stream: Handle) -> Option<StreamShape>;

    /// Encode completions; the host routes them back into `process_jpeg_evt`.
    fn jpeg_done(&self, evt: JpegEvent);

    fn send_data(&self, msg: MsgType, data: Bytes, index: u32, metadata: Option<&FrameFaces>);

    fn send_notify(&self, msg: MsgType, ext1: i32, ext2: i32);
}

/// A frame waiting for its reprocessed copy
struct PpJob {
    src: SuperBuf,
}

/// A frame being encoded; `out` holds the engine's output until it is delivered
struct JpegJob {
    job_id: JobId,
    src: SuperBuf,
    out: HeapMemory,
}

/// One application data callback waiting for the notify worker
struct DataNotify {
    msg: MsgType,
    data: Bytes,
    index: u32,
    metadata: Option<FrameFaces>,
    /// Released after the callback returns
    jpeg_mem: Option<HeapMemory>,
    frame: Option<SuperBuf>,
}

impl DataNotify {
    fn finish(mut self) {
        if let Some(mut mem) = self.jpeg_mem.take() {
            mem.deallocate();
        }
        if let Some(frame) = self.frame.take() {
            if let Err(e) = frame.release() {
                warn!("Returning delivered frame failed: {}", e);
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

struct Inner {
    host: Arc<dyn PostProcHost>,
    engine: Arc<dyn JpegEngine>,
    input_pp: CommandQueue<SuperBuf>,
    ongoing_pp: CommandQueue<PpJob>,
    input_jpeg: CommandQueue<SuperBuf>,
    ongoing_jpeg: CommandQueue<JpegJob>,
    data_notify: CommandQueue<DataNotify>,
    active: AtomicBool,
    // held by a worker for the length of one job so stop can wait it out
    proc_busy: Mutex<()>,
    notify_busy: Mutex<()>,
    // held across engine submission and event lookup
    jpeg_lock: Mutex<()>,
    pp_lock: Mutex<()>,
    proc_waker: Mutex<Option<CmdWaker>>,
    notify_waker: Mutex<Option<CmdWaker>>,
}

pub struct PostProcessor {
    inner: Arc<Inner>,
    data_proc: Mutex<Option<CmdThread>>,
    data_notify: Mutex<Option<CmdThread>>,
}

impl PostProcessor {
    pub fn new(host: Arc<dyn PostProcHost>, engine: Arc<dyn JpegEngine>) -> Self {
        Self {
            inner: Arc::new(Inner {
                host,
                engine,
                input_pp: CommandQueue::new(),
                ongoing_pp: CommandQueue::new(),
                input_jpeg: CommandQueue::new(),
                ongoing_jpeg: CommandQueue::new(),
                data_notify: CommandQueue::new(),
                active: AtomicBool::new(false),
                proc_busy: Mutex::new(()),
                notify_busy: Mutex::new(()),
                jpeg_lock: Mutex::new(()),
                pp_lock: Mutex::new(()),
                proc_waker: Mutex::new(None),
                notify_waker: Mutex::new(None),
            }),
            data_proc: Mutex::new(None),
            data_notify: Mutex::new(None),
        }
    }

    /// Launch both workers. Calling it twice is harmless.
    pub fn init(&self) -> HalResult<()> {
        let mut proc = lock(&self.data_proc);
        let mut notify = lock(&self.data_notify);
        if proc.is_some() {
            return Ok(());
        }

        let inner = self.inner.clone();
        let proc_thread = CmdThread::launch("pp-data-proc", move |cmd| {
            if cmd == CmdKind::DoNextJob {
                inner.data_proc_job();
            }
        })?;
        let inner = self.inner.clone();
        let notify_thread = CmdThread::launch("pp-data-notify", move |cmd| {
            if cmd == CmdKind::DoNextJob {
                inner.data_notify_job();
            }
        })?;

        *lock(&self.inner.proc_waker) = Some(proc_thread.waker());
        *lock(&self.inner.notify_waker) = Some(notify_thread.waker());
        *proc = Some(proc_thread);
        *notify = Some(notify_thread);
        debug!("Post-processor initialized");
        Ok(())
    }

    /// Stop, then join both workers.
    pub fn deinit(&self) {
        self.stop();
        lock(&self.inner.proc_waker).take();
        lock(&self.inner.notify_waker).take();
        if let Some(mut t) = lock(&self.data_proc).take() {
            t.exit();
        }
        if let Some(mut t) = lock(&self.data_notify).take() {
            t.exit();
        }
        debug!("Post-processor deinitialized");
    }

    pub fn start(&self) -> HalResult<()> {
        if lock(&self.data_proc).is_none() {
            return Err(HalError::InvalidOperation("post-processor not initialized".into()));
        }
        self.inner.active.store(true, Ordering::SeqCst);
        info!("Post-processor started");
        Ok(())
    }

    /// Drop every queued and in-flight job, releasing its frames and memory.
    #[instrument(skip(self))]
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.active.store(false, Ordering::SeqCst);
        // wait out jobs the workers are in the middle of
        let _proc = lock(&inner.proc_busy);
        let _notify = lock(&inner.notify_busy);

        let input_pp = inner.input_pp.flush();
        let ongoing_pp = {
            let _g = lock(&inner.pp_lock);
            inner.ongoing_pp.flush()
        };
        let input_jpeg = inner.input_jpeg.flush();
        let ongoing_jpeg = {
            let _g = lock(&inner.jpeg_lock);
            inner.ongoing_jpeg.flush()
        };
        let notify = inner.data_notify.flush();

        let released = input_pp.len() + ongoing_pp.len() + input_jpeg.len() + ongoing_jpeg.len();
        drop(input_pp);
        drop(ongoing_pp);
        drop(input_jpeg);
        for job in ongoing_jpeg {
            if let Err(e) = inner.engine.abort_job(job.job_id) {
                warn!(job_id = job.job_id, "Abort failed: {}", e);
            }
            inner.release_jpeg_job(job);
        }
        notify.into_iter().for_each(DataNotify::finish);
        if released > 0 {
            debug!(released, "Released pending post-process jobs");
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Accept a captured frame. The frame is released here if it cannot be queued.
    pub fn process_data(&self, frame: SuperBuf) -> HalResult<()> {
        let inner = &self.inner;
        if !inner.is_active() {
            drop(frame);
            return Err(HalError::InvalidOperation("post-processor not started".into()));
        }
        if inner.host.need_reprocess() {
            inner.input_pp.enqueue(frame);
        } else {
            inner.input_jpeg.enqueue(frame);
        }
        inner.wake_proc();
        Ok(())
    }

    /// Accept the reprocessed copy of a frame sent through the reprocess channel.
    pub fn process_pp_data(&self, frame: SuperBuf) -> HalResult<()> {
        let inner = &self.inner;
        if !inner.is_active() {
            drop(frame);
            return Err(HalError::InvalidOperation("post-processor not started".into()));
        }
        let idx = frame.frame_idx();
        let job = {
            let _g = lock(&inner.pp_lock);
            inner.ongoing_pp.remove_first(|j| j.src.frame_idx() == idx)
        };
        let Some(job) = job else {
            error!(frame_idx = idx, "Reprocessed frame without a pending job");
            drop(frame);
            return Err(HalError::NotFound(format!("reprocess job for frame {}", idx)));
        };
        if let Err(e) = job.src.release() {
            warn!("Returning reprocess source failed: {}", e);
        }
        inner.input_jpeg.enqueue(frame);
        inner.wake_proc();
        Ok(())
    }

    /// Match an encode completion to its job and queue the application callback.
    pub fn process_jpeg_evt(&self, evt: JpegEvent) -> HalResult<()> {
        let inner = &self.inner;
        let job = {
            let _g = lock(&inner.jpeg_lock);
            inner.ongoing_jpeg.remove_first(|j| j.job_id == evt.job_id)
        };
        let Some(job) = job else {
            error!(job_id = evt.job_id, "No ongoing job for encode event");
            return Err(HalError::NotFound(format!("jpeg job {}", evt.job_id)));
        };

        if evt.status == JpegStatus::Error {
            error!(job_id = evt.job_id, "Encode failed");
            inner.release_jpeg_job(job);
            inner.host.send_notify(MsgType::ERROR, ERROR_UNKNOWN, 0);
            return Err(HalError::Transport(format!("jpeg job {} failed", evt.job_id)));
        }
        if evt.thumbnail_dropped {
            warn!(job_id = evt.job_id, "Thumbnail dropped");
        }

        let JpegJob { job_id, src, out } = job;
        let data = evt.output.read(0, evt.size);
        if let Err(e) = src.release() {
            warn!(job_id, "Returning encoded frame failed: {}", e);
        }
        inner.data_notify.enqueue(DataNotify {
            msg: MsgType::COMPRESSED_IMAGE,
            data,
            index: 0,
            metadata: None,
            jpeg_mem: Some(out),
            frame: None,
        });
        inner.wake_notify();
        Ok(())
    }

    /// Jobs in each of input-pp, ongoing-pp, input-jpeg and ongoing-jpeg.
    pub fn queue_depths(&self) -> [usize; 4] {
        let i = &self.inner;
        [
            i.input_pp.len(),
            i.ongoing_pp.len(),
            i.input_jpeg.len(),
            i.ongoing_jpeg.len(),
        ]
    }
}

impl Drop for PostProcessor {
    fn drop(&mut self) {
        self.deinit();
    }
}

impl Inner {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn wake_proc(&self) {
        if let Some(w) = lock(&self.proc_waker).as_ref() {
            let _ = w.send(CmdKind::DoNextJob);
        }
    }

    fn wake_notify(&self) {
        if let Some(w) = lock(&self.notify_waker).as_ref() {
            let _ = w.send(CmdKind::DoNextJob);
        }
    }

    fn release_jpeg_job(&self, job: JpegJob) {
        let JpegJob { job_id, src, mut out } = job;
        out.deallocate();
        if let Err(e) = src.release() {
            warn!(job_id, "Returning aborted frame failed: {}", e);
        }
    }

    fn data_proc_job(&self) {
        let _busy = lock(&self.proc_busy);
        if !self.is_active() {
            return;
        }
        if let Some(frame) = self.input_jpeg.dequeue() {
            self.encode(frame);
        }
        if let Some(frame) = self.input_pp.dequeue() {
            self.reprocess(frame);
        }
    }

    fn data_notify_job(&self) {
        let _busy = lock(&self.notify_busy);
        if !self.is_active() {
            return;
        }
        let Some(n) = self.data_notify.dequeue() else {
            return;
        };
        self.host.send_data(n.msg, n.data.clone(), n.index, n.metadata.as_ref());
        n.finish();
    }

    fn reprocess(&self, frame: SuperBuf) {
        let _g = lock(&self.pp_lock);
        if let Err(e) = self.host.reprocess(&frame) {
            error!(frame_idx = frame.frame_idx(), "Reprocess failed: {}", e);
            drop(frame);
            self.host.send_notify(MsgType::ERROR, ERROR_UNKNOWN, 0);
            return;
        }
        self.ongoing_pp.enqueue(PpJob { src: frame });
    }

    fn source_image(&self, buf: &BufDef) -> HalResult<SourceImage> {
        let shape = self
            .host
            .stream_shape(buf.stream)
            .ok_or_else(|| HalError::NotFound(format!("stream {:#x}", buf.stream)))?;
        Ok(SourceImage {
            data: buf.data(),
            dim: shape.dim,
            format: shape.format,
            layout: shape.layout,
        })
    }

    fn encode(&self, frame: SuperBuf) {
        // raw captures skip the encoder
        if let Some(raw) = frame.find(StreamType::Raw) {
            let data = raw.data();
            let index = raw.index as u32;
            self.data_notify.enqueue(DataNotify {
                msg: MsgType::RAW_IMAGE,
                data,
                index,
                metadata: None,
                jpeg_mem: None,
                frame: Some(frame),
            });
            self.wake_notify();
            return;
        }

        if let Err(e) = self.start_encode(frame) {
            error!("Encode job not started: {}", e);
            self.host.send_notify(MsgType::ERROR, ERROR_UNKNOWN, 0);
        }
    }

    /// Build and submit the engine job. `frame` is released on every error path.
    fn start_encode(&self, frame: SuperBuf) -> HalResult<()> {
        let main_buf = frame
            .find(StreamType::Snapshot)
            .or_else(|| frame.find(StreamType::Reprocess))
            .or_else(|| frame.bufs().first())
            .ok_or_else(|| HalError::InvalidArgument("empty frame".into()))?;
        let main = self.source_image(main_buf)?;
        let thumbnail = match frame.find(StreamType::Postview) {
            Some(b) => Some(self.source_image(b)?),
            None => None,
        };

        let mut out = HeapMemory::default();
        out.allocate(1, main_buf.frame_len.max(1))?;
        let dst = match out.block(0) {
            Ok(b) => b,
            Err(e) => {
                out.deallocate();
                return Err(e);
            }
        };
        let settings = self.host.encode_settings();
        let job = EncodeJob {
            main,
            thumbnail,
            quality: settings.quality,
            thumbnail_quality: settings.thumbnail_quality,
            rotation: settings.rotation,
            dst,
        };

        let host = self.host.clone();
        let cb: JpegCallback = Arc::new(move |evt| host.jpeg_done(evt));
        let _g = lock(&self.jpeg_lock);
        match self.engine.start_job(job, cb) {
            Ok(job_id) => {
                debug!(job_id, frame_idx = frame.frame_idx(), "Encode job started");
                self.ongoing_jpeg.enqueue(JpegJob {
                    job_id,
                    src: frame,
                    out,
                });
                Ok(())
            }
            Err(e) => {
                out.deallocate();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use flume::{Receiver, Sender};

    use super::*;
    use crate::capture::frame::BufferReturn;
    use crate::mem::{AnonBackend, MemoryBackend};

    /// Counts returns per (stream, index); a second return of the same buffer is a bug.
    #[derive(Default)]
    struct Returns(Mutex<HashMap<(Handle, usize), u32>>);

    impl BufferReturn for Returns {
        fn buf_done(&self, _channel: Handle, buf: &BufDef) -> HalResult<()> {
            *lock(&self.0).entry((buf.stream, buf.index)).or_default() += 1;
            Ok(())
        }
    }

    impl Returns {
        fn count(&self, stream: Handle, index: usize) -> u32 {
            lock(&self.0).get(&(stream, index)).copied().unwrap_or(0)
        }
    }

    const SNAP: Handle = 0x101;
    const RAW: Handle = 0x102;
    const DIM: Dimension = Dimension::new(16, 8);

    #[derive(Debug)]
    enum Seen {
        Data(MsgType, usize),
        Notify(MsgType),
    }

    struct Host {
        reprocess: bool,
        fail_reprocess: bool,
        events: Sender<JpegEvent>,
        seen: Sender<Seen>,
        reprocessed: Sender<u64>,
    }

    impl PostProcHost for Host {
        fn need_reprocess(&self) -> bool {
            self.reprocess
        }

        fn reprocess(&self, frame: &SuperBuf) -> HalResult<()> {
            if self.fail_reprocess {
                return Err(HalError::Transport("reprocess rejected".into()));
            }
            let _ = self.reprocessed.send(frame.frame_idx());
            Ok(())
        }

        fn encode_settings(&self) -> EncodeSettings {
            EncodeSettings::default()
        }

        fn stream_shape(&self, _stream: Handle) -> Option<StreamShape> {
            Some(StreamShape {
                dim: DIM,
                format: PixelFormat::Nv21,
                layout: FrameLenOffset::compute(DIM, PixelFormat::Nv21, 1),
            })
        }

        fn jpeg_done(&self, evt: JpegEvent) {
            let _ = self.events.send(evt);
        }

        fn send_data(&self, msg: MsgType, data: Bytes, _index: u32, _m: Option<&FrameFaces>) {
            let _ = self.seen.send(Seen::Data(msg, data.len()));
        }

        fn send_notify(&self, msg: MsgType, _ext1: i32, _ext2: i32) {
            let _ = self.seen.send(Seen::Notify(msg));
        }
    }

    /// Completes jobs only when told to, optionally with an error.
    struct ScriptedEngine {
        next: Mutex<JobId>,
        jobs: Mutex<Vec<(JobId, EncodeJob, JpegCallback)>>,
        aborted: Mutex<Vec<JobId>>,
        refuse: AtomicBool,
        started: Sender<JobId>,
    }

    impl JpegEngine for ScriptedEngine {
        fn start_job(&self, job: EncodeJob, cb: JpegCallback) -> HalResult<JobId> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(HalError::NoMemory("engine full".into()));
            }
            let mut next = lock(&self.next);
            *next += 1;
            lock(&self.jobs).push((*next, job, cb));
            let _ = self.started.send(*next);
            Ok(*next)
        }

        fn abort_job(&self, job_id: JobId) -> HalResult<()> {
            lock(&self.aborted).push(job_id);
            Ok(())
        }
    }

    impl ScriptedEngine {
        fn complete(&self, status: JpegStatus) {
            let Some((job_id, job, cb)) = lock(&self.jobs).pop() else {
                panic!("no job to complete");
            };
            let size = job.dst.write_at(0, &[0xFF, 0xD8, 0xFF, 0xD9]);
            cb(JpegEvent {
                job_id,
                status,
                thumbnail_dropped: false,
                output: job.dst,
                size,
            });
        }
    }

    struct Rig {
        pp: PostProcessor,
        engine: Arc<ScriptedEngine>,
        returns: Arc<Returns>,
        events: Receiver<JpegEvent>,
        seen: Receiver<Seen>,
        started: Receiver<JobId>,
        reprocessed: Receiver<u64>,
    }

    fn rig(reprocess: bool, fail_reprocess: bool) -> Rig {
        let (etx, events) = flume::unbounded();
        let (stx, seen) = flume::unbounded();
        let (rtx, reprocessed) = flume::unbounded();
        let (jtx, started) = flume::unbounded();
        let host = Arc::new(Host {
            reprocess,
            fail_reprocess,
            events: etx,
            seen: stx,
            reprocessed: rtx,
        });
        let engine = Arc::new(ScriptedEngine {
            next: Mutex::new(0),
            jobs: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            refuse: AtomicBool::new(false),
            started: jtx,
        });
        let pp = PostProcessor::new(host, engine.clone());
        pp.init().unwrap();
        pp.start().unwrap();
        Rig {
            pp,
            engine,
            returns: Arc::default(),
            events,
            seen,
            started,
            reprocessed,
        }
    }

    fn frame(returns: &Arc<Returns>, stream: Handle, ty: StreamType, idx: u64) -> SuperBuf {
        let layout = FrameLenOffset::compute(DIM, PixelFormat::Nv21, 1);
        let block = AnonBackend.allocate(4096).unwrap();
        let buf = BufDef {
            stream,
            stream_type: ty,
            index: idx as usize,
            frame_idx: idx,
            fd: block.fd(),
            frame_len: layout.frame_len,
            planes: layout.planes,
            block,
            timestamp: Duration::ZERO,
        };
        SuperBuf::new(1, 2, vec![buf], returns.clone())
    }

    fn wait_for<T>(rx: &Receiver<T>) -> T {
        rx.recv_timeout(Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn encoded_frame_released_once_and_delivered() {
        let r = rig(false, false);
        r.pp.process_data(frame(&r.returns, SNAP, StreamType::Snapshot, 3)).unwrap();
        wait_for(&r.started);
        assert_eq!(r.returns.count(SNAP, 3), 0);

        r.engine.complete(JpegStatus::Done);
        r.pp.process_jpeg_evt(wait_for(&r.events)).unwrap();
        match wait_for(&r.seen) {
            Seen::Data(msg, len) => {
                assert_eq!(msg, MsgType::COMPRESSED_IMAGE);
                assert_eq!(len, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(r.returns.count(SNAP, 3), 1);
        r.pp.stop();
        assert_eq!(r.returns.count(SNAP, 3), 1);
    }

    #[test]
    fn encode_failure_releases_frame_once() {
        let r = rig(false, false);
        r.pp.process_data(frame(&r.returns, SNAP, StreamType::Snapshot, 4)).unwrap();
        wait_for(&r.started);
        r.engine.complete(JpegStatus::Error);
        assert!(r.pp.process_jpeg_evt(wait_for(&r.events)).is_err());
        assert!(matches!(wait_for(&r.seen), Seen::Notify(MsgType::ERROR)));
        assert_eq!(r.returns.count(SNAP, 4), 1);
        r.pp.deinit();
        assert_eq!(r.returns.count(SNAP, 4), 1);
    }

    #[test]
    fn refused_engine_job_releases_frame() {
        let r = rig(false, false);
        r.engine.refuse.store(true, Ordering::SeqCst);
        r.pp.process_data(frame(&r.returns, SNAP, StreamType::Snapshot, 5)).unwrap();
        assert!(matches!(wait_for(&r.seen), Seen::Notify(MsgType::ERROR)));
        assert_eq!(r.returns.count(SNAP, 5), 1);
    }

    #[test]
    fn reprocess_failure_releases_frame_once() {
        let r = rig(true, true);
        r.pp.process_data(frame(&r.returns, SNAP, StreamType::Snapshot, 6)).unwrap();
        assert!(matches!(wait_for(&r.seen), Seen::Notify(MsgType::ERROR)));
        assert_eq!(r.returns.count(SNAP, 6), 1);
        assert_eq!(r.pp.queue_depths(), [0, 0, 0, 0]);
        r.pp.stop();
        assert_eq!(r.returns.count(SNAP, 6), 1);
    }

    #[test]
    fn reprocessed_frame_replaces_source() {
        let r = rig(true, false);
        r.pp.process_data(frame(&r.returns, SNAP, StreamType::Snapshot, 7)).unwrap();
        assert_eq!(wait_for(&r.reprocessed), 7);
        r.pp.process_pp_data(frame(&r.returns, 0x200, StreamType::Reprocess, 7)).unwrap();
        assert_eq!(r.returns.count(SNAP, 7), 1);
        wait_for(&r.started);
        r.engine.complete(JpegStatus::Done);
        r.pp.process_jpeg_evt(wait_for(&r.events)).unwrap();
        assert!(matches!(wait_for(&r.seen), Seen::Data(MsgType::COMPRESSED_IMAGE, _)));
        assert_eq!(r.returns.count(0x200, 7), 1);
        assert_eq!(r.returns.count(SNAP, 7), 1);
    }

    #[test]
    fn reprocessed_frame_for_another_job_is_rejected() {
        let r = rig(true, false);
        r.pp.process_data(frame(&r.returns, SNAP, StreamType::Snapshot, 7)).unwrap();
        assert_eq!(wait_for(&r.reprocessed), 7);

        let foreign = r.pp.process_pp_data(frame(&r.returns, 0x200, StreamType::Reprocess, 8));
        assert!(matches!(foreign, Err(HalError::NotFound(_))));
        assert_eq!(r.returns.count(0x200, 8), 1);
        // the pending job keeps its source
        assert_eq!(r.returns.count(SNAP, 7), 0);
        assert_eq!(r.pp.queue_depths()[1], 1);

        r.pp.process_pp_data(frame(&r.returns, 0x200, StreamType::Reprocess, 7)).unwrap();
        assert_eq!(r.returns.count(SNAP, 7), 1);
        assert_eq!(r.pp.queue_depths()[1], 0);
    }

    #[test]
    fn unknown_job_id_is_an_error() {
        let r = rig(false, false);
        let evt = JpegEvent {
            job_id: 99,
            status: JpegStatus::Done,
            thumbnail_dropped: false,
            output: AnonBackend.allocate(4096).unwrap(),
            size: 0,
        };
        assert!(matches!(r.pp.process_jpeg_evt(evt), Err(HalError::NotFound(_))));
    }

    #[test]
    fn raw_frames_pass_through() {
        let r = rig(false, false);
        r.pp.process_data(frame(&r.returns, RAW, StreamType::Raw, 8)).unwrap();
        assert!(matches!(wait_for(&r.seen), Seen::Data(MsgType::RAW_IMAGE, _)));
        // stop waits for the notify worker to finish the job in hand
        r.pp.stop();
        assert_eq!(r.returns.count(RAW, 8), 1);
    }

    #[test]
    fn stop_drains_every_queue() {
        let r = rig(false, false);
        for i in 0..3 {
            r.pp.process_data(frame(&r.returns, SNAP, StreamType::Snapshot, i)).unwrap();
        }
        for _ in 0..3 {
            wait_for(&r.started);
        }
        r.pp.stop();
        assert_eq!(r.pp.queue_depths(), [0, 0, 0, 0]);
        for i in 0..3 {
            assert_eq!(r.returns.count(SNAP, i as usize), 1);
        }
        assert_eq!(lock(&r.engine.aborted).len(), 3);
        // frames arriving after stop are released, not queued
        assert!(r.pp.process_data(frame(&r.returns, SNAP, StreamType::Snapshot, 9)).is_err());
        assert_eq!(r.returns.count(SNAP, 9), 1);
    }
}
