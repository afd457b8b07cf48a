//! One hardware data path: its pool, plane layout and delivery worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use flume::Sender;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::frame::{
    BufDef, Dimension, FrameLenOffset, Handle, PixelFormat, StreamType, SuperBuf,
};
use crate::driver::{CameraOps, FrameCallback, StreamConfig, StreamingMode};
use crate::error::{HalError, HalResult};
use crate::mem::{BufferBlock, CameraMemory};

/// Per-stream frame consumer, run on the stream's worker
pub type StreamCallback = Arc<dyn Fn(SuperBuf, &Stream) + Send + Sync>;

/// Forwarding target for streams without their own callback
pub type FrameSink = Arc<dyn Fn(SuperBuf) + Send + Sync>;

/// Shape of a stream, decided by the HAL before buffers are allocated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_type: StreamType,
    pub dim: Dimension,
    pub format: PixelFormat,
    pub mode: StreamingMode,
    pub buf_count: usize,
}

/// Buffer allocation capability the HAL lends to every stream
pub trait StreamAllocator: Send + Sync {
    fn stream_info(&self, stream_type: StreamType) -> HalResult<StreamInfo>;

    /// A pool with `info.buf_count` buffers of at least `size` bytes, already allocated.
    fn allocate_stream_buf(&self, info: &StreamInfo, size: usize) -> HalResult<Box<dyn CameraMemory>>;
}

struct Worker {
    tx: Sender<SuperBuf>,
    handle: JoinHandle<()>,
}

pub struct Stream {
    camera: Handle,
    channel: Handle,
    handle: Handle,
    info: StreamInfo,
    layout: FrameLenOffset,
    ops: Arc<dyn CameraOps>,
    memory: Mutex<Box<dyn CameraMemory>>,
    bufs: Vec<BufDef>,
    data_cb: Option<StreamCallback>,
    sink: Option<FrameSink>,
    active: AtomicBool,
    released: AtomicBool,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("handle", &self.handle)
            .field("type", &self.info.stream_type)
            .field("dim", &self.info.dim)
            .finish()
    }
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Stream {
    /// Add a stream to `channel`, allocate its buffers and register them with the driver.
    ///
    /// Frames go to `data_cb` when given, otherwise to `sink`.
    pub fn create(
        camera: Handle,
        channel: Handle,
        ops: Arc<dyn CameraOps>,
        allocator: &dyn StreamAllocator,
        stream_type: StreamType,
        padding: u32,
        data_cb: Option<StreamCallback>,
        sink: Option<FrameSink>,
    ) -> HalResult<Arc<Self>> {
        let info = allocator.stream_info(stream_type)?;
        let layout = match stream_type {
            StreamType::Metadata => FrameLenOffset::metadata(),
            _ => FrameLenOffset::compute(info.dim, info.format, padding),
        };

        let handle = ops.add_stream(channel)?;
        let memory = match allocator.allocate_stream_buf(&info, layout.frame_len) {
            Ok(m) => m,
            Err(e) => {
                error!(?stream_type, "Stream buffer allocation failed: {}", e);
                if let Err(e) = ops.delete_stream(channel, handle) {
                    warn!(?stream_type, "Stream delete after failed allocation failed: {}", e);
                }
                return Err(e);
            }
        };
        let reg_flags = memory.reg_flags()?;
        let bufs = (0..memory.count())
            .map(|i| memory.buf_def(handle, stream_type, &layout, i))
            .collect::<HalResult<Vec<_>>>()?;

        let stream = Arc::new(Self {
            camera,
            channel,
            handle,
            info: info.clone(),
            layout: layout.clone(),
            ops: ops.clone(),
            memory: Mutex::new(memory),
            bufs: bufs.clone(),
            data_cb,
            sink,
            active: AtomicBool::new(false),
            released: AtomicBool::new(false),
            worker: Mutex::new(None),
        });

        let me = Arc::downgrade(&stream);
        let notify: FrameCallback = Arc::new(move |sb| match me.upgrade() {
            Some(s) => s.process_data_notify(sb),
            None => drop(sb),
        });
        let config = StreamConfig {
            stream_type,
            dim: info.dim,
            format: info.format,
            layout,
            mode: info.mode,
            bufs,
            reg_flags,
            data_cb: notify,
        };
        if let Err(e) = ops.config_stream(channel, handle, config) {
            error!(?stream_type, "config_stream failed: {}", e);
            stream.release();
            return Err(e);
        }
        info!(handle, ?stream_type, dim = %info.dim, bufs = info.buf_count, "Stream created");
        Ok(stream)
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn channel(&self) -> Handle {
        self.channel
    }

    pub fn camera(&self) -> Handle {
        self.camera
    }

    pub fn stream_type(&self) -> StreamType {
        self.info.stream_type
    }

    pub fn is_type_of(&self, ty: StreamType) -> bool {
        self.info.stream_type == ty
    }

    pub fn frame_offset(&self) -> &FrameLenOffset {
        &self.layout
    }

    pub fn dim(&self) -> Dimension {
        self.info.dim
    }

    pub fn format(&self) -> PixelFormat {
        self.info.format
    }

    pub fn num_bufs(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Driver-context entry: queue the frame for the worker without blocking.
    pub fn process_data_notify(&self, frame: SuperBuf) {
        if !self.is_active() {
            drop(frame);
            return;
        }
        let guard = lock(&self.worker);
        match guard.as_ref() {
            Some(w) => {
                if let Err(e) = w.tx.send(frame) {
                    // the returned frame drops here, back to the driver
                    debug!(stream = self.handle, "Worker gone, frame returned");
                    drop(e.into_inner());
                }
            }
            None => drop(frame),
        }
    }

    #[instrument(skip(self), fields(stream = self.handle))]
    pub fn start(self: &Arc<Self>) -> HalResult<()> {
        let mut guard = lock(&self.worker);
        if guard.is_some() {
            return Ok(());
        }
        let (tx, rx) = flume::unbounded::<SuperBuf>();
        let me = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name(format!("stream-{:x}", self.handle))
            .spawn(move || {
                while let Ok(frame) = rx.recv() {
                    let Some(stream) = me.upgrade() else { break };
                    stream.dispatch(frame);
                }
            })
            .map_err(|e| HalError::NoMemory(format!("spawn stream worker: {e}")))?;
        *guard = Some(Worker { tx, handle });
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn dispatch(&self, frame: SuperBuf) {
        if !self.is_active() {
            return;
        }
        metrics::counter!("camhal_stream_frames_total", "type" => format!("{:?}", self.info.stream_type))
            .increment(1);
        if let Some(cb) = &self.data_cb {
            cb(frame, self);
        } else if let Some(sink) = &self.sink {
            sink(frame);
        } else {
            warn!(stream = self.handle, "No consumer for frame, returning it");
        }
    }

    /// Stop delivering. Frames still queued go back to the driver; once this
    /// returns no callback of this stream runs.
    #[instrument(skip(self), fields(stream = self.handle))]
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        let worker = lock(&self.worker).take();
        let Some(Worker { tx, handle }) = worker else {
            return;
        };
        drop(tx);
        if handle.thread().id() == std::thread::current().id() {
            error!("Stream stopped from its own worker");
            return;
        }
        if handle.join().is_err() {
            error!("Stream worker panicked");
        }
    }

    /// Queue buffer `index` back to the driver.
    pub fn buf_done(&self, index: usize) -> HalResult<()> {
        let buf = self.bufs.get(index).ok_or(HalError::OutOfRange {
            index,
            len: self.bufs.len(),
        })?;
        self.ops.qbuf(self.channel, buf)
    }

    /// Queue the buffer backed by `block` (or by its metadata handle) back to the driver.
    pub fn buf_done_block(&self, block: &BufferBlock, metadata: bool) -> HalResult<()> {
        let index = lock(&self.memory)
            .match_buf_index(block, metadata)
            .ok_or_else(|| HalError::NotFound("buffer not owned by this stream".into()))?;
        self.buf_done(index)
    }

    pub fn with_memory<R>(&self, f: impl FnOnce(&mut dyn CameraMemory) -> R) -> R {
        let mut mem = lock(&self.memory);
        f(mem.as_mut())
    }

    /// Display-backed streams: show `index`, then queue whatever the window gave back.
    pub fn display_buffer(&self, index: usize, timestamp: Duration) -> HalResult<()> {
        let next = {
            let mut mem = lock(&self.memory);
            let display = mem
                .as_display()
                .ok_or_else(|| HalError::InvalidOperation("stream is not display-backed".into()))?;
            display.display_buffer(index, timestamp)?
        };
        if let Some(next) = next {
            self.buf_done(next)?;
        }
        Ok(())
    }

    /// Remove the stream from the driver and free its buffers.
    pub fn release(&self) {
        self.stop();
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.ops.delete_stream(self.channel, self.handle) {
            warn!(stream = self.handle, "delete_stream failed: {}", e);
        }
        lock(&self.memory).deallocate();
    }
}
