//! JPEG encode engine interface and the software implementation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use bytes::Bytes;
use crossbeam::channel::{unbounded, Sender};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, ExtendedColorType, RgbImage};
use tracing::{debug, error, warn};

use crate::capture::decoder::decode_frame;
use crate::capture::frame::{Dimension, FrameLenOffset, PixelFormat};
use crate::error::{HalError, HalResult};
use crate::mem::BufferBlock;

pub type JobId = u32;

/// Largest thumbnail that still fits an APP1 segment
pub const MAX_THUMBNAIL_LEN: usize = 0xFFFF - 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JpegStatus {
    Done,
    Error,
}

/// Completion of one encode job
#[derive(Debug, Clone)]
pub struct JpegEvent {
    pub job_id: JobId,
    pub status: JpegStatus,
    pub thumbnail_dropped: bool,
    pub output: BufferBlock,
    pub size: usize,
}

/// One plane-described image handed to the encoder
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub data: Bytes,
    pub dim: Dimension,
    pub format: PixelFormat,
    pub layout: FrameLenOffset,
}

#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub main: SourceImage,
    pub thumbnail: Option<SourceImage>,
    pub quality: u8,
    pub thumbnail_quality: u8,
    /// Clockwise, one of 0, 90, 180, 270
    pub rotation: u32,
    /// Encoder output lands here
    pub dst: BufferBlock,
}

pub type JpegCallback = Arc<dyn Fn(JpegEvent) + Send + Sync>;

pub trait JpegEngine: Send + Sync {
    /// Queue `job`; `cb` fires exactly once unless the job is aborted first.
    fn start_job(&self, job: EncodeJob, cb: JpegCallback) -> HalResult<JobId>;

    fn abort_job(&self, job_id: JobId) -> HalResult<()>;
}

struct Pending {
    id: JobId,
    job: EncodeJob,
    cb: JpegCallback,
}

/// Encodes with the `image` crate on dedicated worker threads.
pub struct SoftwareJpegEngine {
    next_id: AtomicU32,
    aborted: Arc<Mutex<HashSet<JobId>>>,
    tx: Option<Sender<Pending>>,
    workers: Vec<JoinHandle<()>>,
}

impl SoftwareJpegEngine {
    pub fn new() -> HalResult<Self> {
        Self::with_workers(1)
    }

    /// `workers` threads share one job queue; jobs may then complete out of order.
    pub fn with_workers(workers: usize) -> HalResult<Self> {
        let (tx, rx) = unbounded::<Pending>();
        let aborted: Arc<Mutex<HashSet<JobId>>> = Arc::default();
        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let rx = rx.clone();
            let skip = aborted.clone();
            let handle = std::thread::Builder::new()
                .name(format!("jpeg-encode-{i}"))
                .spawn(move || {
                    while let Ok(Pending { id, job, cb }) = rx.recv() {
                        let was_aborted = skip.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
                        if was_aborted {
                            debug!(job_id = id, "Skipping aborted job");
                            continue;
                        }
                        cb(run_job(id, job));
                    }
                })
                .map_err(|e| HalError::NoMemory(format!("spawn jpeg worker: {e}")))?;
            handles.push(handle);
        }
        Ok(Self {
            next_id: AtomicU32::new(1),
            aborted,
            tx: Some(tx),
            workers: handles,
        })
    }
}

impl JpegEngine for SoftwareJpegEngine {
    fn start_job(&self, job: EncodeJob, cb: JpegCallback) -> HalResult<JobId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tx = self.tx.as_ref().ok_or(HalError::Shutdown)?;
        tx.send(Pending { id, job, cb })
            .map_err(|_| HalError::Shutdown)?;
        debug!(job_id = id, "Encode job queued");
        Ok(id)
    }

    fn abort_job(&self, job_id: JobId) -> HalResult<()> {
        self.aborted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(job_id);
        Ok(())
    }
}

impl Drop for SoftwareJpegEngine {
    fn drop(&mut self) {
        self.tx.take();
        for w in self.workers.drain(..) {
            if w.thread().id() != std::thread::current().id() && w.join().is_err() {
                error!("JPEG worker panicked");
            }
        }
    }
}

fn run_job(id: JobId, job: EncodeJob) -> JpegEvent {
    let started = Instant::now();
    let mut event = JpegEvent {
        job_id: id,
        status: JpegStatus::Error,
        thumbnail_dropped: false,
        output: job.dst.clone(),
        size: 0,
    };

    let encoded = match encode_image(&job.main, job.quality, job.rotation) {
        Ok(e) => e,
        Err(e) => {
            error!(job_id = id, "Main image encode failed: {}", e);
            return event;
        }
    };
    if encoded.len() > job.dst.size() {
        error!(
            job_id = id,
            len = encoded.len(),
            cap = job.dst.size(),
            "Encoded image does not fit output buffer"
        );
        return event;
    }

    if let Some(thumb) = &job.thumbnail {
        event.thumbnail_dropped = match encode_image(thumb, job.thumbnail_quality, job.rotation) {
            Ok(t) => t.len() > MAX_THUMBNAIL_LEN,
            Err(e) => {
                warn!(job_id = id, "Thumbnail encode failed: {}", e);
                true
            }
        };
    }

    event.size = job.dst.write_at(0, &encoded);
    event.status = JpegStatus::Done;
    metrics::histogram!("camhal_jpeg_encode_us").record(started.elapsed().as_micros() as f64);
    debug!(job_id = id, size = event.size, "Encode finished");
    event
}

/// Convert, rotate and compress one image.
pub fn encode_image(src: &SourceImage, quality: u8, rotation: u32) -> HalResult<Vec<u8>> {
    let rgb = decode_frame(&src.data, &src.layout, src.dim, src.format)?;
    let img = RgbImage::from_raw(src.dim.width, src.dim.height, rgb)
        .ok_or_else(|| HalError::InvalidArgument("decoded size mismatch".into()))?;
    let img = match rotation {
        0 => img,
        90 => imageops::rotate90(&img),
        180 => imageops::rotate180(&img),
        270 => imageops::rotate270(&img),
        other => {
            return Err(HalError::InvalidArgument(format!(
                "unsupported rotation {other}"
            )))
        }
    };

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(img.as_raw(), img.width(), img.height(), ExtendedColorType::Rgb8)
        .map_err(|e| HalError::Transport(format!("jpeg encode: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mem::{AnonBackend, MemoryBackend};

    fn grey(dim: Dimension) -> SourceImage {
        let layout = FrameLenOffset::compute(dim, PixelFormat::Nv21, 1);
        let mut data = vec![90u8; layout.planes[0].len];
        data.resize(layout.frame_len, 128);
        SourceImage {
            data: Bytes::from(data),
            dim,
            format: PixelFormat::Nv21,
            layout,
        }
    }

    fn job(main: SourceImage, dst_len: usize) -> EncodeJob {
        EncodeJob {
            main,
            thumbnail: None,
            quality: 85,
            thumbnail_quality: 70,
            rotation: 0,
            dst: AnonBackend.allocate(dst_len).unwrap(),
        }
    }

    #[test]
    fn encodes_into_destination() {
        let engine = SoftwareJpegEngine::new().unwrap();
        let (tx, rx) = flume::unbounded();
        let id = engine
            .start_job(
                job(grey(Dimension::new(32, 16)), 64 * 1024),
                Arc::new(move |e| {
                    let _ = tx.send(e);
                }),
            )
            .unwrap();
        let evt = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(evt.job_id, id);
        assert_eq!(evt.status, JpegStatus::Done);
        assert!(evt.size > 0);
        assert_eq!(&evt.output.read(0, 2)[..], &[0xFF, 0xD8]);
    }

    #[test]
    fn undersized_output_reports_error() {
        let engine = SoftwareJpegEngine::new().unwrap();
        let (tx, rx) = flume::unbounded();
        let dim = Dimension::new(256, 256);
        let layout = FrameLenOffset::compute(dim, PixelFormat::Nv21, 1);
        // noise does not compress into a single page
        let mut seed = 0x2545_f491u32;
        let data: Vec<u8> = (0..layout.frame_len)
            .map(|_| {
                seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (seed >> 24) as u8
            })
            .collect();
        let src = SourceImage {
            data: Bytes::from(data),
            dim,
            format: PixelFormat::Nv21,
            layout,
        };
        engine
            .start_job(
                job(src, 4096),
                Arc::new(move |e| {
                    let _ = tx.send(e);
                }),
            )
            .unwrap();
        let evt = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(evt.status, JpegStatus::Error);
        assert_eq!(evt.size, 0);
    }

    #[test]
    fn unsupported_format_fails_job() {
        let engine = SoftwareJpegEngine::new().unwrap();
        let (tx, rx) = flume::unbounded();
        let mut src = grey(Dimension::new(8, 8));
        src.format = PixelFormat::Raw8;
        src.layout = FrameLenOffset::compute(src.dim, PixelFormat::Raw8, 1);
        engine
            .start_job(
                job(src, 4096),
                Arc::new(move |e| {
                    let _ = tx.send(e);
                }),
            )
            .unwrap();
        let evt = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(evt.status, JpegStatus::Error);
    }

    #[test]
    fn rotation_swaps_dimensions() {
        let out = encode_image(&grey(Dimension::new(16, 8)), 80, 90).unwrap();
        let img = image::load_from_memory_with_format(&out, image::ImageFormat::Jpeg).unwrap();
        assert_eq!((img.width(), img.height()), (8, 16));
        assert!(encode_image(&grey(Dimension::new(16, 8)), 80, 45).is_err());
    }
}
