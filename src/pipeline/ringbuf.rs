//! Rolling buffer of matched frames for zero-shutter-lag capture

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::warn;

use crate::capture::frame::SuperBuf;

/// Fixed-depth history of the most recent frame sets.
/// When full, the oldest set is evicted and goes straight back to the driver.
pub struct ZslRing {
    ring: HeapRb<SuperBuf>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_overwritten: AtomicUsize,
}

impl ZslRing {
    pub fn new(depth: usize) -> Self {
        Self {
            ring: HeapRb::new(depth.max(1)),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: keep `frame`, evicting the oldest one when full
    pub fn push(&mut self, frame: SuperBuf) {
        if let Some(old) = self.ring.push_overwrite(frame) {
            self.stats.frames_overwritten.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("camhal_zsl_frames_overwritten_total").increment(1);
            if let Err(e) = old.release() {
                warn!("Returning evicted ZSL frame failed: {}", e);
            }
        }
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Consumer: oldest retained frame
    pub fn pop(&mut self) -> Option<SuperBuf> {
        let frame = self.ring.try_pop()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Return every retained frame to the driver.
    pub fn flush(&mut self) -> usize {
        let mut n = 0;
        while let Some(frame) = self.ring.try_pop() {
            if let Err(e) = frame.release() {
                warn!("Returning flushed ZSL frame failed: {}", e);
            }
            n += 1;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.frames_written.load(Ordering::Relaxed),
            self.stats.frames_read.load(Ordering::Relaxed),
            self.stats.frames_overwritten.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::capture::frame::{BufDef, BufferReturn, Handle, StreamType};
    use crate::error::HalResult;
    use crate::mem::{AnonBackend, MemoryBackend};

    #[derive(Default)]
    struct Returned(Mutex<Vec<u64>>);

    impl BufferReturn for Returned {
        fn buf_done(&self, _channel: Handle, buf: &BufDef) -> HalResult<()> {
            self.0.lock().unwrap().push(buf.frame_idx);
            Ok(())
        }
    }

    fn frame(idx: u64, ret: &Arc<Returned>) -> SuperBuf {
        let buf = BufDef {
            stream: 1,
            stream_type: StreamType::Snapshot,
            index: 0,
            frame_idx: idx,
            fd: -1,
            frame_len: 8,
            planes: Vec::new(),
            block: AnonBackend.allocate(4096).unwrap(),
            timestamp: Duration::ZERO,
        };
        SuperBuf::new(1, 1, vec![buf], ret.clone())
    }

    #[test]
    fn overwrite_returns_oldest() {
        let ret = Arc::new(Returned::default());
        let mut ring = ZslRing::new(2);
        for i in 1..=4 {
            ring.push(frame(i, &ret));
        }
        assert_eq!(ring.len(), 2);
        assert_eq!(ret.0.lock().unwrap().as_slice(), &[1, 2]);
        let oldest = ring.pop().unwrap();
        assert_eq!(oldest.frame_idx(), 3);
        drop(oldest);
        assert_eq!(ring.flush(), 1);
        assert_eq!(ret.0.lock().unwrap().as_slice(), &[1, 2, 3, 4]);
        assert_eq!(ring.stats(), (4, 1, 2));
    }
}
