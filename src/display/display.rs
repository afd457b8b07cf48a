//! In-process preview window.
//! Owns a small set of shareable buffers and forwards every displayed frame
//! to a flume receiver, which plays the role of the compositor.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use super::{BufferId, PreviewWindow, WindowBuffer};
use crate::capture::frame::{Dimension, FrameLenOffset, PixelFormat};
use crate::error::{HalError, HalResult};
use crate::mem::{page_align, MemfdBackend, MemoryBackend};

/// A frame handed to the compositor
#[derive(Debug, Clone)]
pub struct DisplayedFrame {
    pub id: BufferId,
    pub dim: Dimension,
    pub format: PixelFormat,
    pub data: Bytes,
    pub timestamp: Duration,
}

#[derive(Default)]
struct WindowState {
    count: usize,
    generation: u64,
    dim: Dimension,
    format: Option<PixelFormat>,
    buffers: Vec<WindowBuffer>,
    free: VecDeque<BufferId>,
    locked: HashSet<BufferId>,
    on_screen: Option<BufferId>,
}

#[derive(Default)]
struct Stats {
    frames_displayed: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Window whose compositor is a channel receiver
pub struct ChannelWindow {
    state: Mutex<WindowState>,
    min_undequeued: usize,
    tx: Sender<DisplayedFrame>,
    fail_lock: AtomicBool,
    fail_unlock: AtomicBool,
    stats: CachePadded<Stats>,
}

impl ChannelWindow {
    /// Create a window keeping `min_undequeued` buffers for itself, and the
    /// receiving end of its display queue.
    pub fn new(min_undequeued: usize, queue_depth: usize) -> (Arc<Self>, Receiver<DisplayedFrame>) {
        let (tx, rx) = flume::bounded(queue_depth.max(1));
        let window = Arc::new(Self {
            state: Mutex::new(WindowState::default()),
            min_undequeued,
            tx,
            fail_lock: AtomicBool::new(false),
            fail_unlock: AtomicBool::new(false),
            stats: CachePadded::new(Stats::default()),
        });
        (window, rx)
    }

    fn state(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make subsequent lock calls fail, as a stuck genlock would.
    pub fn set_fail_lock(&self, fail: bool) {
        self.fail_lock.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_unlock(&self, fail: bool) {
        self.fail_unlock.store(fail, Ordering::SeqCst);
    }

    /// Buffers currently queued on the window side
    pub fn free_count(&self) -> usize {
        self.state().free.len()
    }

    pub fn stats(&self) -> (usize, usize) {
        (
            self.stats.frames_displayed.load(Ordering::Relaxed),
            self.stats.frames_dropped.load(Ordering::Relaxed),
        )
    }

    fn check_known(state: &WindowState, id: BufferId) -> HalResult<()> {
        if state.buffers.iter().any(|b| b.id == id) {
            Ok(())
        } else {
            Err(HalError::NotFound(format!("window buffer {id:#x}")))
        }
    }
}

impl PreviewWindow for ChannelWindow {
    fn min_undequeued_buffer_count(&self) -> HalResult<usize> {
        Ok(self.min_undequeued)
    }

    fn set_buffer_count(&self, count: usize) -> HalResult<()> {
        if count <= self.min_undequeued {
            return Err(HalError::BadValue(format!(
                "buffer count {count} must exceed min undequeued {}",
                self.min_undequeued
            )));
        }
        self.state().count = count;
        Ok(())
    }

    fn set_buffers_geometry(&self, dim: Dimension, format: PixelFormat) -> HalResult<()> {
        let mut state = self.state();
        if state.count == 0 {
            return Err(HalError::InvalidOperation("buffer count not set".into()));
        }
        let size = page_align(FrameLenOffset::compute(dim, format, 32).frame_len);
        state.generation += 1;
        let generation = state.generation;
        let mut buffers = Vec::with_capacity(state.count);
        for i in 0..state.count {
            let block = MemfdBackend.allocate(size)?;
            buffers.push(WindowBuffer {
                id: (generation << 32) | i as u64,
                block,
            });
        }
        state.free = buffers.iter().map(|b| b.id).collect();
        state.buffers = buffers;
        state.locked.clear();
        state.on_screen = None;
        state.dim = dim;
        state.format = Some(format);
        info!(count = state.count, %dim, ?format, "Window buffers configured");
        Ok(())
    }

    fn dequeue_buffer(&self) -> HalResult<WindowBuffer> {
        let mut state = self.state();
        let id = state
            .free
            .pop_front()
            .ok_or_else(|| HalError::NoMemory("no free window buffer".into()))?;
        state
            .buffers
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| HalError::NotFound(format!("window buffer {id:#x}")))
    }

    fn lock_buffer(&self, id: BufferId) -> HalResult<()> {
        if self.fail_lock.load(Ordering::SeqCst) {
            return Err(HalError::Transport("write lock timed out".into()));
        }
        let mut state = self.state();
        Self::check_known(&state, id)?;
        state.locked.insert(id);
        Ok(())
    }

    fn unlock_buffer(&self, id: BufferId) -> HalResult<()> {
        if self.fail_unlock.load(Ordering::SeqCst) {
            return Err(HalError::Transport("unlock failed".into()));
        }
        let mut state = self.state();
        Self::check_known(&state, id)?;
        state.locked.remove(&id);
        Ok(())
    }

    fn enqueue_buffer(&self, id: BufferId, timestamp: Duration) -> HalResult<()> {
        let mut state = self.state();
        Self::check_known(&state, id)?;
        if state.locked.contains(&id) {
            return Err(HalError::InvalidOperation(format!(
                "buffer {id:#x} enqueued while write-locked"
            )));
        }
        let data = state
            .buffers
            .iter()
            .find(|b| b.id == id)
            .map(|b| b.block.to_bytes())
            .unwrap_or_default();
        let frame = DisplayedFrame {
            id,
            dim: state.dim,
            format: state.format.unwrap_or(PixelFormat::Nv21),
            data,
            timestamp,
        };
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.frames_displayed.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(id, "Display queue full, frame dropped");
            }
        }
        // the previously shown buffer becomes free once a new one is on screen
        if let Some(prev) = state.on_screen.replace(id) {
            state.free.push_back(prev);
        }
        Ok(())
    }

    fn cancel_buffer(&self, id: BufferId) -> HalResult<()> {
        let mut state = self.state();
        Self::check_known(&state, id)?;
        if state.locked.remove(&id) {
            warn!(id, "Buffer cancelled while locked");
        }
        if !state.free.contains(&id) && state.on_screen != Some(id) {
            state.free.push_back(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured(min: usize, count: usize) -> (Arc<ChannelWindow>, Receiver<DisplayedFrame>) {
        let (w, rx) = ChannelWindow::new(min, 4);
        w.set_buffer_count(count).unwrap();
        w.set_buffers_geometry(Dimension::new(64, 48), PixelFormat::Nv21)
            .unwrap();
        (w, rx)
    }

    #[test]
    fn enqueue_delivers_to_receiver() {
        let (w, rx) = configured(1, 3);
        let buf = w.dequeue_buffer().unwrap();
        buf.block.write_at(0, b"frame");
        w.enqueue_buffer(buf.id, Duration::from_millis(5)).unwrap();
        let shown = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(shown.id, buf.id);
        assert_eq!(&shown.data[..5], b"frame");
    }

    #[test]
    fn locked_buffer_cannot_be_enqueued() {
        let (w, _rx) = configured(1, 3);
        let buf = w.dequeue_buffer().unwrap();
        w.lock_buffer(buf.id).unwrap();
        assert!(w.enqueue_buffer(buf.id, Duration::ZERO).is_err());
        w.unlock_buffer(buf.id).unwrap();
        w.enqueue_buffer(buf.id, Duration::ZERO).unwrap();
    }

    #[test]
    fn on_screen_buffer_is_held_back() {
        let (w, _rx) = configured(1, 2);
        let a = w.dequeue_buffer().unwrap();
        let b = w.dequeue_buffer().unwrap();
        assert!(w.dequeue_buffer().is_err());
        w.enqueue_buffer(a.id, Duration::ZERO).unwrap();
        assert_eq!(w.free_count(), 0);
        w.enqueue_buffer(b.id, Duration::ZERO).unwrap();
        assert_eq!(w.dequeue_buffer().unwrap().id, a.id);
    }

    #[test]
    fn buffer_count_must_exceed_min_undequeued() {
        let (w, _rx) = ChannelWindow::new(2, 1);
        assert!(w.set_buffer_count(2).is_err());
    }
}
