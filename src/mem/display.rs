//! Display-backed pool: buffers come from the preview window.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::capture::frame::{Dimension, PixelFormat};
use crate::display::{BufferId, PreviewWindow, WindowBuffer};
use crate::error::{HalError, HalResult};

use super::{check_alloc_request, BufferBlock, CacheOp, CameraMemory};

/// HAL-side ownership of one window buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLockState {
    /// Dequeued and write-locked, hardware may fill it
    Locked,
    /// Dequeued but not locked
    Unlocked,
    /// Owned by the window
    NotOwned,
}

pub struct DisplayMemory {
    window: Arc<dyn PreviewWindow>,
    dim: Dimension,
    format: PixelFormat,
    buffers: Vec<WindowBuffer>,
    states: Vec<BufferLockState>,
    min_undequeued: usize,
}

impl DisplayMemory {
    pub fn new(window: Arc<dyn PreviewWindow>, dim: Dimension, format: PixelFormat) -> Self {
        Self {
            window,
            dim,
            format,
            buffers: Vec::new(),
            states: Vec::new(),
            min_undequeued: 0,
        }
    }

    pub fn min_undequeued(&self) -> usize {
        self.min_undequeued
    }

    pub fn lock_state(&self, index: usize) -> Option<BufferLockState> {
        self.states.get(index).copied()
    }

    fn lock(&mut self, index: usize) {
        let id = self.buffers[index].id;
        match self.window.lock_buffer(id) {
            Ok(()) => self.states[index] = BufferLockState::Locked,
            Err(e) => {
                error!(index, "Window buffer lock failed: {}", e);
                self.states[index] = BufferLockState::NotOwned;
            }
        }
    }

    fn unlock(&mut self, index: usize) {
        let id = self.buffers[index].id;
        match self.window.unlock_buffer(id) {
            Ok(()) => self.states[index] = BufferLockState::Unlocked,
            Err(e) => {
                error!(index, "Window buffer unlock failed: {}", e);
                self.states[index] = BufferLockState::NotOwned;
            }
        }
    }

    /// Unlock and give back everything the HAL still owns.
    fn give_back(&mut self, upto: usize) {
        for i in 0..upto {
            if self.states[i] == BufferLockState::Locked {
                self.unlock(i);
            }
            if self.states[i] != BufferLockState::NotOwned {
                if let Err(e) = self.window.cancel_buffer(self.buffers[i].id) {
                    warn!(index = i, "cancel_buffer failed: {}", e);
                }
            }
            self.states[i] = BufferLockState::NotOwned;
        }
    }

    fn index_of(&self, id: BufferId) -> Option<usize> {
        self.buffers.iter().position(|b| b.id == id)
    }

    /// Hand buffer `index` to the compositor and take back the next free one.
    ///
    /// Returns the index of the re-acquired, re-locked buffer, or `None`
    /// when the window had nothing to give back.
    pub fn display_buffer(&mut self, index: usize, timestamp: Duration) -> HalResult<Option<usize>> {
        if index >= self.buffers.len() {
            return Err(HalError::OutOfRange {
                index,
                len: self.buffers.len(),
            });
        }
        if self.states[index] == BufferLockState::Locked {
            self.unlock(index);
        } else {
            error!(index, state = ?self.states[index], "Buffer to be displayed is not locked");
        }
        if let Err(e) = self.cache_ops(index, CacheOp::CleanInvalidate) {
            warn!(index, "Cache clean before display failed: {}", e);
        }

        match self.window.enqueue_buffer(self.buffers[index].id, timestamp) {
            Ok(()) => self.states[index] = BufferLockState::NotOwned,
            Err(e) => error!(index, "enqueue_buffer failed: {}", e),
        }

        let next = match self.window.dequeue_buffer() {
            Ok(buf) => buf,
            Err(e) => {
                debug!("No free buffer from display now: {}", e);
                return Ok(None);
            }
        };
        let Some(i) = self.index_of(next.id) else {
            warn!(id = next.id, "Dequeued a buffer this pool does not know");
            return Ok(None);
        };
        self.states[i] = BufferLockState::Unlocked;
        self.lock(i);
        Ok((self.states[i] == BufferLockState::Locked).then_some(i))
    }
}

impl CameraMemory for DisplayMemory {
    /// Dequeues `count` plus the window's minimum-undequeued buffers; `size` is
    /// set by the window geometry.
    fn allocate(&mut self, count: usize, _size: usize) -> HalResult<()> {
        check_alloc_request(count, self.buffers.len())?;
        let min = self
            .window
            .min_undequeued_buffer_count()
            .map_err(|e| HalError::Transport(format!("get_min_undequeued_buffer_count: {e}")))?;
        let total = count + min;
        check_alloc_request(total, 0)?;
        self.window
            .set_buffer_count(total)
            .map_err(|e| HalError::Transport(format!("set_buffer_count: {e}")))?;
        self.window
            .set_buffers_geometry(self.dim, self.format)
            .map_err(|e| HalError::Transport(format!("set_buffers_geometry: {e}")))?;

        for i in 0..total {
            match self.window.dequeue_buffer() {
                Ok(buf) => {
                    self.buffers.push(buf);
                    self.states.push(BufferLockState::Unlocked);
                    self.lock(i);
                }
                Err(e) => {
                    error!(index = i, "dequeue_buffer failed: {}", e);
                    self.give_back(i);
                    self.buffers.clear();
                    self.states.clear();
                    return Err(HalError::NoMemory(format!("dequeue_buffer: {e}")));
                }
            }
        }

        // the window keeps its minimum back
        self.min_undequeued = min;
        self.give_back(min);
        info!(total, min_undequeued = min, "Display buffers allocated");
        Ok(())
    }

    fn deallocate(&mut self) {
        let n = self.buffers.len();
        self.give_back(n);
        self.buffers.clear();
        self.states.clear();
        self.min_undequeued = 0;
    }

    fn count(&self) -> usize {
        self.buffers.len()
    }

    fn block(&self, index: usize) -> HalResult<BufferBlock> {
        self.buffers
            .get(index)
            .map(|b| b.block.clone())
            .ok_or(HalError::OutOfRange {
                index,
                len: self.buffers.len(),
            })
    }

    fn reg_flags(&self) -> HalResult<Vec<bool>> {
        Ok((0..self.buffers.len())
            .map(|i| i >= self.min_undequeued)
            .collect())
    }

    fn match_buf_index(&self, block: &BufferBlock, metadata: bool) -> Option<usize> {
        if metadata {
            return None;
        }
        self.buffers.iter().position(|b| b.block.same_block(block))
    }

    fn as_display(&mut self) -> Option<&mut DisplayMemory> {
        Some(self)
    }
}
