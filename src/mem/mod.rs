//! Buffer memory pools.
//!
//! Every stream owns exactly one pool. Pools hand out page-aligned blocks,
//! allocate all-or-nothing and expose per-index cache maintenance.

pub mod block;
pub mod display;
pub mod heap;
pub mod stream;

use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::capture::frame::{BufDef, FrameLenOffset, Handle, StreamType};
use crate::error::{HalError, HalResult};

pub use block::{page_align, AnonBackend, BufferBlock, CacheOp, MemfdBackend, MemoryBackend};
pub use display::{BufferLockState, DisplayMemory};
pub use heap::HeapMemory;
pub use stream::{StreamMemory, VideoMemory};

/// Upper bound on buffers in one pool
pub const MAX_NUM_FRAMES: usize = 16;

/// Common surface of every buffer pool
pub trait CameraMemory: Send + Sync {
    /// Allocate `count` buffers of at least `size` bytes. Nothing stays allocated on failure.
    fn allocate(&mut self, count: usize, size: usize) -> HalResult<()>;

    /// Release every buffer and reset the count to zero.
    fn deallocate(&mut self);

    fn count(&self) -> usize;

    fn block(&self, index: usize) -> HalResult<BufferBlock>;

    fn fd(&self, index: usize) -> HalResult<RawFd> {
        Ok(self.block(index)?.fd())
    }

    fn size(&self, index: usize) -> HalResult<usize> {
        Ok(self.block(index)?.size())
    }

    fn cache_ops(&self, index: usize, op: CacheOp) -> HalResult<()> {
        self.block(index)?.sync(op)
    }

    /// Which buffers get queued to the driver when the stream starts.
    fn reg_flags(&self) -> HalResult<Vec<bool>>;

    /// Describe buffer `index` for the driver using the stream's plane layout.
    fn buf_def(
        &self,
        stream: Handle,
        stream_type: StreamType,
        layout: &FrameLenOffset,
        index: usize,
    ) -> HalResult<BufDef> {
        let block = self.block(index)?;
        Ok(BufDef {
            stream,
            stream_type,
            index,
            frame_idx: 0,
            fd: block.fd(),
            frame_len: block.size().min(layout.frame_len.max(1)),
            planes: layout.planes.clone(),
            block,
            timestamp: Duration::ZERO,
        })
    }

    /// Index of the buffer backed by `block`, if it belongs to this pool.
    fn match_buf_index(&self, block: &BufferBlock, metadata: bool) -> Option<usize>;

    /// Per-buffer metadata handle, only for pools that carry one.
    fn metadata(&self, _index: usize) -> Option<BufferBlock> {
        None
    }

    /// Display-backed pools expose their enqueue/dequeue cycle through this.
    fn as_display(&mut self) -> Option<&mut DisplayMemory> {
        None
    }
}

/// Block bookkeeping shared by the heap and stream pools.
pub(crate) struct BlockSet {
    backend: Arc<dyn MemoryBackend>,
    blocks: Vec<BufferBlock>,
}

impl BlockSet {
    pub(crate) fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        Self {
            backend,
            blocks: Vec::new(),
        }
    }

    pub(crate) fn alloc(&mut self, count: usize, size: usize) -> HalResult<()> {
        check_alloc_request(count, self.blocks.len())?;
        let size = page_align(size);
        for i in 0..count {
            match self.backend.allocate(size) {
                Ok(block) => self.blocks.push(block),
                Err(e) => {
                    error!(index = i, size, "Buffer allocation failed: {}", e);
                    self.dealloc();
                    return Err(match e {
                        HalError::NoMemory(_) => e,
                        other => HalError::NoMemory(other.to_string()),
                    });
                }
            }
        }
        debug!(count, size, "Allocated buffer set");
        Ok(())
    }

    pub(crate) fn dealloc(&mut self) {
        while let Some(block) = self.blocks.pop() {
            self.backend.release(block);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn get(&self, index: usize) -> HalResult<BufferBlock> {
        self.blocks
            .get(index)
            .cloned()
            .ok_or(HalError::OutOfRange {
                index,
                len: self.blocks.len(),
            })
    }

    pub(crate) fn position(&self, block: &BufferBlock) -> Option<usize> {
        self.blocks.iter().position(|b| b.same_block(block))
    }
}

pub(crate) fn check_alloc_request(count: usize, current: usize) -> HalResult<()> {
    if count > MAX_NUM_FRAMES {
        return Err(HalError::OutOfRange {
            index: count,
            len: MAX_NUM_FRAMES,
        });
    }
    if current != 0 {
        return Err(HalError::InvalidOperation(
            "allocating an already allocated pool".into(),
        ));
    }
    Ok(())
}
