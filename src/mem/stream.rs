//! Exported stream buffers shared with the driver and the application.

use std::sync::Arc;

use bytes::BufMut;
use tracing::error;

use crate::error::HalResult;

use super::{AnonBackend, BlockSet, BufferBlock, CameraMemory, MemfdBackend, MemoryBackend};

/// Length of the per-buffer handle record written for video encoders
pub const VIDEO_METADATA_LEN: usize = 16;

pub struct StreamMemory {
    set: BlockSet,
}

impl Default for StreamMemory {
    fn default() -> Self {
        Self::new(Arc::new(MemfdBackend))
    }
}

impl StreamMemory {
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        Self {
            set: BlockSet::new(backend),
        }
    }
}

impl CameraMemory for StreamMemory {
    fn allocate(&mut self, count: usize, size: usize) -> HalResult<()> {
        self.set.alloc(count, size)
    }

    fn deallocate(&mut self) {
        self.set.dealloc();
    }

    fn count(&self) -> usize {
        self.set.len()
    }

    fn block(&self, index: usize) -> HalResult<BufferBlock> {
        self.set.get(index)
    }

    fn reg_flags(&self) -> HalResult<Vec<bool>> {
        Ok(vec![true; self.set.len()])
    }

    fn match_buf_index(&self, block: &BufferBlock, metadata: bool) -> Option<usize> {
        if metadata {
            return None;
        }
        self.set.position(block)
    }
}

/// Stream buffers for recording. With metadata mode on, each frame also
/// gets a small handle record so encoders can reference the frame by fd.
pub struct VideoMemory {
    frames: StreamMemory,
    metadata: BlockSet,
    store_metadata: bool,
}

impl VideoMemory {
    pub fn new(backend: Arc<dyn MemoryBackend>, store_metadata: bool) -> Self {
        Self {
            frames: StreamMemory::new(backend),
            metadata: BlockSet::new(Arc::new(AnonBackend)),
            store_metadata,
        }
    }

    pub fn store_metadata(&self) -> bool {
        self.store_metadata
    }

    fn write_handle(meta: &BufferBlock, frame: &BufferBlock) {
        let mut rec = Vec::with_capacity(VIDEO_METADATA_LEN);
        rec.put_u32_le(0); // camera source
        rec.put_i32_le(frame.fd());
        rec.put_u32_le(0);
        rec.put_u32_le(frame.size() as u32);
        meta.write_at(0, &rec);
    }
}

impl CameraMemory for VideoMemory {
    fn allocate(&mut self, count: usize, size: usize) -> HalResult<()> {
        self.frames.allocate(count, size)?;
        if !self.store_metadata {
            return Ok(());
        }
        if let Err(e) = self.metadata.alloc(count, VIDEO_METADATA_LEN) {
            error!("Video metadata allocation failed: {}", e);
            self.frames.deallocate();
            return Err(e);
        }
        for i in 0..count {
            if let (Ok(meta), Ok(frame)) = (self.metadata.get(i), self.frames.block(i)) {
                Self::write_handle(&meta, &frame);
            }
        }
        Ok(())
    }

    fn deallocate(&mut self) {
        self.metadata.dealloc();
        self.frames.deallocate();
    }

    fn count(&self) -> usize {
        self.frames.count()
    }

    fn block(&self, index: usize) -> HalResult<BufferBlock> {
        self.frames.block(index)
    }

    fn reg_flags(&self) -> HalResult<Vec<bool>> {
        self.frames.reg_flags()
    }

    fn match_buf_index(&self, block: &BufferBlock, metadata: bool) -> Option<usize> {
        if metadata {
            self.metadata.position(block)
        } else {
            self.frames.match_buf_index(block, false)
        }
    }

    fn metadata(&self, index: usize) -> Option<BufferBlock> {
        self.metadata.get(index).ok()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Buf;

    use super::*;
    use crate::mem::testing::CountingBackend;

    #[test]
    fn stream_pool_registers_every_buffer() {
        let mut pool = StreamMemory::new(Arc::new(AnonBackend));
        pool.allocate(3, 1000).unwrap();
        assert_eq!(pool.reg_flags().unwrap(), vec![true; 3]);
        let b = pool.block(2).unwrap();
        assert_eq!(pool.match_buf_index(&b, false), Some(2));
    }

    #[test]
    fn video_metadata_points_at_frame() {
        let mut pool = VideoMemory::new(Arc::new(MemfdBackend), true);
        pool.allocate(2, 4096).unwrap();
        let meta = pool.metadata(1).unwrap();
        let mut rec = meta.read(0, VIDEO_METADATA_LEN);
        assert_eq!(rec.get_u32_le(), 0);
        assert_eq!(rec.get_i32_le(), pool.fd(1).unwrap());
        assert_eq!(pool.match_buf_index(&meta, true), Some(1));
        pool.deallocate();
        assert_eq!(pool.count(), 0);
        assert!(pool.metadata(0).is_none());
    }

    #[test]
    fn video_without_metadata_mode_has_no_handles() {
        let backend = Arc::new(CountingBackend::default());
        let mut pool = VideoMemory::new(backend, false);
        pool.allocate(2, 64).unwrap();
        assert!(pool.metadata(0).is_none());
    }
}
