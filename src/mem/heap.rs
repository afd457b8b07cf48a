//! Private buffers used inside the HAL (encoder output, scratch copies).

use std::sync::Arc;

use crate::error::{HalError, HalResult};

use super::{AnonBackend, BlockSet, BufferBlock, CameraMemory, MemoryBackend};

pub struct HeapMemory {
    set: BlockSet,
}

impl Default for HeapMemory {
    fn default() -> Self {
        Self::new(Arc::new(AnonBackend))
    }
}

impl HeapMemory {
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        Self {
            set: BlockSet::new(backend),
        }
    }
}

impl CameraMemory for HeapMemory {
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

    /// Heap buffers are never registered with the driver.
    fn reg_flags(&self) -> HalResult<Vec<bool>> {
        Err(HalError::InvalidOperation(
            "heap memory has no driver registration".into(),
        ))
    }

    fn match_buf_index(&self, block: &BufferBlock, metadata: bool) -> Option<usize> {
        if metadata {
            return None;
        }
        self.set.position(block)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::mem::testing::CountingBackend;
    use crate::mem::{page_align, CacheOp, MAX_NUM_FRAMES};

    #[test]
    fn alloc_then_dealloc_frees_everything() {
        let backend = Arc::new(CountingBackend::default());
        let mut heap = HeapMemory::new(backend.clone());
        heap.allocate(4, 100).unwrap();
        assert_eq!(heap.count(), 4);
        assert_eq!(heap.size(0).unwrap(), page_align(100));
        heap.deallocate();
        assert_eq!(heap.count(), 0);
        assert_eq!(backend.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failure_mid_alloc_rolls_back() {
        let backend = Arc::new(CountingBackend {
            fail_at: Some(2),
            ..Default::default()
        });
        let mut heap = HeapMemory::new(backend.clone());
        let err = heap.allocate(5, 64).unwrap_err();
        assert!(matches!(err, HalError::NoMemory(_)));
        assert_eq!(heap.count(), 0);
        assert_eq!(backend.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn double_alloc_and_oversize_are_rejected() {
        let mut heap = HeapMemory::default();
        assert!(matches!(
            heap.allocate(MAX_NUM_FRAMES + 1, 64),
            Err(HalError::OutOfRange { .. })
        ));
        heap.allocate(1, 64).unwrap();
        assert!(matches!(
            heap.allocate(1, 64),
            Err(HalError::InvalidOperation(_))
        ));
    }

    #[test]
    fn cache_ops_checks_bounds() {
        let mut heap = HeapMemory::default();
        heap.allocate(2, 64).unwrap();
        heap.cache_ops(1, CacheOp::Clean).unwrap();
        assert_eq!(
            heap.cache_ops(2, CacheOp::Invalidate),
            Err(HalError::OutOfRange { index: 2, len: 2 })
        );
        assert!(heap.reg_flags().is_err());
        let b = heap.block(1).unwrap();
        assert_eq!(heap.match_buf_index(&b, false), Some(1));
        assert_eq!(heap.match_buf_index(&b, true), None);
    }
}
