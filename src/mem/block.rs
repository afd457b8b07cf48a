//! Shareable memory blocks and the backends that hand them out.

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use memmap2::MmapMut;
use tracing::{debug, error};

use crate::error::{HalError, HalResult};

/// Cache maintenance requested before a CPU read or after a CPU write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    /// Write dirty lines back to memory
    Clean,
    /// Drop stale lines so the next read sees device writes
    Invalidate,
    CleanInvalidate,
}

struct BlockInner {
    fd: RawFd,
    size: usize,
    map: Mutex<MmapMut>,
    // keeps the exported fd open for as long as any view exists
    _file: Option<File>,
}

/// One page-aligned, mapped buffer. Cloning yields another view of the same memory.
#[derive(Clone)]
pub struct BufferBlock {
    inner: Arc<BlockInner>,
}

impl std::fmt::Debug for BufferBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferBlock")
            .field("fd", &self.inner.fd)
            .field("size", &self.inner.size)
            .finish()
    }
}

impl BufferBlock {
    fn new(fd: RawFd, size: usize, map: MmapMut, file: Option<File>) -> Self {
        Self {
            inner: Arc::new(BlockInner {
                fd,
                size,
                map: Mutex::new(map),
                _file: file,
            }),
        }
    }

    /// Exported descriptor, `-1` for anonymous memory.
    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    fn map(&self) -> MutexGuard<'_, MmapMut> {
        self.inner.map.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Copy `data` into the block at `offset`. Writes past the end are truncated.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> usize {
        let mut map = self.map();
        if offset >= map.len() {
            return 0;
        }
        let n = data.len().min(map.len() - offset);
        map[offset..offset + n].copy_from_slice(&data[..n]);
        n
    }

    /// Copy `len` bytes starting at `offset` out of the block.
    pub fn read(&self, offset: usize, len: usize) -> Bytes {
        let map = self.map();
        let start = offset.min(map.len());
        let end = offset.saturating_add(len).min(map.len());
        Bytes::copy_from_slice(&map[start..end])
    }

    pub fn to_bytes(&self) -> Bytes {
        self.read(0, self.inner.size)
    }

    /// Flush and/or invalidate CPU caches for the whole block.
    pub fn sync(&self, op: CacheOp) -> HalResult<()> {
        let map = self.map();
        if matches!(op, CacheOp::Clean | CacheOp::CleanInvalidate) {
            map.flush()?;
        }
        if matches!(op, CacheOp::Invalidate | CacheOp::CleanInvalidate) {
            // SAFETY: the range is exactly the live mapping held by the guard
            let rc = unsafe {
                libc::msync(
                    map.as_ptr() as *mut libc::c_void,
                    map.len(),
                    libc::MS_SYNC | libc::MS_INVALIDATE,
                )
            };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                error!(fd = self.inner.fd, "Cache invalidate failed: {}", err);
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Whether two views share the same memory.
    pub fn same_block(&self, other: &BufferBlock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Allocation capability behind every buffer pool.
pub trait MemoryBackend: Send + Sync {
    /// Allocate one block of exactly `size` bytes (callers align).
    fn allocate(&self, size: usize) -> HalResult<BufferBlock>;

    /// Give a block back. The default just drops the pool's view.
    fn release(&self, block: BufferBlock) {
        drop(block);
    }
}

/// Anonymous shared-memory file per buffer, so the fd can be handed to another process.
#[derive(Debug, Default)]
pub struct MemfdBackend;

impl MemoryBackend for MemfdBackend {
    fn allocate(&self, size: usize) -> HalResult<BufferBlock> {
        // SAFETY: name is a valid nul-terminated string
        let fd = unsafe {
            libc::memfd_create(
                b"camhal-buf\0".as_ptr() as *const libc::c_char,
                libc::MFD_CLOEXEC,
            )
        };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            return Err(HalError::NoMemory(format!("memfd_create failed: {err}")));
        }
        // SAFETY: fd was just created and is owned by nobody else
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(size as u64)
            .map_err(|e| HalError::NoMemory(format!("ftruncate({size}) failed: {e}")))?;
        // SAFETY: the file is private to this block and never resized afterwards
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| HalError::NoMemory(format!("mmap({size}) failed: {e}")))?;
        debug!(fd = file.as_raw_fd(), size, "Allocated memfd buffer");
        Ok(BufferBlock::new(fd, size, map, Some(file)))
    }
}

/// Process-private anonymous mappings, for buffers that never leave the HAL.
#[derive(Debug, Default)]
pub struct AnonBackend;

impl MemoryBackend for AnonBackend {
    fn allocate(&self, size: usize) -> HalResult<BufferBlock> {
        let map = MmapMut::map_anon(size)
            .map_err(|e| HalError::NoMemory(format!("anonymous mmap({size}) failed: {e}")))?;
        Ok(BufferBlock::new(-1, size, map, None))
    }
}

/// Round `size` up to the next page boundary.
pub fn page_align(size: usize) -> usize {
    let page = page_size::get();
    size.div_ceil(page) * page
}
