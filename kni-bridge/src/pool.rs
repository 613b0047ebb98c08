//! Packet buffer pool shared by the fast path and the kernel bridge
//!
//! Buffers are carved out of one anonymous mapping (hugepages if available)
//! and handed out through a lock-free free list, so any number of workers
//! and bridge handles can allocate and release concurrently.

use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};

/// Bytes reserved in front of the packet data of every buffer
pub const HEADROOM: usize = 128;

/// Default buffer size (headroom + 2048 bytes of data room)
pub const DEFAULT_BUFFER_SIZE: usize = HEADROOM + 2048;

/// Hugepage size used to round up hugetlb mappings
const HUGEPAGE_SIZE: usize = 2 * 1024 * 1024;

/// Fixed-size packet buffer pool
pub struct BufferPool {
    /// Base pointer to mmap'd region
    base: NonNull<u8>,
    /// Size of the mapped region (may exceed count * buffer_size)
    mapped: usize,
    buffer_size: usize,
    count: usize,
    /// Free list of buffer indices
    free: ArrayQueue<u32>,
}

// SAFETY: the mapping is owned by the pool and every buffer index is handed
// out to at most one PoolBuffer at a time through the ArrayQueue.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Create a pool of `count` buffers of `buffer_size` bytes each.
    ///
    /// Attempts 2MB hugepages first and falls back to regular pages.
    pub fn new(count: usize, buffer_size: usize) -> io::Result<Self> {
        if count == 0 || count > u32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer count out of range",
            ));
        }
        if buffer_size <= HEADROOM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer size must exceed headroom",
            ));
        }

        let size = count
            .checked_mul(buffer_size)
            .ok_or_else(|| io::Error::other("pool size overflow"))?;

        let (ptr, mapped, using_hugepages) = match Self::mmap_hugepages(size) {
            Ok((ptr, mapped)) => (ptr, mapped, true),
            Err(_) => (Self::mmap_regular(size)?, size, false),
        };

        let free = ArrayQueue::new(count);
        for i in 0..count {
            // Cannot fail: the queue holds exactly `count` slots
            let _ = free.push(i as u32);
        }

        tracing::debug!(
            count,
            buffer_size,
            hugepages = using_hugepages,
            "Buffer pool created"
        );

        Ok(Self {
            base: ptr,
            mapped,
            buffer_size,
            count,
            free,
        })
    }

    fn mmap_hugepages(size: usize) -> io::Result<(NonNull<u8>, usize)> {
        let mapped = size.div_ceil(HUGEPAGE_SIZE) * HUGEPAGE_SIZE;
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_HUGETLB;
        let ptr = Self::mmap(mapped, flags)?;
        Ok((ptr, mapped))
    }

    fn mmap_regular(size: usize) -> io::Result<NonNull<u8>> {
        Self::mmap(size, MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS)
    }

    fn mmap(size: usize, flags: MapFlags) -> io::Result<NonNull<u8>> {
        let len = NonZeroUsize::new(size).ok_or_else(|| io::Error::other("empty mapping"))?;
        // SAFETY: fresh anonymous mapping, no existing memory is aliased
        let ptr = unsafe {
            mmap_anonymous(None, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, flags)?
        };
        Ok(ptr.cast())
    }

    /// Allocate a buffer from the pool
    ///
    /// Returns `None` if the pool is exhausted.
    #[inline]
    pub fn alloc(self: &Arc<Self>) -> Option<PoolBuffer> {
        self.free.pop().map(|index| PoolBuffer {
            pool: Arc::clone(self),
            index,
            start: HEADROOM,
            len: 0,
        })
    }

    /// Allocate a buffer and copy `data` into it
    ///
    /// Returns `None` if the pool is exhausted or `data` exceeds the data room.
    pub fn alloc_from(self: &Arc<Self>, data: &[u8]) -> Option<PoolBuffer> {
        if data.len() > self.data_room() {
            return None;
        }
        let mut buf = self.alloc()?;
        buf.write_area()[..data.len()].copy_from_slice(data);
        buf.set_len(data.len());
        Some(buf)
    }

    /// Number of free buffers
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total number of buffers
    pub fn capacity(&self) -> usize {
        self.count
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Bytes available for packet data after the headroom
    pub fn data_room(&self) -> usize {
        self.buffer_size - HEADROOM
    }

    #[inline]
    fn buffer_ptr(&self, index: u32) -> *mut u8 {
        // SAFETY: index < count, enforced by the free list capacity
        unsafe { self.base.as_ptr().add(index as usize * self.buffer_size) }
    }

    #[inline]
    fn return_buffer(&self, index: u32) {
        // Cannot overflow: only indices taken from the queue come back
        let _ = self.free.push(index);
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // SAFETY: base/mapped describe the mapping created in new()
        unsafe {
            let _ = munmap(self.base.cast(), self.mapped);
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("count", &self.count)
            .field("buffer_size", &self.buffer_size)
            .field("available", &self.available())
            .finish()
    }
}

/// A buffer owned from the pool
///
/// Returns to its pool when dropped; dropping is how a buffer is freed.
pub struct PoolBuffer {
    pool: Arc<BufferPool>,
    index: u32,
    start: usize,
    len: usize,
}

impl PoolBuffer {
    /// Packet data
    #[inline]
    pub fn data(&self) -> &[u8] {
        // SAFETY: start + len never exceeds buffer_size (see set_len)
        unsafe {
            let ptr = self.pool.buffer_ptr(self.index).add(self.start);
            std::slice::from_raw_parts(ptr, self.len)
        }
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: start + len never exceeds buffer_size (see set_len)
        unsafe {
            let ptr = self.pool.buffer_ptr(self.index).add(self.start);
            std::slice::from_raw_parts_mut(ptr, self.len)
        }
    }

    /// Writable area from the data start to the end of the buffer
    ///
    /// Read a frame into this, then call [`set_len`](Self::set_len).
    #[inline]
    pub fn write_area(&mut self) -> &mut [u8] {
        // SAFETY: start is always within the buffer
        unsafe {
            let ptr = self.pool.buffer_ptr(self.index).add(self.start);
            std::slice::from_raw_parts_mut(ptr, self.pool.buffer_size - self.start)
        }
    }

    /// Set the length of valid data, clamped to the buffer end
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.pool.buffer_size - self.start);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The pool this buffer returns to
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Reset to an empty buffer with full headroom
    #[inline]
    pub fn reset(&mut self) {
        self.start = HEADROOM;
        self.len = 0;
    }
}

impl Drop for PoolBuffer {
    #[inline]
    fn drop(&mut self) {
        self.pool.return_buffer(self.index);
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(count: usize) -> Arc<BufferPool> {
        Arc::new(BufferPool::new(count, DEFAULT_BUFFER_SIZE).expect("Failed to create pool"))
    }

    #[test]
    fn test_pool_creation() {
        let pool = pool(16);
        assert_eq!(pool.available(), 16);
        assert_eq!(pool.capacity(), 16);
        assert_eq!(pool.data_room(), 2048);
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(BufferPool::new(0, DEFAULT_BUFFER_SIZE).is_err());
        assert!(BufferPool::new(4, HEADROOM).is_err());
    }

    #[test]
    fn test_buffer_alloc_and_drop() {
        let pool = pool(4);
        {
            let _buf = pool.alloc().expect("Failed to alloc");
            assert_eq!(pool.available(), 3);
        }
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_alloc_from() {
        let pool = pool(4);
        let buf = pool.alloc_from(b"hello").expect("Failed to alloc");
        assert_eq!(buf.data(), b"hello");
        assert_eq!(buf.len(), 5);
        assert!(Arc::ptr_eq(buf.pool(), &pool));

        let too_big = vec![0u8; pool.data_room() + 1];
        assert!(pool.alloc_from(&too_big).is_none());
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_set_len_clamps() {
        let pool = pool(1);
        let mut buf = pool.alloc().expect("Failed to alloc");
        buf.set_len(usize::MAX);
        assert_eq!(buf.len(), pool.data_room());
        buf.reset();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = pool(8);
        let mut buffers: Vec<_> = (0..8).map(|_| pool.alloc().expect("alloc")).collect();

        assert!(pool.alloc().is_none());
        assert_eq!(pool.available(), 0);

        buffers.pop();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_buffers_do_not_overlap() {
        let pool = pool(2);
        let mut a = pool.alloc().expect("alloc");
        let mut b = pool.alloc().expect("alloc");
        a.write_area().fill(0xaa);
        b.write_area().fill(0xbb);
        a.set_len(pool.data_room());
        assert!(a.data().iter().all(|&x| x == 0xaa));
    }

    #[test]
    fn test_buffer_send_across_threads() {
        let pool = pool(2);
        let buf = pool.alloc_from(b"hello").expect("alloc");

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            tx.send(buf).unwrap();
        });

        let received = rx.recv().unwrap();
        assert_eq!(received.data(), b"hello");
    }
}
