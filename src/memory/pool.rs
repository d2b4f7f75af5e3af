use std::alloc::{Layout, alloc, dealloc};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::PoolStats;

/// Cache-line alignment for chunk starts and counter padding.
const CACHE_LINE: usize = 64;
/// Hard per-chunk ceiling.
const MAX_CHUNK: usize = 64 * 1024 * 1024;

/// Per-collection memory pool handing out cache-line-aligned chunks up
/// to 64 MiB each under a configurable overall cap. Counters are padded
/// to a cache line. Never a process-wide singleton.
pub struct MemoryPool {
    chunks: Vec<Chunk>,
    free: Vec<usize>,
    capacity: usize,
    allocated: CachePadded<AtomicUsize>,
    used: CachePadded<AtomicUsize>,
}

struct Chunk {
    ptr: *mut u8,
    size: usize,
    in_use: bool,
}

// Chunk pointers are owned exclusively by the pool; handles are plain
// indices validated on release.
unsafe impl Send for MemoryPool {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHandle(usize);

impl MemoryPool {
    pub fn new(capacity: usize) -> Self {
        MemoryPool {
            chunks: Vec::new(),
            free: Vec::new(),
            capacity,
            allocated: CachePadded::new(AtomicUsize::new(0)),
            used: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Acquire a chunk of at least `size` bytes. Reuses a free chunk when
    /// one is big enough, otherwise allocates a new aligned chunk.
    pub fn acquire(&mut self, size: usize) -> Result<ChunkHandle> {
        if size == 0 || size > MAX_CHUNK {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("chunk size {} outside (0, {}]", size, MAX_CHUNK),
            ));
        }
        if let Some(pos) = self.free.iter().position(|&i| self.chunks[i].size >= size) {
            let idx = self.free.swap_remove(pos);
            self.chunks[idx].in_use = true;
            self.used.fetch_add(self.chunks[idx].size, Ordering::Relaxed);
            return Ok(ChunkHandle(idx));
        }

        let allocated = self.allocated.load(Ordering::Relaxed);
        if allocated + size > self.capacity {
            return Err(Error::new(
                ErrorKind::OutOfMemory,
                format!("pool capacity {} exceeded by request of {}", self.capacity, size),
            ));
        }
        let layout = Layout::from_size_align(size, CACHE_LINE)
            .map_err(|e| Error::new(ErrorKind::InvalidArgument, e.to_string()))?;
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return Err(Error::new(ErrorKind::OutOfMemory, "allocation failed".to_string()));
        }
        self.chunks.push(Chunk { ptr, size, in_use: true });
        self.allocated.fetch_add(size, Ordering::Relaxed);
        self.used.fetch_add(size, Ordering::Relaxed);
        Ok(ChunkHandle(self.chunks.len() - 1))
    }

    pub fn release(&mut self, handle: ChunkHandle) {
        if let Some(chunk) = self.chunks.get_mut(handle.0) {
            if chunk.in_use {
                chunk.in_use = false;
                self.used.fetch_sub(chunk.size, Ordering::Relaxed);
                self.free.push(handle.0);
            }
        }
    }

    pub fn chunk_slice_mut(&mut self, handle: ChunkHandle) -> Option<&mut [u8]> {
        let chunk = self.chunks.get(handle.0)?;
        if !chunk.in_use {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts_mut(chunk.ptr, chunk.size) })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated_bytes: self.allocated.load(Ordering::Relaxed),
            used_bytes: self.used.load(Ordering::Relaxed),
            capacity_bytes: self.capacity,
            chunk_count: self.chunks.len(),
        }
    }

    pub fn clear(&mut self) {
        for (i, chunk) in self.chunks.iter_mut().enumerate() {
            if chunk.in_use {
                chunk.in_use = false;
                self.free.push(i);
            }
        }
        self.used.store(0, Ordering::Relaxed);
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        for chunk in &self.chunks {
            unsafe {
                dealloc(chunk.ptr, Layout::from_size_align_unchecked(chunk.size, CACHE_LINE));
            }
        }
    }
}

/// Recycler for kernel scratch vectors, so the vectorized path does not
/// allocate per batch.
#[derive(Debug, Default)]
pub struct ScratchPool {
    f64_bufs: Vec<Vec<f64>>,
}

impl ScratchPool {
    pub fn new() -> Self {
        ScratchPool::default()
    }

    pub fn take_f64(&mut self, len: usize) -> Vec<f64> {
        match self.f64_bufs.pop() {
            Some(mut buf) => {
                buf.clear();
                buf.resize(len, 0.0);
                buf
            }
            None => vec![0.0; len],
        }
    }

    pub fn give_f64(&mut self, buf: Vec<f64>) {
        if self.f64_bufs.len() < 16 {
            self.f64_bufs.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_reuse() {
        let mut pool = MemoryPool::new(1024 * 1024);
        let a = pool.acquire(4096).unwrap();
        assert_eq!(pool.stats().used_bytes, 4096);
        pool.release(a);
        assert_eq!(pool.stats().used_bytes, 0);

        // The freed chunk is reused, not reallocated.
        let _b = pool.acquire(1024).unwrap();
        assert_eq!(pool.stats().chunk_count, 1);
        assert_eq!(pool.stats().allocated_bytes, 4096);
    }

    #[test]
    fn test_capacity_cap() {
        let mut pool = MemoryPool::new(8192);
        let _a = pool.acquire(8192).unwrap();
        let err = pool.acquire(64).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutOfMemory);
    }

    #[test]
    fn test_alignment() {
        let mut pool = MemoryPool::new(1024 * 1024);
        let handle = pool.acquire(128).unwrap();
        let slice = pool.chunk_slice_mut(handle).unwrap();
        assert_eq!(slice.as_ptr() as usize % CACHE_LINE, 0);
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let mut pool = MemoryPool::new(usize::MAX);
        assert!(pool.acquire(MAX_CHUNK + 1).is_err());
        assert!(pool.acquire(0).is_err());
    }

    #[test]
    fn test_scratch_recycling() {
        let mut scratch = ScratchPool::new();
        let buf = scratch.take_f64(256);
        let ptr = buf.as_ptr();
        scratch.give_f64(buf);
        let again = scratch.take_f64(100);
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(again.len(), 100);
    }
}
