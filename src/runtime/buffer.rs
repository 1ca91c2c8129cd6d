//! Pooled buffer arena.
//!
//! Provides chunk allocation without per-operation malloc overhead.
//! The arena owns a fixed set of large pages; each page hands out
//! power-of-two sized chunks, carving fresh regions from its tail and
//! recycling released chunks through lock-free free lists.
//!
//! ## Ownership
//!
//! A [`Chunk`] has exactly one owner. Releasing consumes it, and `Drop`
//! is the only path back to the page, so a chunk cannot be released twice
//! or touched after release. Page memory is reference counted by `bytes`
//! and outlives every chunk carved from it.
//!
//! ## Read Buffers
//!
//! [`ReadBuffer`] wraps a chunk with read/write cursors. The frame decoder
//! is the only code that moves the read cursor.

use bytes::BytesMut;
use crossbeam::queue::SegQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Smallest chunk size class (64 bytes).
const MIN_CLASS_SHIFT: u32 = 6;

/// Counters shared by the arena and its pages.
#[derive(Debug, Default)]
struct ArenaCounters {
    allocations: AtomicU64,
    recycled: AtomicU64,
    carved: AtomicU64,
    unpooled: AtomicU64,
    releases: AtomicU64,
}

/// Point-in-time snapshot of arena activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Chunks handed out (pooled and unpooled).
    pub allocations: u64,
    /// Allocations served from a free list.
    pub recycled: u64,
    /// Allocations carved from a page tail.
    pub carved: u64,
    /// Allocations that fell back to the heap.
    pub unpooled: u64,
    /// Pooled chunks returned to their page.
    pub releases: u64,
}

/// Arena of pre-allocated pages shared by all workers.
pub struct BufferArena {
    pages: Box<[Arc<Page>]>,
    /// Round-robin cursor for callers without page affinity.
    cursor: AtomicUsize,
    max_chunk_size: usize,
    counters: Arc<ArenaCounters>,
}

impl BufferArena {
    /// Create an arena with `page_count` pages of `page_size` bytes.
    ///
    /// `max_chunk_size` must not exceed `page_size`; configuration
    /// validation enforces this before an arena is built.
    pub fn new(page_count: usize, page_size: usize, max_chunk_size: usize) -> Self {
        debug_assert!(max_chunk_size <= page_size, "chunk ceiling exceeds page size");
        let counters = Arc::new(ArenaCounters::default());
        let pages = (0..page_count.max(1))
            .map(|id| Arc::new(Page::new(id, page_size, Arc::clone(&counters))))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        debug!(
            pages = pages.len(),
            page_size, max_chunk_size, "Buffer arena allocated"
        );

        Self {
            pages,
            cursor: AtomicUsize::new(0),
            max_chunk_size,
            counters,
        }
    }

    /// Allocate a chunk of at least `len` bytes from any page.
    pub fn allocate(&self, len: usize) -> Chunk {
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.allocate_near(start, len)
    }

    /// Allocate a chunk, trying page `hint` first.
    ///
    /// Workers pass their own index so a session's buffers tend to come
    /// from the same page.
    pub fn allocate_near(&self, hint: usize, len: usize) -> Chunk {
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);

        if len <= self.max_chunk_size {
            let count = self.pages.len();
            for i in 0..count {
                if let Some(chunk) = self.pages[(hint + i) % count].allocate(len) {
                    return chunk;
                }
            }
            debug!(len, "Arena pages exhausted, allocating unpooled chunk");
        } else {
            trace!(len, max = self.max_chunk_size, "Chunk exceeds ceiling, allocating unpooled");
        }

        self.counters.unpooled.fetch_add(1, Ordering::Relaxed);
        Chunk::unpooled(len)
    }

    /// Number of pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Largest chunk served from a page.
    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Snapshot of allocation counters.
    pub fn stats(&self) -> ArenaStats {
        let c = &self.counters;
        ArenaStats {
            allocations: c.allocations.load(Ordering::Relaxed),
            recycled: c.recycled.load(Ordering::Relaxed),
            carved: c.carved.load(Ordering::Relaxed),
            unpooled: c.unpooled.load(Ordering::Relaxed),
            releases: c.releases.load(Ordering::Relaxed),
        }
    }
}

/// A large memory block subdivided into chunks.
///
/// Many threads may allocate from and release into the same page. Free
/// lists are lock-free; only carving a fresh region locks the tail.
pub struct Page {
    id: usize,
    size: usize,
    /// Uncarved remainder of the page.
    tail: Mutex<BytesMut>,
    /// Released chunks, one queue per size class.
    free: Box<[SegQueue<BytesMut>]>,
    counters: Arc<ArenaCounters>,
}

impl Page {
    fn new(id: usize, size: usize, counters: Arc<ArenaCounters>) -> Self {
        let classes = size_class(size.max(1)).0 + 1;
        Self {
            id,
            size,
            tail: Mutex::new(BytesMut::zeroed(size)),
            free: (0..classes).map(|_| SegQueue::new()).collect(),
            counters,
        }
    }

    /// Page index within the arena.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Page size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Allocate a chunk of at least `len` bytes.
    ///
    /// Returns `None` when the request does not fit the page or the page
    /// has neither a recycled chunk nor tail room for it.
    pub fn allocate(self: &Arc<Self>, len: usize) -> Option<Chunk> {
        let (class, class_size) = size_class(len);
        if class_size > self.size {
            return None;
        }

        if let Some(buf) = self.free[class].pop() {
            self.counters.recycled.fetch_add(1, Ordering::Relaxed);
            return Some(Chunk::pooled(buf, len, Arc::clone(self), class));
        }

        let buf = {
            let mut tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
            if tail.len() < class_size {
                return None;
            }
            tail.split_to(class_size)
        };
        self.counters.carved.fetch_add(1, Ordering::Relaxed);
        Some(Chunk::pooled(buf, len, Arc::clone(self), class))
    }

    /// Bytes not yet carved into chunks.
    pub fn remaining(&self) -> usize {
        self.tail.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn recycle(&self, class: usize, buf: BytesMut) {
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        self.free[class].push(buf);
    }
}

/// Map a length to its size class index and class size.
fn size_class(len: usize) -> (usize, usize) {
    let size = len.max(1 << MIN_CLASS_SHIFT).next_power_of_two();
    ((size.trailing_zeros() - MIN_CLASS_SHIFT) as usize, size)
}

/// An exclusively owned buffer leased from a [`Page`].
///
/// Dereferences to the first `len()` bytes. The full class-sized region
/// is available through [`Chunk::capacity_mut`].
pub struct Chunk {
    buf: BytesMut,
    len: usize,
    origin: Option<(Arc<Page>, usize)>,
}

impl Chunk {
    fn pooled(buf: BytesMut, len: usize, page: Arc<Page>, class: usize) -> Self {
        Self {
            buf,
            len,
            origin: Some((page, class)),
        }
    }

    /// Heap chunk that is not backed by any page.
    pub fn unpooled(len: usize) -> Self {
        Self {
            buf: BytesMut::zeroed(len),
            len,
            origin: None,
        }
    }

    /// Logical length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Usable bytes, at least `len()`.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Change the logical length.
    ///
    /// # Panics
    /// Panics if `len` exceeds `capacity()`.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.buf.len(), "chunk length exceeds capacity");
        self.len = len;
    }

    /// The whole writable region, ignoring the logical length.
    pub fn capacity_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    /// Whether this chunk returns to a page on release.
    pub fn is_pooled(&self) -> bool {
        self.origin.is_some()
    }

    /// Id of the page this chunk was carved from.
    pub fn page_id(&self) -> Option<usize> {
        self.origin.as_ref().map(|(page, _)| page.id())
    }

    /// Return the chunk to its page.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let Some((page, class)) = self.origin.take() {
            page.recycle(class, std::mem::take(&mut self.buf));
        }
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl DerefMut for Chunk {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("page", &self.page_id())
            .finish()
    }
}

/// Session read buffer: a chunk with read and write cursors.
///
/// ```text
/// 0        start          end           capacity
/// |consumed|  buffered    |  append room |
/// ```
#[derive(Debug)]
pub struct ReadBuffer {
    chunk: Chunk,
    start: usize,
    end: usize,
}

impl ReadBuffer {
    /// Wrap a chunk; its logical length is the buffer capacity.
    pub fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            start: 0,
            end: 0,
        }
    }

    /// Buffered, not yet consumed bytes.
    pub fn peek(&self) -> &[u8] {
        &self.chunk[self.start..self.end]
    }

    /// Consume `n` buffered bytes.
    ///
    /// # Panics
    /// Panics if `n` exceeds the buffered length.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len(), "advance past buffered data");
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Writable region after the buffered bytes.
    pub fn append_capacity(&mut self) -> &mut [u8] {
        let end = self.end;
        &mut self.chunk[end..]
    }

    /// Mark `n` bytes of the append region as buffered.
    pub fn commit(&mut self, n: usize) {
        assert!(self.end + n <= self.chunk.len(), "commit past capacity");
        self.end += n;
    }

    /// Move buffered bytes to the front of the chunk.
    pub fn compact(&mut self) {
        if self.start > 0 {
            self.chunk.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }

    /// Copy as much of `data` as fits, compacting first. Returns bytes copied.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> usize {
        self.compact();
        let room = self.append_capacity();
        let n = room.len().min(data.len());
        room[..n].copy_from_slice(&data[..n]);
        self.commit(n);
        n
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn capacity(&self) -> usize {
        self.chunk.len()
    }

    /// True when the buffered bytes occupy the entire chunk.
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Give the chunk back, discarding buffered data.
    pub fn into_chunk(self) -> Chunk {
        self.chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class() {
        assert_eq!(size_class(0), (0, 64));
        assert_eq!(size_class(64), (0, 64));
        assert_eq!(size_class(65), (1, 128));
        assert_eq!(size_class(4096), (6, 4096));
    }

    #[test]
    fn test_arena_carve_and_recycle() {
        let arena = BufferArena::new(1, 4096, 1024);

        let chunk = arena.allocate(100);
        assert_eq!(chunk.len(), 100);
        assert_eq!(chunk.capacity(), 128);
        assert!(chunk.is_pooled());
        assert_eq!(chunk.page_id(), Some(0));
        assert_eq!(arena.pages[0].remaining(), 4096 - 128);

        chunk.release();
        let stats = arena.stats();
        assert_eq!(stats.carved, 1);
        assert_eq!(stats.releases, 1);

        // Same size class is served from the free list
        let again = arena.allocate(120);
        assert_eq!(again.capacity(), 128);
        assert_eq!(arena.stats().recycled, 1);
        assert_eq!(arena.stats().carved, 1);
        assert_eq!(arena.pages[0].remaining(), 4096 - 128);
    }

    #[test]
    fn test_page_exhaustion_falls_back_to_heap() {
        let arena = BufferArena::new(1, 1024, 1024);

        let a = arena.allocate(512);
        let b = arena.allocate(512);
        assert!(a.is_pooled() && b.is_pooled());

        // Page is fully carved and nothing has been released
        let c = arena.allocate(512);
        assert!(!c.is_pooled());
        assert_eq!(arena.stats().unpooled, 1);

        // Releasing makes the region available again
        drop(a);
        let d = arena.allocate(300);
        assert!(d.is_pooled());
    }

    #[test]
    fn test_oversized_request_is_unpooled() {
        let arena = BufferArena::new(2, 4096, 1024);
        let chunk = arena.allocate(2048);
        assert!(!chunk.is_pooled());
        assert_eq!(chunk.len(), 2048);
        // Dropping an unpooled chunk does not count as a page release
        drop(chunk);
        assert_eq!(arena.stats().releases, 0);
    }

    #[test]
    fn test_allocate_near_prefers_hint() {
        let arena = BufferArena::new(4, 4096, 1024);
        assert_eq!(arena.allocate_near(2, 64).page_id(), Some(2));
        assert_eq!(arena.allocate_near(5, 64).page_id(), Some(1));
    }

    #[test]
    fn test_chunk_outlives_arena() {
        let arena = BufferArena::new(1, 4096, 1024);
        let mut chunk = arena.allocate(16);
        drop(arena);
        chunk.copy_from_slice(&[7u8; 16]);
        assert_eq!(&chunk[..], &[7u8; 16]);
    }

    #[test]
    fn test_concurrent_allocate_release() {
        let arena = Arc::new(BufferArena::new(2, 64 * 1024, 4096));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let arena = Arc::clone(&arena);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        let chunk = arena.allocate(64 + i % 512);
                        assert!(chunk.len() >= 64);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stats = arena.stats();
        assert_eq!(stats.allocations, 4000);
        assert_eq!(stats.releases + stats.unpooled, 4000);
    }

    #[test]
    fn test_read_buffer_cursors() {
        let mut buf = ReadBuffer::new(Chunk::unpooled(8));
        assert_eq!(buf.capacity(), 8);

        assert_eq!(buf.extend_from_slice(b"abcdef"), 6);
        assert_eq!(buf.peek(), b"abcdef");

        buf.advance(4);
        assert_eq!(buf.peek(), b"ef");
        assert_eq!(buf.append_capacity().len(), 2);

        // Compaction happens before appending
        assert_eq!(buf.extend_from_slice(b"ghijklmn"), 6);
        assert_eq!(buf.peek(), b"efghijkl");
        assert!(buf.is_full());

        buf.advance(8);
        assert!(buf.is_empty());
        assert_eq!(buf.append_capacity().len(), 8);
    }
}
