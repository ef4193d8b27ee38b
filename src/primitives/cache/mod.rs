#![forbid(unsafe_code)]
//! Page cache: pins fixed-size pages in memory and writes dirty ones back.

mod frame;

use std::sync::Arc;

use lru::LruCache;
use parking_lot::{lock_api::ArcRwLockWriteGuard, Mutex, RawRwLock};
use tracing::{debug, trace, warn};

use self::frame::Frame;
use crate::primitives::io::FileIo;
use crate::types::{PageId, Result, StrataError, VolumeId};

type PageGuard = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

/// Interface the object manager uses to reach page images.
///
/// A pinned page stays resident until it is unpinned. Pinning the same page
/// twice without releasing it in between blocks the caller.
pub trait PageCache: Send + Sync {
    /// Size of every page in bytes.
    fn page_size(&self) -> usize;
    /// Pins an existing page, reading it from the backing store on a miss.
    fn pin(&self, id: PageId) -> Result<PinnedPage<'_>>;
    /// Pins a freshly allocated page without reading it; the image starts zeroed.
    fn pin_new(&self, id: PageId) -> Result<PinnedPage<'_>>;
    /// Drops one pin on `id`.
    fn unpin(&self, id: PageId) -> Result<()>;
    /// Marks the cached image of `id` as needing write-back.
    fn mark_dirty(&self, id: PageId) -> Result<()>;
    /// Writes every dirty unpinned page to the backing store.
    fn flush(&self) -> Result<()>;
}

/// Exclusive access to one pinned page; unpins on drop.
pub struct PinnedPage<'a> {
    id: PageId,
    cache: &'a dyn PageCache,
    guard: PageGuard,
    unpinned: bool,
}

impl<'a> PinnedPage<'a> {
    /// Wraps a write guard obtained by a [`PageCache`] implementation.
    pub fn new(id: PageId, cache: &'a dyn PageCache, guard: PageGuard) -> Self {
        Self {
            id,
            cache,
            guard,
            unpinned: false,
        }
    }

    /// Identity of the pinned page.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// The page image.
    pub fn data(&self) -> &[u8] {
        &self.guard[..]
    }

    /// The page image, writable. Call [`PinnedPage::mark_dirty`] after changing it.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.guard[..]
    }

    /// Schedules the page for write-back.
    pub fn mark_dirty(&self) -> Result<()> {
        self.cache.mark_dirty(self.id)
    }

    /// Unpins the page, surfacing any cache error.
    ///
    /// The write guard is dropped when `self` goes out of scope at the end
    /// of this call.
    pub fn release(mut self) -> Result<()> {
        self.unpinned = true;
        self.cache.unpin(self.id)
    }
}

impl Drop for PinnedPage<'_> {
    fn drop(&mut self) {
        if !self.unpinned {
            if let Err(err) = self.cache.unpin(self.id) {
                warn!(page = %self.id, error = %err, "cache.pinned_page.unpin_failed");
            }
        }
    }
}

/// Counters exposed by [`BufferPool::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of frames evicted to make room.
    pub evictions: u64,
    /// Number of dirty pages written back.
    pub dirty_writebacks: u64,
}

struct PoolInner {
    frames: LruCache<PageId, Frame>,
    stats: PoolStats,
}

/// LRU buffer pool over a [`FileIo`] holding the pages of one volume.
pub struct BufferPool {
    io: Arc<dyn FileIo>,
    volume: VolumeId,
    page_size: usize,
    capacity: usize,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    /// A pool of up to `capacity` frames over the pages of `volume` in `io`.
    pub fn new(
        io: Arc<dyn FileIo>,
        volume: VolumeId,
        page_size: usize,
        capacity: usize,
    ) -> Result<Self> {
        if page_size == 0 {
            return Err(StrataError::Invalid("page size must be positive"));
        }
        if capacity == 0 {
            return Err(StrataError::Invalid("buffer pool needs at least one frame"));
        }
        Ok(Self {
            io,
            volume,
            page_size,
            capacity,
            inner: Mutex::new(PoolInner {
                frames: LruCache::unbounded(),
                stats: PoolStats::default(),
            }),
        })
    }

    /// Snapshot of the hit, miss and eviction counters.
    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats
    }

    /// Number of frames currently resident.
    pub fn resident(&self) -> usize {
        self.inner.lock().frames.len()
    }

    fn offset_of(&self, id: PageId) -> Result<u64> {
        if id.volume != self.volume {
            return Err(StrataError::Invalid("page belongs to another volume"));
        }
        (id.page_no.0 as u64)
            .checked_mul(self.page_size as u64)
            .ok_or(StrataError::Invalid("page offset overflow"))
    }

    fn write_back(&self, id: PageId, frame: &Frame, stats: &mut PoolStats) -> Result<()> {
        let offset = self.offset_of(id)?;
        let image = frame.buf.read();
        self.io.write_at(offset, &image)?;
        stats.dirty_writebacks += 1;
        trace!(page = %id, "cache.write_back");
        Ok(())
    }

    fn make_room(&self, inner: &mut PoolInner) -> Result<()> {
        while inner.frames.len() >= self.capacity {
            let victim = inner
                .frames
                .iter()
                .rev()
                .find(|(_, frame)| frame.is_evictable())
                .map(|(id, _)| *id);
            let Some(victim) = victim else {
                return Err(StrataError::CacheFull(self.capacity));
            };
            if let Some(frame) = inner.frames.pop(&victim) {
                if frame.dirty {
                    self.write_back(victim, &frame, &mut inner.stats)?;
                }
                inner.stats.evictions += 1;
                debug!(page = %victim, "cache.evict");
            }
        }
        Ok(())
    }
}

impl PageCache for BufferPool {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn pin(&self, id: PageId) -> Result<PinnedPage<'_>> {
        let offset = self.offset_of(id)?;
        let buf = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if let Some(frame) = inner.frames.get_mut(&id) {
                frame.pin_count += 1;
                inner.stats.hits += 1;
                Arc::clone(&frame.buf)
            } else {
                self.make_room(inner)?;
                let mut image = vec![0u8; self.page_size].into_boxed_slice();
                self.io.read_at(offset, &mut image)?;
                let mut frame = Frame::with_image(image);
                frame.pin_count = 1;
                let buf = Arc::clone(&frame.buf);
                inner.frames.put(id, frame);
                inner.stats.misses += 1;
                buf
            }
        };
        Ok(PinnedPage::new(id, self, buf.write_arc()))
    }

    fn pin_new(&self, id: PageId) -> Result<PinnedPage<'_>> {
        self.offset_of(id)?;
        let buf = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if let Some(frame) = inner.frames.get_mut(&id) {
                frame.pin_count += 1;
                frame.dirty = true;
                Arc::clone(&frame.buf)
            } else {
                self.make_room(inner)?;
                let mut frame = Frame::zeroed(self.page_size);
                frame.pin_count = 1;
                frame.dirty = true;
                let buf = Arc::clone(&frame.buf);
                inner.frames.put(id, frame);
                buf
            }
        };
        let mut page_guard = buf.write_arc();
        page_guard.fill(0);
        Ok(PinnedPage::new(id, self, page_guard))
    }

    fn unpin(&self, id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        let frame = inner
            .frames
            .peek_mut(&id)
            .ok_or(StrataError::Invalid("unpin of a page that is not cached"))?;
        if frame.pin_count == 0 {
            return Err(StrataError::Invalid("unpin of a page that is not pinned"));
        }
        frame.pin_count -= 1;
        Ok(())
    }

    fn mark_dirty(&self, id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        let frame = inner
            .frames
            .peek_mut(&id)
            .ok_or(StrataError::Invalid("mark_dirty of a page that is not cached"))?;
        frame.dirty = true;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut skipped = 0usize;
        let dirty: Vec<PageId> = inner
            .frames
            .iter()
            .filter(|(_, frame)| frame.dirty)
            .map(|(id, _)| *id)
            .collect();
        for id in dirty {
            let Some(frame) = inner.frames.peek_mut(&id) else {
                continue;
            };
            if !frame.is_evictable() {
                skipped += 1;
                continue;
            }
            let offset = self.offset_of(id)?;
            self.io.write_at(offset, &frame.buf.read())?;
            frame.dirty = false;
            inner.stats.dirty_writebacks += 1;
        }
        if skipped > 0 {
            warn!(skipped, "cache.flush.pinned_pages_skipped");
        }
        self.io.sync_all()
    }
}
