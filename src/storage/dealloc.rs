//! Deferred deallocation: pages recorded for release once the caller decides to free them.
//!
//! The pool bounds how many entries may be outstanding; the list owns the
//! entries themselves. Both belong to the caller.

use std::collections::VecDeque;

use tracing::debug;

use crate::storage::extent::ExtentAllocator;
use crate::types::{PageId, Result, StrataError};

/// Something waiting to be physically released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeallocEntry {
    /// A data page unlinked from its file.
    Page(PageId),
}

/// Fixed-capacity source of list elements.
#[derive(Debug)]
pub struct DeallocPool {
    capacity: usize,
    taken: usize,
}

impl DeallocPool {
    /// A pool with `capacity` elements, none taken.
    pub fn new(capacity: usize) -> Self {
        Self { capacity, taken: 0 }
    }

    /// Total elements the pool was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Elements still available.
    pub fn available(&self) -> usize {
        self.capacity - self.taken
    }

    fn take(&mut self) -> Result<()> {
        if self.taken == self.capacity {
            return Err(StrataError::PoolExhausted {
                capacity: self.capacity,
            });
        }
        self.taken += 1;
        Ok(())
    }

    fn give_back(&mut self, n: usize) {
        self.taken = self.taken.saturating_sub(n);
    }
}

/// Entries in most-recent-first order.
#[derive(Debug, Default)]
pub struct DeallocList {
    entries: VecDeque<DeallocEntry>,
}

impl DeallocList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries, most recent first.
    pub fn iter(&self) -> impl Iterator<Item = &DeallocEntry> {
        self.entries.iter()
    }

    /// True when `entry` is queued.
    pub fn contains(&self, entry: &DeallocEntry) -> bool {
        self.entries.contains(entry)
    }

    /// Empties the list, returning its elements to `pool`.
    pub fn drain(&mut self, pool: &mut DeallocPool) -> Vec<DeallocEntry> {
        let drained: Vec<DeallocEntry> = self.entries.drain(..).collect();
        pool.give_back(drained.len());
        drained
    }
}

/// Records `page` at the head of `list`, drawing one element from `pool`.
pub fn enqueue_for_deallocation(
    pool: &mut DeallocPool,
    list: &mut DeallocList,
    page: PageId,
) -> Result<()> {
    pool.take()?;
    list.entries.push_front(DeallocEntry::Page(page));
    debug!(page = %page, pending = list.len(), "dealloc.enqueue");
    Ok(())
}

/// Drains `list` and hands every queued page back to `extents`.
pub fn release_deallocated(
    list: &mut DeallocList,
    pool: &mut DeallocPool,
    extents: &dyn ExtentAllocator,
) -> Result<usize> {
    let pages: Vec<PageId> = list
        .iter()
        .map(|entry| match entry {
            DeallocEntry::Page(page) => *page,
        })
        .collect();
    extents.free_pages(&pages)?;
    list.drain(pool);
    debug!(released = pages.len(), "dealloc.release");
    Ok(pages.len())
}
