#![forbid(unsafe_code)]
//! Extent bookkeeping: which file owns each run of pages and which pages are in use.

use parking_lot::Mutex;
use tracing::debug;

use crate::storage::page::{get_u32, put_u32};
use crate::types::{ExtentNo, FileId, PageId, PageNo, Result, StrataError, VolumeId};

/// Grants and reclaims pages on behalf of files.
pub trait ExtentAllocator: Send + Sync {
    /// Allocates `count` consecutive pages for `file` and returns the first one.
    ///
    /// Extents already owned by the file are preferred, starting with the one
    /// holding `near`; an extent is only filled up to `fill_factor` percent
    /// before another one is claimed.
    fn allocate_pages(
        &self,
        file: FileId,
        first_extent: Option<ExtentNo>,
        near: Option<PageId>,
        fill_factor: u8,
        count: usize,
    ) -> Result<PageId>;
    /// Extent containing `page`.
    fn extent_of(&self, page: PageId) -> ExtentNo;
    /// Returns `pages` to their extents.
    fn free_pages(&self, pages: &[PageId]) -> Result<()>;
}

/// Owner value of an extent no file holds.
pub const OWNER_FREE: u32 = 0;
/// Owner value of the extent holding the volume's system pages.
pub const OWNER_SYSTEM: u32 = u32::MAX;
/// Bytes one extent occupies in [`ExtentMap::encode`] output.
pub const EXTENT_RECORD_LEN: usize = 8;

/// Ownership and page usage of one extent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtentRecord {
    /// File serial owning the extent, or [`OWNER_FREE`] / [`OWNER_SYSTEM`].
    pub owner: u32,
    /// Bitmap of allocated pages, bit `i` for page `i` of the extent.
    pub used: u32,
}

impl ExtentRecord {
    fn used_pages(&self) -> u32 {
        self.used.count_ones()
    }
}

/// In-memory extent table of one volume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtentMap {
    pages_per_extent: u32,
    max_extents: usize,
    extents: Vec<ExtentRecord>,
}

impl ExtentMap {
    /// A fresh map whose extent 0 holds the `system_pages` reserved pages.
    pub fn new(pages_per_extent: u32, max_extents: usize, system_pages: u32) -> Result<Self> {
        if !(1..=32).contains(&pages_per_extent) {
            return Err(StrataError::Invalid("pages per extent must be within 1..=32"));
        }
        if system_pages > pages_per_extent || max_extents < 2 {
            return Err(StrataError::Invalid("extent map too small for system pages"));
        }
        let reserved = if system_pages == 32 {
            u32::MAX
        } else {
            (1u32 << system_pages) - 1
        };
        Ok(Self {
            pages_per_extent,
            max_extents,
            extents: vec![ExtentRecord {
                owner: OWNER_SYSTEM,
                used: reserved,
            }],
        })
    }

    /// Pages each extent spans.
    pub fn pages_per_extent(&self) -> u32 {
        self.pages_per_extent
    }

    /// Number of extents in use by the volume file.
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// True when the map has no extents.
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Record of `extent`, if the map covers it.
    pub fn record(&self, extent: ExtentNo) -> Option<ExtentRecord> {
        self.extents.get(extent.0 as usize).copied()
    }

    /// Number of pages the volume file must span to cover every extent.
    pub fn page_count(&self) -> u32 {
        self.extents.len() as u32 * self.pages_per_extent
    }

    /// Serialises the table as `count u32` followed by `(owner, used)` records.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        let needed = 4 + self.extents.len() * EXTENT_RECORD_LEN;
        if dst.len() < needed {
            return Err(StrataError::Invalid("extent map does not fit destination"));
        }
        put_u32(dst, 0..4, self.extents.len() as u32);
        for (i, record) in self.extents.iter().enumerate() {
            let at = 4 + i * EXTENT_RECORD_LEN;
            put_u32(dst, at..at + 4, record.owner);
            put_u32(dst, at + 4..at + 8, record.used);
        }
        Ok(())
    }

    /// Reads a table written by [`ExtentMap::encode`].
    pub fn decode(src: &[u8], pages_per_extent: u32, max_extents: usize) -> Result<Self> {
        if src.len() < 4 {
            return Err(StrataError::Corruption("extent map truncated"));
        }
        let count = get_u32(src, 0..4) as usize;
        if count == 0 || count > max_extents || src.len() < 4 + count * EXTENT_RECORD_LEN {
            return Err(StrataError::Corruption("extent map count out of range"));
        }
        let extents = (0..count)
            .map(|i| {
                let at = 4 + i * EXTENT_RECORD_LEN;
                ExtentRecord {
                    owner: get_u32(src, at..at + 4),
                    used: get_u32(src, at + 4..at + 8),
                }
            })
            .collect();
        Ok(Self {
            pages_per_extent,
            max_extents,
            extents,
        })
    }

    fn cap_for(&self, fill_factor: u8) -> u32 {
        let ppe = self.pages_per_extent;
        ((ppe * fill_factor.clamp(1, 100) as u32).div_ceil(100)).max(1)
    }

    /// First run of `count` free pages in `record`, searching from `from` and wrapping.
    fn find_run(&self, record: &ExtentRecord, count: u32, from: u32) -> Option<u32> {
        let ppe = self.pages_per_extent;
        let mask = if count == 32 { u32::MAX } else { (1u32 << count) - 1 };
        (from..ppe)
            .chain(0..from)
            .filter(|start| start + count <= ppe)
            .find(|start| record.used & (mask << start) == 0)
    }

    fn take_run(&mut self, extent: usize, start: u32, count: u32) -> PageNo {
        let mask = if count == 32 { u32::MAX } else { (1u32 << count) - 1 };
        self.extents[extent].used |= mask << start;
        PageNo(extent as u32 * self.pages_per_extent + start)
    }

    fn try_extent(&mut self, extent: usize, owner: u32, cap: u32, count: u32, from: u32) -> Option<PageNo> {
        let record = *self.extents.get(extent)?;
        if record.owner != owner || record.used_pages() + count > cap {
            return None;
        }
        let start = self.find_run(&record, count, from)?;
        Some(self.take_run(extent, start, count))
    }

    /// Grants `count` pages to `owner`; see [`ExtentAllocator::allocate_pages`].
    pub fn allocate(
        &mut self,
        owner: u32,
        first_extent: Option<ExtentNo>,
        near: Option<PageNo>,
        fill_factor: u8,
        count: u32,
    ) -> Result<PageNo> {
        if owner == OWNER_FREE || owner == OWNER_SYSTEM {
            return Err(StrataError::Invalid("extent owner value is reserved"));
        }
        if count == 0 || count > self.pages_per_extent {
            return Err(StrataError::Invalid("page run must fit in one extent"));
        }
        if let Some(first) = first_extent {
            match self.record(first) {
                Some(record) if record.owner == owner => {}
                _ => return Err(StrataError::Corruption("first extent not owned by file")),
            }
        }
        let cap = self.cap_for(fill_factor).max(count);
        let ppe = self.pages_per_extent;
        if let Some(near) = near {
            let extent = (near.0 / ppe) as usize;
            let from = (near.0 % ppe + 1) % ppe;
            if let Some(page) = self.try_extent(extent, owner, cap, count, from) {
                return Ok(page);
            }
        }
        for extent in 0..self.extents.len() {
            if let Some(page) = self.try_extent(extent, owner, cap, count, 0) {
                return Ok(page);
            }
        }
        let extent = match self.extents.iter().position(|r| r.owner == OWNER_FREE) {
            Some(extent) => extent,
            None if self.extents.len() < self.max_extents => {
                self.extents.push(ExtentRecord {
                    owner: OWNER_FREE,
                    used: 0,
                });
                self.extents.len() - 1
            }
            None => return Err(StrataError::VolumeFull),
        };
        self.extents[extent].owner = owner;
        debug!(extent, owner, "extent.claim");
        Ok(self.take_run(extent, 0, count))
    }

    /// Returns `page` to its extent, releasing the extent once it is empty.
    pub fn free(&mut self, page: PageNo) -> Result<()> {
        let ppe = self.pages_per_extent;
        let extent = (page.0 / ppe) as usize;
        let bit = 1u32 << (page.0 % ppe);
        let record = self
            .extents
            .get_mut(extent)
            .ok_or(StrataError::Invalid("page lies beyond the extent map"))?;
        if record.owner == OWNER_SYSTEM {
            return Err(StrataError::Invalid("system pages cannot be freed"));
        }
        if record.used & bit == 0 {
            return Err(StrataError::Corruption("page freed twice"));
        }
        record.used &= !bit;
        if record.used == 0 {
            record.owner = OWNER_FREE;
            debug!(extent, "extent.release");
        }
        Ok(())
    }
}

/// Thread-safe allocator over the [`ExtentMap`] of one volume.
pub struct BitmapAllocator {
    volume: VolumeId,
    map: Mutex<ExtentMap>,
}

impl BitmapAllocator {
    /// An allocator for `volume` starting from `map`.
    pub fn new(volume: VolumeId, map: ExtentMap) -> Self {
        Self {
            volume,
            map: Mutex::new(map),
        }
    }

    /// Copy of the current extent table, used when persisting volume metadata.
    pub fn snapshot(&self) -> ExtentMap {
        self.map.lock().clone()
    }

    fn check_volume(&self, volume: VolumeId) -> Result<()> {
        if volume != self.volume {
            return Err(StrataError::Invalid("page belongs to another volume"));
        }
        Ok(())
    }
}

impl ExtentAllocator for BitmapAllocator {
    fn allocate_pages(
        &self,
        file: FileId,
        first_extent: Option<ExtentNo>,
        near: Option<PageId>,
        fill_factor: u8,
        count: usize,
    ) -> Result<PageId> {
        self.check_volume(file.volume)?;
        if let Some(near) = near {
            self.check_volume(near.volume)?;
        }
        let count = u32::try_from(count).map_err(|_| StrataError::Invalid("page count overflow"))?;
        let page_no = self.map.lock().allocate(
            file.serial,
            first_extent,
            near.map(|p| p.page_no),
            fill_factor,
            count,
        )?;
        Ok(PageId::new(self.volume, page_no))
    }

    fn extent_of(&self, page: PageId) -> ExtentNo {
        ExtentNo(page.page_no.0 / self.map.lock().pages_per_extent())
    }

    fn free_pages(&self, pages: &[PageId]) -> Result<()> {
        for page in pages {
            self.check_volume(page.volume)?;
        }
        let mut map = self.map.lock();
        for page in pages {
            map.free(page.page_no)?;
        }
        Ok(())
    }
}
