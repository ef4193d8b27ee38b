#![forbid(unsafe_code)]
//! Per-file catalog entries and the volume-wide counters.

use std::ops::Range;
use std::sync::Arc;

use tracing::debug;

use crate::primitives::cache::PageCache;
use crate::storage::page::{get_u16, get_u32, put_u16, put_u32, SlottedPage};
use crate::storage::tier::Tier;
use crate::types::{
    decode_link, encode_link, FileId, PageId, PageNo, Result, StrataError, Unique, VolumeId,
};

/// Catalog record describing one file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogEntry {
    /// File the entry describes.
    pub file: FileId,
    /// Head of the page chain; never retired.
    pub first_page: PageNo,
    /// Tail of the page chain.
    pub last_page: PageNo,
    /// Percentage of each extent the file may fill (1..=100).
    pub fill_factor: u8,
    /// Head page of each free-space tier, indexed by [`Tier::index`].
    pub tier_heads: [Option<PageNo>; 5],
}

impl CatalogEntry {
    /// An entry for a file whose only page is `first_page`.
    pub fn new(file: FileId, first_page: PageNo, fill_factor: u8) -> Self {
        Self {
            file,
            first_page,
            last_page: first_page,
            fill_factor,
            tier_heads: [None; 5],
        }
    }
}

/// Storage for file metadata.
pub trait Catalog: Send + Sync {
    /// Current entry of `file`.
    fn read_entry(&self, file: FileId) -> Result<CatalogEntry>;
    /// Records the head of the page chain.
    fn write_first_page(&self, file: FileId, page: PageNo) -> Result<()>;
    /// Records the tail of the page chain.
    fn write_last_page(&self, file: FileId, page: PageNo) -> Result<()>;
    /// Records the head page of `tier`.
    fn write_tier_head(&self, file: FileId, tier: Tier, head: Option<PageNo>) -> Result<()>;
    /// Hands out a file identity that has never been used on `volume`.
    fn allocate_file_id(&self, volume: VolumeId) -> Result<FileId>;
    /// Stores the entry of a newly created file.
    fn insert_entry(&self, entry: &CatalogEntry) -> Result<()>;
    /// Reserves `count` unique tags from the volume-wide counter.
    fn reserve_unique_batch(&self, volume: VolumeId, count: u32) -> Result<Range<u32>>;
    /// Every file recorded on the volume, in creation order.
    fn files(&self) -> Result<Vec<FileId>>;

    /// Mints the next unique tag for a slot on `page`.
    ///
    /// Tags come from the range cached in the page header; a new batch is
    /// reserved once it runs out, so tags on one page only ever grow.
    fn next_unique_tag(&self, page: &mut SlottedPage<&mut [u8]>, batch: u32) -> Result<Unique> {
        let (next, limit) = (page.unique(), page.unique_limit());
        if next < limit {
            page.set_unique(next + 1, limit);
            return Ok(Unique(next));
        }
        let range = self.reserve_unique_batch(page.page_id().volume, batch.max(1))?;
        page.set_unique(range.start + 1, range.end);
        Ok(Unique(range.start))
    }
}

const CATALOG_MAGIC: [u8; 4] = *b"STRC";

mod layout {
    use core::ops::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const COUNT: Range<usize> = 4..6;
    pub const NEXT_UNIQUE: Range<usize> = 8..12;
    pub const NEXT_SERIAL: Range<usize> = 12..16;
    pub const ENTRIES: usize = 16;
    pub const ENTRY_LEN: usize = 40;

    pub const E_VOLUME: Range<usize> = 0..2;
    pub const E_SERIAL: Range<usize> = 4..8;
    pub const E_FIRST: Range<usize> = 8..12;
    pub const E_LAST: Range<usize> = 12..16;
    pub const E_FILL: usize = 16;
    pub const E_TIERS: usize = 20;
}

fn encode_entry(entry: &CatalogEntry, dst: &mut [u8]) {
    dst.fill(0);
    put_u16(dst, layout::E_VOLUME, entry.file.volume.0);
    put_u32(dst, layout::E_SERIAL, entry.file.serial);
    put_u32(dst, layout::E_FIRST, entry.first_page.0);
    put_u32(dst, layout::E_LAST, entry.last_page.0);
    dst[layout::E_FILL] = entry.fill_factor;
    for (i, head) in entry.tier_heads.iter().enumerate() {
        let at = layout::E_TIERS + i * 4;
        put_u32(dst, at..at + 4, encode_link(*head));
    }
}

fn decode_entry(src: &[u8]) -> CatalogEntry {
    let mut tier_heads = [None; 5];
    for (i, head) in tier_heads.iter_mut().enumerate() {
        let at = layout::E_TIERS + i * 4;
        *head = decode_link(get_u32(src, at..at + 4));
    }
    CatalogEntry {
        file: FileId::new(
            VolumeId(get_u16(src, layout::E_VOLUME)),
            get_u32(src, layout::E_SERIAL),
        ),
        first_page: PageNo(get_u32(src, layout::E_FIRST)),
        last_page: PageNo(get_u32(src, layout::E_LAST)),
        fill_factor: src[layout::E_FILL],
        tier_heads,
    }
}

/// Catalog kept on a single page of the volume and reached through the page cache.
pub struct PagedCatalog {
    cache: Arc<dyn PageCache>,
    page: PageId,
}

impl PagedCatalog {
    /// Writes an empty catalog onto `page`.
    pub fn format(cache: Arc<dyn PageCache>, page: PageId) -> Result<Self> {
        {
            let mut pinned = cache.pin_new(page)?;
            let bytes = pinned.data_mut();
            bytes.fill(0);
            bytes[layout::MAGIC].copy_from_slice(&CATALOG_MAGIC);
            put_u32(bytes, layout::NEXT_UNIQUE, 1);
            put_u32(bytes, layout::NEXT_SERIAL, 1);
            pinned.mark_dirty()?;
            pinned.release()?;
        }
        debug!(page = %page, "catalog.format");
        Ok(Self { cache, page })
    }

    /// Attaches to an existing catalog page.
    pub fn open(cache: Arc<dyn PageCache>, page: PageId) -> Result<Self> {
        {
            let pinned = cache.pin(page)?;
            if pinned.data()[layout::MAGIC] != CATALOG_MAGIC {
                return Err(StrataError::Corruption("invalid catalog page magic"));
            }
        }
        Ok(Self { cache, page })
    }

    /// Number of entries the catalog page can hold.
    pub fn capacity(&self) -> usize {
        (self.cache.page_size() - layout::ENTRIES) / layout::ENTRY_LEN
    }

    fn entry_range(index: usize) -> Range<usize> {
        let start = layout::ENTRIES + index * layout::ENTRY_LEN;
        start..start + layout::ENTRY_LEN
    }

    fn find(bytes: &[u8], file: FileId) -> Option<usize> {
        let count = get_u16(bytes, layout::COUNT) as usize;
        (0..count).find(|&i| {
            let raw = &bytes[Self::entry_range(i)];
            get_u16(raw, layout::E_VOLUME) == file.volume.0
                && get_u32(raw, layout::E_SERIAL) == file.serial
        })
    }

    fn read<R>(&self, f: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
        let pinned = self.cache.pin(self.page)?;
        f(pinned.data())
    }

    fn modify<R>(&self, f: impl FnOnce(&mut [u8]) -> Result<R>) -> Result<R> {
        let mut pinned = self.cache.pin(self.page)?;
        let out = f(pinned.data_mut())?;
        pinned.mark_dirty()?;
        pinned.release()?;
        Ok(out)
    }

    fn modify_entry(&self, file: FileId, f: impl FnOnce(&mut CatalogEntry)) -> Result<()> {
        self.modify(|bytes| {
            let index = Self::find(bytes, file).ok_or(StrataError::NotFound("file"))?;
            let range = Self::entry_range(index);
            let mut entry = decode_entry(&bytes[range.clone()]);
            f(&mut entry);
            encode_entry(&entry, &mut bytes[range]);
            Ok(())
        })
    }
}

impl Catalog for PagedCatalog {
    fn read_entry(&self, file: FileId) -> Result<CatalogEntry> {
        self.read(|bytes| {
            let index = Self::find(bytes, file).ok_or(StrataError::NotFound("file"))?;
            Ok(decode_entry(&bytes[Self::entry_range(index)]))
        })
    }

    fn write_first_page(&self, file: FileId, page: PageNo) -> Result<()> {
        self.modify_entry(file, |entry| entry.first_page = page)
    }

    fn write_last_page(&self, file: FileId, page: PageNo) -> Result<()> {
        self.modify_entry(file, |entry| entry.last_page = page)
    }

    fn write_tier_head(&self, file: FileId, tier: Tier, head: Option<PageNo>) -> Result<()> {
        self.modify_entry(file, |entry| entry.tier_heads[tier.index()] = head)
    }

    fn allocate_file_id(&self, volume: VolumeId) -> Result<FileId> {
        if volume != self.page.volume {
            return Err(StrataError::Invalid("catalog serves a different volume"));
        }
        self.modify(|bytes| {
            let serial = get_u32(bytes, layout::NEXT_SERIAL);
            let next = serial
                .checked_add(1)
                .ok_or(StrataError::Invalid("file serials exhausted"))?;
            put_u32(bytes, layout::NEXT_SERIAL, next);
            Ok(FileId::new(volume, serial))
        })
    }

    fn insert_entry(&self, entry: &CatalogEntry) -> Result<()> {
        let capacity = self.capacity();
        self.modify(|bytes| {
            if Self::find(bytes, entry.file).is_some() {
                return Err(StrataError::Invalid("file already has a catalog entry"));
            }
            let count = get_u16(bytes, layout::COUNT) as usize;
            if count >= capacity {
                return Err(StrataError::Invalid("catalog page is full"));
            }
            encode_entry(entry, &mut bytes[Self::entry_range(count)]);
            put_u16(bytes, layout::COUNT, count as u16 + 1);
            Ok(())
        })?;
        debug!(file = %entry.file, first_page = entry.first_page.0, "catalog.insert_entry");
        Ok(())
    }

    fn reserve_unique_batch(&self, volume: VolumeId, count: u32) -> Result<Range<u32>> {
        if volume != self.page.volume {
            return Err(StrataError::Invalid("catalog serves a different volume"));
        }
        self.modify(|bytes| {
            let start = get_u32(bytes, layout::NEXT_UNIQUE);
            let end = start
                .checked_add(count)
                .ok_or(StrataError::Invalid("unique tags exhausted"))?;
            put_u32(bytes, layout::NEXT_UNIQUE, end);
            Ok(start..end)
        })
    }

    fn files(&self) -> Result<Vec<FileId>> {
        self.read(|bytes| {
            let count = get_u16(bytes, layout::COUNT) as usize;
            Ok((0..count)
                .map(|i| decode_entry(&bytes[Self::entry_range(i)]).file)
                .collect())
        })
    }
}
