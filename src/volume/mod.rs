#![forbid(unsafe_code)]
//! A volume: one backing file holding the meta page, the catalog and data pages.

/// Meta page encoding.
pub mod meta;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::primitives::cache::{BufferPool, PageCache, PoolStats};
use crate::primitives::io::{FileIo, MemFileIo, StdFileIo};
use crate::storage::catalog::{Catalog, PagedCatalog};
use crate::storage::dealloc::{release_deallocated, DeallocList, DeallocPool};
use crate::storage::extent::{BitmapAllocator, ExtentMap};
use crate::storage::object::ObjectManager;
use crate::storage::options::StoreOptions;
use crate::types::{FileId, PageId, PageNo, Result};

use self::meta::{max_extents, read_meta, write_meta, MetaHeader, META_HDR_LEN};

/// Page holding the geometry and the extent map.
pub const META_PAGE: PageNo = PageNo(0);
/// Page holding the catalog.
pub const CATALOG_PAGE: PageNo = PageNo(1);
/// Pages of extent 0 reserved for the meta and catalog pages.
const SYSTEM_PAGES: u32 = 2;

/// One backing file with its page cache, extent allocator and catalog.
pub struct Volume {
    cache: Arc<BufferPool>,
    extents: Arc<BitmapAllocator>,
    catalog: Arc<PagedCatalog>,
    objects: ObjectManager,
    header: MetaHeader,
}

impl Volume {
    /// Creates and formats a new volume file at `path`.
    pub fn create(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let io = StdFileIo::create(path.as_ref())?;
        let volume = Self::format(Arc::new(io), options)?;
        info!(path = %path.as_ref().display(), volume = %volume.header.volume, "volume.create");
        Ok(volume)
    }

    /// Opens an existing volume. Geometry comes from the meta page; the
    /// remaining settings from `options`.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let io = StdFileIo::open(path.as_ref())?;
        let volume = Self::attach(Arc::new(io), options)?;
        info!(path = %path.as_ref().display(), volume = %volume.header.volume, "volume.open");
        Ok(volume)
    }

    /// A volume that lives only in memory.
    pub fn in_memory(options: StoreOptions) -> Result<Self> {
        Self::format(Arc::new(MemFileIo::new()), options)
    }

    fn format(io: Arc<dyn FileIo>, options: StoreOptions) -> Result<Self> {
        options.validate()?;
        let page_size = options.page_size as usize;
        let header = MetaHeader {
            volume: options.volume(),
            page_size: options.page_size,
            pages_per_extent: options.pages_per_extent,
            salt: rand::random(),
        };
        let map = ExtentMap::new(options.pages_per_extent, max_extents(page_size), SYSTEM_PAGES)?;
        let cache = Arc::new(BufferPool::new(io, header.volume, page_size, options.cache_pages)?);
        let shared: Arc<dyn PageCache> = cache.clone();
        let catalog = Arc::new(PagedCatalog::format(
            Arc::clone(&shared),
            PageId::new(header.volume, CATALOG_PAGE),
        )?);
        let volume = Self::assemble(cache, catalog, map, header, options);
        volume.flush()?;
        Ok(volume)
    }

    fn attach(io: Arc<dyn FileIo>, mut options: StoreOptions) -> Result<Self> {
        let mut raw = [0u8; META_HDR_LEN];
        io.read_at(0, &mut raw)?;
        let probe = MetaHeader::decode(&raw)?;
        options.page_size = probe.page_size;
        options.pages_per_extent = probe.pages_per_extent;
        options.volume_id = probe.volume.0;
        options.validate()?;

        let cache = Arc::new(BufferPool::new(
            io,
            probe.volume,
            probe.page_size as usize,
            options.cache_pages,
        )?);
        let (header, map) = {
            let pinned = cache.pin(PageId::new(probe.volume, META_PAGE))?;
            read_meta(pinned.data())?
        };
        let shared: Arc<dyn PageCache> = cache.clone();
        let catalog = Arc::new(PagedCatalog::open(
            shared,
            PageId::new(header.volume, CATALOG_PAGE),
        )?);
        Ok(Self::assemble(cache, catalog, map, header, options))
    }

    fn assemble(
        cache: Arc<BufferPool>,
        catalog: Arc<PagedCatalog>,
        map: ExtentMap,
        header: MetaHeader,
        options: StoreOptions,
    ) -> Self {
        let extents = Arc::new(BitmapAllocator::new(header.volume, map));
        let objects = ObjectManager::new(
            cache.clone(),
            extents.clone(),
            catalog.clone(),
            options,
        );
        Self {
            cache,
            extents,
            catalog,
            objects,
            header,
        }
    }

    /// Object operations on this volume.
    pub fn objects(&self) -> &ObjectManager {
        &self.objects
    }

    /// Effective store options, geometry taken from the meta page.
    pub fn options(&self) -> &StoreOptions {
        self.objects.options()
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.header.page_size as usize
    }

    /// Creates a file using the configured default fill factor.
    pub fn create_file(&self) -> Result<FileId> {
        self.objects
            .create_file(self.header.volume, self.options().fill_factor)
    }

    /// Every file recorded in the catalog.
    pub fn files(&self) -> Result<Vec<FileId>> {
        self.catalog.files()
    }

    /// A deallocation pool sized from the volume options.
    pub fn dealloc_pool(&self) -> DeallocPool {
        self.objects.dealloc_pool()
    }

    /// Returns every page queued on `list` to the extent allocator.
    pub fn release_deallocated(&self, list: &mut DeallocList, pool: &mut DeallocPool) -> Result<usize> {
        release_deallocated(list, pool, self.extents.as_ref())
    }

    /// Current extent table.
    pub fn extent_map(&self) -> ExtentMap {
        self.extents.snapshot()
    }

    /// Buffer pool counters.
    pub fn cache_stats(&self) -> PoolStats {
        self.cache.stats()
    }

    /// Persists the extent table and writes back every dirty page.
    pub fn flush(&self) -> Result<()> {
        let map = self.extents.snapshot();
        {
            let id = PageId::new(self.header.volume, META_PAGE);
            let mut pinned = self.cache.pin_new(id)?;
            write_meta(pinned.data_mut(), &self.header, &map)?;
            pinned.mark_dirty()?;
            pinned.release()?;
        }
        self.cache.flush()
    }
}
