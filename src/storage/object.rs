#![forbid(unsafe_code)]
//! Object manager: creates, reads and destroys objects on slotted pages.

use std::sync::Arc;

use tracing::{debug, info};

use crate::primitives::cache::{PageCache, PinnedPage};
use crate::storage::catalog::{Catalog, CatalogEntry};
use crate::storage::dealloc::{enqueue_for_deallocation, DeallocList, DeallocPool};
use crate::storage::extent::ExtentAllocator;
use crate::storage::filemap;
use crate::storage::options::StoreOptions;
use crate::storage::page::{aligned_len, needed_space, ObjectHeader, PageSummary, SlottedPage};
use crate::storage::tier::{self, Tier};
use crate::types::{FileId, ObjectId, PageId, PageNo, Result, StrataError, VolumeId};

/// An object copied out of its page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    /// Id the object was read by.
    pub id: ObjectId,
    /// Stored header, `length` included.
    pub header: ObjectHeader,
    /// Payload bytes.
    pub data: Vec<u8>,
}

/// Entry point for object-level operations on one volume.
pub struct ObjectManager {
    cache: Arc<dyn PageCache>,
    extents: Arc<dyn ExtentAllocator>,
    catalog: Arc<dyn Catalog>,
    options: StoreOptions,
}

impl ObjectManager {
    /// Wires the manager to its collaborators.
    pub fn new(
        cache: Arc<dyn PageCache>,
        extents: Arc<dyn ExtentAllocator>,
        catalog: Arc<dyn Catalog>,
        options: StoreOptions,
    ) -> Self {
        Self {
            cache,
            extents,
            catalog,
            options,
        }
    }

    /// Settings the manager was built with.
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// The catalog holding per-file entries.
    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    /// A deallocation pool sized from the store options.
    pub fn dealloc_pool(&self) -> DeallocPool {
        DeallocPool::new(self.options.dealloc_pool_size)
    }

    /// Creates an empty file whose first page comes from a freshly claimed extent.
    pub fn create_file(&self, volume: VolumeId, fill_factor: u8) -> Result<FileId> {
        if !(1..=100).contains(&fill_factor) {
            return Err(StrataError::Invalid("fill factor must be within 1..=100"));
        }
        let cache = self.cache.as_ref();
        let catalog = self.catalog.as_ref();
        let file = catalog.allocate_file_id(volume)?;
        let page = self.extents.allocate_pages(file, None, None, fill_factor, 1)?;
        let mut pinned = cache.pin_new(page)?;
        SlottedPage::init(pinned.data_mut(), page, file)?;
        catalog.insert_entry(&CatalogEntry::new(file, page.page_no, fill_factor))?;
        tier::insert_into_tier(cache, catalog, file, &mut pinned)?;
        pinned.mark_dirty()?;
        pinned.release()?;
        info!(file = %file, first_page = %page, fill_factor, "om.file.created");
        Ok(file)
    }

    /// Stores `data` as a new object of `file` and returns its id.
    ///
    /// With `near`, the object is placed on the same page as that object when it
    /// fits, otherwise on a new page chained directly after it.
    pub fn create_object(
        &self,
        file: FileId,
        near: Option<ObjectId>,
        template: &ObjectHeader,
        data: &[u8],
    ) -> Result<ObjectId> {
        let max = self.options.max_object_len();
        if aligned_len(data.len()) > max {
            return Err(StrataError::UnsupportedObjectSize {
                len: data.len(),
                max,
            });
        }
        let cache = self.cache.as_ref();
        let catalog = self.catalog.as_ref();
        let entry = catalog.read_entry(file)?;
        let needed = needed_space(data.len());

        let candidate = match near {
            Some(oid) => {
                if oid.volume != file.volume {
                    return Err(StrataError::Invalid("near object lives on another volume"));
                }
                oid.page_no
            }
            None => tier::select_page(&entry, needed, cache.page_size()),
        };
        let mut pinned = cache.pin(PageId::new(file.volume, candidate))?;
        let (owner, compactable, contiguous) = {
            let sp = SlottedPage::open(pinned.data())?;
            (sp.file_id(), sp.compactable_free(), sp.contiguous_free())
        };
        if owner != file {
            if near.is_some() {
                return Err(StrataError::FileMismatch {
                    expected: file,
                    found: owner,
                });
            }
            return Err(StrataError::Corruption("free-space tier points at a foreign page"));
        }

        let mut pinned = if compactable < needed {
            pinned.release()?;
            self.allocate_page(&entry, near.map(|oid| oid.page_no))?
        } else {
            tier::remove_from_tier(cache, catalog, file, &mut pinned)?;
            if contiguous < needed {
                SlottedPage::open(pinned.data_mut())?.compact()?;
                debug!(page = %pinned.id(), needed, "om.create.compacted");
            }
            pinned
        };

        let batch = self.options.unique_batch;
        let (slot, unique) = {
            let mut sp = SlottedPage::open(pinned.data_mut())?;
            sp.insert_object(template, data, |sp| catalog.next_unique_tag(sp, batch))?
        };
        let filed = tier::insert_into_tier(cache, catalog, file, &mut pinned)?;
        pinned.mark_dirty()?;
        let oid = ObjectId::new(pinned.id(), slot, unique);
        pinned.release()?;
        debug!(
            oid = %oid,
            len = data.len(),
            tier = filed.map(|t| t.percent()),
            "om.create.placed"
        );
        Ok(oid)
    }

    /// Grants a page to the file of `entry`, formats it and links it after
    /// `anchor` (or at the tail of the chain).
    fn allocate_page(&self, entry: &CatalogEntry, anchor: Option<PageNo>) -> Result<PinnedPage<'_>> {
        let cache = self.cache.as_ref();
        let file = entry.file;
        let first_extent = self
            .extents
            .extent_of(PageId::new(file.volume, entry.first_page));
        let near = PageId::new(file.volume, anchor.unwrap_or(entry.last_page));
        let page = self.extents.allocate_pages(
            file,
            Some(first_extent),
            Some(near),
            entry.fill_factor,
            1,
        )?;
        let mut pinned = cache.pin_new(page)?;
        SlottedPage::init(pinned.data_mut(), page, file)?;
        filemap::insert_page_after(cache, self.catalog.as_ref(), file, anchor, &mut pinned)?;
        pinned.mark_dirty()?;
        debug!(file = %file, page = %page, anchor = anchor.map(|p| p.0), "om.create.new_page");
        Ok(pinned)
    }

    /// Pins the page of `oid`, failing with `ObjectNotFound` unless the id is live.
    fn pin_object(&self, oid: &ObjectId) -> Result<PinnedPage<'_>> {
        let pinned = self.cache.pin(oid.page_id())?;
        let live = match SlottedPage::open(pinned.data()) {
            Ok(sp) => sp.locate(oid).is_some(),
            Err(StrataError::Corruption(_)) => false,
            Err(err) => return Err(err),
        };
        if !live {
            return Err(StrataError::ObjectNotFound(*oid));
        }
        Ok(pinned)
    }

    /// Removes `oid` from `file`.
    ///
    /// A page left without objects is unlinked from the file and queued on
    /// `list`, unless it is the file's first page.
    pub fn destroy_object(
        &self,
        file: FileId,
        oid: ObjectId,
        pool: &mut DeallocPool,
        list: &mut DeallocList,
    ) -> Result<()> {
        if oid.volume != file.volume {
            return Err(StrataError::Invalid("object id names another volume"));
        }
        let cache = self.cache.as_ref();
        let catalog = self.catalog.as_ref();
        let entry = catalog.read_entry(file)?;
        let mut pinned = self.pin_object(&oid)?;
        let retiring = {
            let sp = SlottedPage::open(pinned.data())?;
            let owner = sp.file_id();
            if owner != file {
                return Err(StrataError::FileMismatch {
                    expected: file,
                    found: owner,
                });
            }
            sp.live_count() == 1 && oid.page_no != entry.first_page
        };
        if retiring && pool.available() == 0 {
            return Err(StrataError::PoolExhausted {
                capacity: pool.capacity(),
            });
        }

        tier::remove_from_tier(cache, catalog, file, &mut pinned)?;
        let removed = SlottedPage::open(pinned.data_mut())?.remove_object(oid.slot)?;
        let empty = SlottedPage::open(pinned.data())?.is_empty();
        if empty && oid.page_no != entry.first_page {
            filemap::delete_page(cache, catalog, file, &mut pinned)?;
            pinned.mark_dirty()?;
            enqueue_for_deallocation(pool, list, pinned.id())?;
            debug!(oid = %oid, page = %pinned.id(), "om.destroy.page_retired");
        } else {
            tier::insert_into_tier(cache, catalog, file, &mut pinned)?;
            pinned.mark_dirty()?;
        }
        pinned.release()?;
        debug!(
            oid = %oid,
            footprint = removed.footprint,
            reclaimed = removed.reclaimed,
            "om.destroy.removed"
        );
        Ok(())
    }

    /// Copies the header and payload of `oid`.
    pub fn read_object(&self, oid: ObjectId) -> Result<Object> {
        let pinned = self.pin_object(&oid)?;
        let sp = SlottedPage::open(pinned.data())?;
        let offset = sp.locate(&oid).ok_or(StrataError::ObjectNotFound(oid))?;
        let (header, payload) = sp.object_at(offset)?;
        Ok(Object {
            id: oid,
            header,
            data: payload.to_vec(),
        })
    }

    /// Compacts one page of `file` and refiles it under its new tier.
    pub fn compact_page(&self, file: FileId, page_no: PageNo) -> Result<()> {
        let cache = self.cache.as_ref();
        let catalog = self.catalog.as_ref();
        let mut pinned = cache.pin(PageId::new(file.volume, page_no))?;
        let owner = SlottedPage::open(pinned.data())?.file_id();
        if owner != file {
            return Err(StrataError::FileMismatch {
                expected: file,
                found: owner,
            });
        }
        tier::remove_from_tier(cache, catalog, file, &mut pinned)?;
        SlottedPage::open(pinned.data_mut())?.compact()?;
        tier::insert_into_tier(cache, catalog, file, &mut pinned)?;
        pinned.mark_dirty()?;
        pinned.release()?;
        debug!(file = %file, page = page_no.0, "om.page.compacted");
        Ok(())
    }

    /// Pages of `file` in chain order.
    pub fn file_pages(&self, file: FileId) -> Result<Vec<PageNo>> {
        filemap::file_pages(self.cache.as_ref(), self.catalog.as_ref(), file)
    }

    /// Members of each free-space tier of `file`, lowest tier first.
    pub fn tier_pages(&self, file: FileId) -> Result<Vec<(Tier, Vec<PageNo>)>> {
        Tier::ALL
            .iter()
            .map(|&t| {
                tier::tier_members(self.cache.as_ref(), self.catalog.as_ref(), file, t)
                    .map(|members| (t, members))
            })
            .collect()
    }

    /// Every live object of `file`, in chain then slot order.
    pub fn object_ids(&self, file: FileId) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::new();
        for page_no in self.file_pages(file)? {
            let id = PageId::new(file.volume, page_no);
            let pinned = self.cache.pin(id)?;
            let sp = SlottedPage::open(pinned.data())?;
            for (slot, _) in sp.live_slots() {
                let unique = sp.slot(slot)?.unique;
                ids.push(ObjectId::new(id, slot, unique));
            }
        }
        Ok(ids)
    }

    /// Header summary of one data page.
    pub fn page_summary(&self, page: PageId) -> Result<PageSummary> {
        let pinned = self.cache.pin(page)?;
        let summary = SlottedPage::open(pinned.data())?.summary();
        Ok(summary)
    }
}
