//! Doubly linked chain of the pages that make up one file.
//!
//! Chain links live in the page headers (`prev_page`/`next_page`); the catalog
//! entry records the first and last page.

use std::collections::HashSet;

use tracing::trace;

use crate::primitives::cache::{PageCache, PinnedPage};
use crate::storage::catalog::Catalog;
use crate::storage::page::SlottedPage;
use crate::types::{FileId, PageId, PageNo, Result, StrataError};

/// Pins `neighbor`, lets `f` rewrite its header, marks it dirty and unpins it.
///
/// `me` is the page the caller already holds; a link back to it is corruption
/// and would otherwise block on the page latch.
pub(crate) fn update_page<R>(
    cache: &dyn PageCache,
    me: PageId,
    neighbor: PageNo,
    f: impl FnOnce(&mut SlottedPage<&mut [u8]>) -> Result<R>,
) -> Result<R> {
    if neighbor == me.page_no {
        return Err(StrataError::Corruption("page header links to itself"));
    }
    let mut pinned = cache.pin(PageId::new(me.volume, neighbor))?;
    let out = {
        let mut page = SlottedPage::open(pinned.data_mut())?;
        f(&mut page)?
    };
    pinned.mark_dirty()?;
    pinned.release()?;
    Ok(out)
}

fn ensure_owner(page: &SlottedPage<&mut [u8]>, file: FileId) -> Result<()> {
    if page.file_id() != file {
        return Err(StrataError::Corruption("chain neighbour belongs to another file"));
    }
    Ok(())
}

/// Links `page` into the chain of `file` directly after `anchor`, or at the
/// tail when no anchor is given.
pub fn insert_page_after(
    cache: &dyn PageCache,
    catalog: &dyn Catalog,
    file: FileId,
    anchor: Option<PageNo>,
    page: &mut PinnedPage<'_>,
) -> Result<()> {
    let me = page.id();
    let anchor = match anchor {
        Some(anchor) => anchor,
        None => catalog.read_entry(file)?.last_page,
    };
    let next = update_page(cache, me, anchor, |prev| {
        ensure_owner(prev, file)?;
        let next = prev.next_page();
        prev.set_next_page(Some(me.page_no));
        Ok(next)
    })?;
    if next == Some(me.page_no) {
        return Err(StrataError::Corruption("page already linked after anchor"));
    }
    {
        let mut sp = SlottedPage::open(page.data_mut())?;
        sp.set_prev_page(Some(anchor));
        sp.set_next_page(next);
    }
    match next {
        Some(next) => update_page(cache, me, next, |succ| {
            ensure_owner(succ, file)?;
            succ.set_prev_page(Some(me.page_no));
            Ok(())
        })?,
        None => catalog.write_last_page(file, me.page_no)?,
    }
    trace!(file = %file, page = %me, anchor = anchor.0, "filemap.insert_after");
    Ok(())
}

/// Unlinks `page` from the chain of `file`. The first page cannot be removed.
pub fn delete_page(
    cache: &dyn PageCache,
    catalog: &dyn Catalog,
    file: FileId,
    page: &mut PinnedPage<'_>,
) -> Result<()> {
    let me = page.id();
    let entry = catalog.read_entry(file)?;
    if entry.first_page == me.page_no {
        return Err(StrataError::Invalid("the first page of a file stays in its chain"));
    }
    let (prev, next) = {
        let sp = SlottedPage::open(page.data())?;
        (sp.prev_page(), sp.next_page())
    };
    let prev = prev.ok_or(StrataError::Corruption("non-first page without predecessor"))?;
    update_page(cache, me, prev, |pred| {
        pred.set_next_page(next);
        Ok(())
    })?;
    match next {
        Some(next) => update_page(cache, me, next, |succ| {
            succ.set_prev_page(Some(prev));
            Ok(())
        })?,
        None => catalog.write_last_page(file, prev)?,
    }
    let mut sp = SlottedPage::open(page.data_mut())?;
    sp.set_prev_page(None);
    sp.set_next_page(None);
    trace!(file = %file, page = %me, "filemap.delete");
    Ok(())
}

/// Page numbers of `file` in chain order.
pub fn file_pages(cache: &dyn PageCache, catalog: &dyn Catalog, file: FileId) -> Result<Vec<PageNo>> {
    let entry = catalog.read_entry(file)?;
    let mut seen = HashSet::new();
    let mut pages = Vec::new();
    let mut cursor = Some(entry.first_page);
    while let Some(page_no) = cursor {
        if !seen.insert(page_no) {
            return Err(StrataError::Corruption("cycle in file page chain"));
        }
        let pinned = cache.pin(PageId::new(file.volume, page_no))?;
        let sp = SlottedPage::open(pinned.data())?;
        if sp.file_id() != file {
            return Err(StrataError::Corruption("chain reaches a page of another file"));
        }
        cursor = sp.next_page();
        pages.push(page_no);
    }
    Ok(pages)
}
