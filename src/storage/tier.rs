//! Free-space tiers: per-file lists of pages bucketed by contiguous free space.
//!
//! A page is filed under the highest tier whose threshold does not exceed its
//! contiguous free space. The list links are the `space_prev`/`space_next`
//! header fields and the catalog entry keeps each tier's head.

use tracing::trace;

use crate::primitives::cache::{PageCache, PinnedPage};
use crate::storage::catalog::{Catalog, CatalogEntry};
use crate::storage::filemap::update_page;
use crate::storage::page::SlottedPage;
use crate::types::{FileId, PageId, PageNo, Result, StrataError};

/// Free-space tier of a page, named by its threshold in percent of the page size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// At least 10% free.
    T10,
    /// At least 20% free.
    T20,
    /// At least 30% free.
    T30,
    /// At least 40% free.
    T40,
    /// At least 50% free.
    T50,
}

impl Tier {
    /// Every tier, lowest threshold first.
    pub const ALL: [Tier; 5] = [Tier::T10, Tier::T20, Tier::T30, Tier::T40, Tier::T50];

    /// Position in [`Tier::ALL`] and in the catalog tier heads.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Threshold in percent of the page size.
    pub fn percent(self) -> usize {
        (self.index() + 1) * 10
    }

    /// Minimum contiguous free bytes for a page of `page_size` to sit in this tier.
    pub fn threshold(self, page_size: usize) -> usize {
        page_size * self.percent() / 100
    }

    /// Tier a page with `contiguous_free` bytes belongs to, if any.
    pub fn for_free(contiguous_free: usize, page_size: usize) -> Option<Tier> {
        Tier::ALL
            .iter()
            .rev()
            .copied()
            .find(|tier| contiguous_free >= tier.threshold(page_size))
    }

    /// Value stored in the page header; zero is reserved for "no tier".
    pub fn tag(self) -> u8 {
        self.index() as u8 + 1
    }

    /// Decodes a header tag written by [`Tier::tag`].
    pub fn from_tag(tag: u8) -> Result<Option<Tier>> {
        match tag {
            0 => Ok(None),
            1..=5 => Ok(Some(Tier::ALL[tag as usize - 1])),
            _ => Err(StrataError::Corruption("unknown free-space tier tag")),
        }
    }
}

/// Picks the page a new object of `needed` bytes should try first.
///
/// Tiers are probed in ascending order; the first non-empty tier whose
/// threshold covers `needed` wins. Without a match the file's last page is used.
pub fn select_page(entry: &CatalogEntry, needed: usize, page_size: usize) -> PageNo {
    Tier::ALL
        .iter()
        .filter(|tier| needed <= tier.threshold(page_size))
        .find_map(|tier| entry.tier_heads[tier.index()])
        .unwrap_or(entry.last_page)
}

/// Unlinks `page` from the tier recorded in its header. Pages in no tier are left alone.
pub fn remove_from_tier(
    cache: &dyn PageCache,
    catalog: &dyn Catalog,
    file: FileId,
    page: &mut PinnedPage<'_>,
) -> Result<()> {
    let me = page.id();
    let (tag, prev, next) = {
        let sp = SlottedPage::open(page.data())?;
        (sp.tier_tag(), sp.space_prev(), sp.space_next())
    };
    let Some(tier) = Tier::from_tag(tag)? else {
        return Ok(());
    };
    match prev {
        Some(prev) => update_page(cache, me, prev, |pred| {
            pred.set_space_next(next);
            Ok(())
        })?,
        None => {
            let entry = catalog.read_entry(file)?;
            if entry.tier_heads[tier.index()] != Some(me.page_no) {
                return Err(StrataError::Corruption("tier head does not match page"));
            }
            catalog.write_tier_head(file, tier, next)?;
        }
    }
    if let Some(next) = next {
        update_page(cache, me, next, |succ| {
            succ.set_space_prev(prev);
            Ok(())
        })?;
    }
    let mut sp = SlottedPage::open(page.data_mut())?;
    sp.set_space_prev(None);
    sp.set_space_next(None);
    sp.set_tier_tag(0);
    trace!(file = %file, page = %me, tier = tier.percent(), "tier.remove");
    Ok(())
}

/// Files `page` at the head of the tier matching its contiguous free space.
///
/// Returns the tier chosen, or `None` when the page is too full for any tier.
pub fn insert_into_tier(
    cache: &dyn PageCache,
    catalog: &dyn Catalog,
    file: FileId,
    page: &mut PinnedPage<'_>,
) -> Result<Option<Tier>> {
    remove_from_tier(cache, catalog, file, page)?;
    let me = page.id();
    let (free, page_size) = {
        let sp = SlottedPage::open(page.data())?;
        (sp.contiguous_free(), sp.page_len())
    };
    let Some(tier) = Tier::for_free(free, page_size) else {
        return Ok(None);
    };
    let old_head = catalog.read_entry(file)?.tier_heads[tier.index()];
    if let Some(head) = old_head {
        update_page(cache, me, head, |succ| {
            succ.set_space_prev(Some(me.page_no));
            Ok(())
        })?;
    }
    {
        let mut sp = SlottedPage::open(page.data_mut())?;
        sp.set_space_prev(None);
        sp.set_space_next(old_head);
        sp.set_tier_tag(tier.tag());
    }
    catalog.write_tier_head(file, tier, Some(me.page_no))?;
    trace!(file = %file, page = %me, tier = tier.percent(), free, "tier.insert");
    Ok(Some(tier))
}

/// Pages filed under `tier` for `file`, head first.
pub fn tier_members(
    cache: &dyn PageCache,
    catalog: &dyn Catalog,
    file: FileId,
    tier: Tier,
) -> Result<Vec<PageNo>> {
    let mut members = Vec::new();
    let mut cursor = catalog.read_entry(file)?.tier_heads[tier.index()];
    while let Some(page_no) = cursor {
        if members.contains(&page_no) {
            return Err(StrataError::Corruption("cycle in free-space tier"));
        }
        let pinned = cache.pin(PageId::new(file.volume, page_no))?;
        let sp = SlottedPage::open(pinned.data())?;
        if sp.tier_tag() != tier.tag() {
            return Err(StrataError::Corruption("page filed under the wrong tier"));
        }
        members.push(page_no);
        cursor = sp.space_next();
    }
    Ok(members)
}
