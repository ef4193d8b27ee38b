#![allow(missing_docs)]

use std::sync::Once;

use strata::{
    logging::init_logging,
    storage::{
        page::object_footprint, DeallocEntry, DeallocList, ObjectHeader, PageSummary,
        StoreOptions, Tier,
    },
    types::{FileId, ObjectId, PageId, PageNo, Result, StrataError},
    volume::Volume,
};

const PAGE: u32 = 1024;

fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = init_logging("warn");
    });
}

fn small_volume() -> Result<(Volume, FileId)> {
    init_test_logging();
    let volume = Volume::in_memory(StoreOptions::default().page_size(PAGE).cache_pages(16))?;
    let file = volume.create_file()?;
    Ok((volume, file))
}

fn put(volume: &Volume, file: FileId, near: Option<ObjectId>, data: &[u8]) -> Result<ObjectId> {
    volume
        .objects()
        .create_object(file, near, &ObjectHeader::new(0, 1), data)
}

fn first_page(volume: &Volume, file: FileId) -> Result<PageNo> {
    Ok(volume.objects().catalog().read_entry(file)?.first_page)
}

fn summaries(volume: &Volume, file: FileId) -> Result<Vec<PageSummary>> {
    volume
        .objects()
        .file_pages(file)?
        .into_iter()
        .map(|page| {
            volume
                .objects()
                .page_summary(PageId::new(file.volume, page))
        })
        .collect()
}

/// Checks space accounting and tier placement of every page of `file`.
fn assert_file_consistent(volume: &Volume, file: FileId) -> Result<()> {
    let objects = volume.objects();
    let ids = objects.object_ids(file)?;
    let tiers = objects.tier_pages(file)?;
    for summary in summaries(volume, file)? {
        let on_page: Vec<&ObjectId> = ids
            .iter()
            .filter(|oid| oid.page_no.0 == summary.page_no)
            .collect();
        let mut footprints = 0;
        for oid in &on_page {
            footprints += object_footprint(objects.read_object(**oid)?.data.len());
        }
        assert_eq!(summary.live_objects, on_page.len());
        assert_eq!(
            summary.free - summary.unused,
            footprints,
            "page {} accounts for its live bytes",
            summary.page_no
        );

        let expected = Tier::for_free(summary.contiguous_free, PAGE as usize);
        assert_eq!(summary.tier, expected.map_or(0, |t| t.tag()));
        for (tier, members) in &tiers {
            let listed = members.iter().filter(|p| p.0 == summary.page_no).count();
            let want = usize::from(Some(*tier) == expected);
            assert_eq!(listed, want, "page {} in tier {}", summary.page_no, tier.percent());
        }
    }
    Ok(())
}

#[test]
fn created_object_reads_back() -> Result<()> {
    let (volume, file) = small_volume()?;
    let header = ObjectHeader::new(0x0102, 77);
    let oid = volume
        .objects()
        .create_object(file, None, &header, b"hello, strata")?;

    let object = volume.objects().read_object(oid)?;
    assert_eq!(object.data, b"hello, strata");
    assert_eq!(object.header.properties, 0x0102);
    assert_eq!(object.header.tag, 77);
    assert_eq!(object.header.length, 13);
    assert_eq!(oid.page_no, first_page(&volume, file)?);
    assert_file_consistent(&volume, file)
}

#[test]
fn empty_payload_is_accepted() -> Result<()> {
    let (volume, file) = small_volume()?;
    let oid = put(&volume, file, None, b"")?;
    assert!(volume.objects().read_object(oid)?.data.is_empty());
    assert_file_consistent(&volume, file)
}

#[test]
fn destroying_tail_object_returns_space() -> Result<()> {
    let (volume, file) = small_volume()?;
    let keep = put(&volume, file, None, &[1u8; 40])?;
    let before = volume.objects().page_summary(keep.page_id())?;
    let gone = put(&volume, file, None, &[2u8; 60])?;

    let mut pool = volume.dealloc_pool();
    let mut list = DeallocList::new();
    volume
        .objects()
        .destroy_object(file, gone, &mut pool, &mut list)?;

    let after = volume.objects().page_summary(keep.page_id())?;
    assert_eq!(after.free, before.free);
    assert_eq!(after.unused, 0);
    assert_eq!(after.n_slots, before.n_slots);
    assert!(list.is_empty());
    assert!(matches!(
        volume.objects().read_object(gone),
        Err(StrataError::ObjectNotFound(_))
    ));
    assert_file_consistent(&volume, file)
}

#[test]
fn destroying_tail_object_above_a_hole_returns_only_its_footprint() -> Result<()> {
    let (volume, file) = small_volume()?;
    let a = put(&volume, file, None, &[1u8; 40])?;
    let b = put(&volume, file, None, &[2u8; 20])?;
    let c = put(&volume, file, None, &[3u8; 12])?;

    let mut pool = volume.dealloc_pool();
    let mut list = DeallocList::new();
    volume
        .objects()
        .destroy_object(file, b, &mut pool, &mut list)?;
    let before = volume.objects().page_summary(c.page_id())?;
    assert_eq!(before.unused, object_footprint(20));

    volume
        .objects()
        .destroy_object(file, c, &mut pool, &mut list)?;

    let after = volume.objects().page_summary(c.page_id())?;
    assert_eq!(after.free, before.free - object_footprint(12));
    assert_eq!(after.unused, object_footprint(20));
    assert_eq!(after.free - after.unused, object_footprint(40));
    assert_eq!(volume.objects().read_object(a)?.data, vec![1u8; 40]);
    assert_file_consistent(&volume, file)
}

#[test]
fn destroying_inner_object_grows_unused() -> Result<()> {
    let (volume, file) = small_volume()?;
    let inner = put(&volume, file, None, &[1u8; 40])?;
    let outer = put(&volume, file, None, &[2u8; 60])?;
    let before = volume.objects().page_summary(inner.page_id())?;

    let mut pool = volume.dealloc_pool();
    let mut list = DeallocList::new();
    volume
        .objects()
        .destroy_object(file, inner, &mut pool, &mut list)?;

    let after = volume.objects().page_summary(inner.page_id())?;
    assert_eq!(after.free, before.free);
    assert_eq!(after.unused, object_footprint(40));
    assert_eq!(volume.objects().read_object(outer)?.data, vec![2u8; 60]);
    assert_file_consistent(&volume, file)
}

#[test]
fn reused_slot_gets_a_greater_unique() -> Result<()> {
    let (volume, file) = small_volume()?;
    let x = put(&volume, file, None, b"first")?;
    let y = put(&volume, file, None, b"second")?;

    let mut pool = volume.dealloc_pool();
    let mut list = DeallocList::new();
    volume
        .objects()
        .destroy_object(file, x, &mut pool, &mut list)?;
    let z = put(&volume, file, Some(y), b"third")?;

    assert_eq!(z.page_no, x.page_no);
    assert_eq!(z.slot, x.slot);
    assert!(z.unique > x.unique);
    assert!(z.unique > y.unique);
    assert!(matches!(
        volume.objects().read_object(x),
        Err(StrataError::ObjectNotFound(_))
    ));
    assert_eq!(volume.objects().read_object(z)?.data, b"third");
    assert_file_consistent(&volume, file)
}

#[test]
fn fragmented_page_is_compacted_before_insert() -> Result<()> {
    let (volume, file) = small_volume()?;
    let a = put(&volume, file, None, &[0xAA; 300])?;
    let b = put(&volume, file, None, &[0xBB; 300])?;
    let c = put(&volume, file, None, &[0xCC; 300])?;

    let mut pool = volume.dealloc_pool();
    let mut list = DeallocList::new();
    volume
        .objects()
        .destroy_object(file, b, &mut pool, &mut list)?;
    let d = put(&volume, file, None, &[0xDD; 250])?;

    assert_eq!(d.page_no, a.page_no);
    assert_eq!(d.slot, b.slot);
    let summary = volume.objects().page_summary(d.page_id())?;
    assert_eq!(summary.unused, 0);
    assert_eq!(volume.objects().read_object(a)?.data, vec![0xAA; 300]);
    assert_eq!(volume.objects().read_object(c)?.data, vec![0xCC; 300]);
    assert_eq!(volume.objects().read_object(d)?.data, vec![0xDD; 250]);
    assert_eq!(volume.objects().file_pages(file)?.len(), 1);
    assert_file_consistent(&volume, file)
}

#[test]
fn emptied_page_is_retired_but_first_page_stays() -> Result<()> {
    let (volume, file) = small_volume()?;
    let first = first_page(&volume, file)?;
    let filler = put(&volume, file, None, &[7u8; 900])?;
    let lone = put(&volume, file, None, &[8u8; 900])?;
    assert_eq!(filler.page_no, first);
    assert_ne!(lone.page_no, first);
    assert_eq!(volume.objects().file_pages(file)?, vec![first, lone.page_no]);

    let mut pool = volume.dealloc_pool();
    let mut list = DeallocList::new();
    volume
        .objects()
        .destroy_object(file, lone, &mut pool, &mut list)?;
    assert_eq!(volume.objects().file_pages(file)?, vec![first]);
    assert!(list.contains(&DeallocEntry::Page(lone.page_id())));
    assert_eq!(pool.available(), pool.capacity() - 1);

    volume
        .objects()
        .destroy_object(file, filler, &mut pool, &mut list)?;
    assert_eq!(volume.objects().file_pages(file)?, vec![first]);
    assert_eq!(list.len(), 1);
    let summary = volume.objects().page_summary(filler.page_id())?;
    assert_eq!(summary.live_objects, 0);
    assert_eq!((summary.free, summary.unused), (0, 0));
    assert_eq!(summary.tier, Tier::T50.tag());
    assert_file_consistent(&volume, file)
}

#[test]
fn emptied_first_page_keeps_holes_until_compaction() -> Result<()> {
    let (volume, file) = small_volume()?;
    let first = first_page(&volume, file)?;
    let low = put(&volume, file, None, &[1u8; 100])?;
    let high = put(&volume, file, None, &[2u8; 50])?;

    let mut pool = volume.dealloc_pool();
    let mut list = DeallocList::new();
    volume
        .objects()
        .destroy_object(file, low, &mut pool, &mut list)?;
    volume
        .objects()
        .destroy_object(file, high, &mut pool, &mut list)?;

    let summary = volume.objects().page_summary(PageId::new(file.volume, first))?;
    assert_eq!(summary.live_objects, 0);
    assert_eq!(summary.n_slots, 0);
    assert_eq!((summary.free, summary.unused), (object_footprint(100), object_footprint(100)));
    assert_eq!(volume.objects().file_pages(file)?, vec![first]);
    assert!(list.is_empty());
    assert_file_consistent(&volume, file)?;

    let full = put(&volume, file, None, &[3u8; 944])?;
    assert_eq!(full.page_no, first);
    let summary = volume.objects().page_summary(full.page_id())?;
    assert_eq!(summary.unused, 0);
    assert_eq!(summary.free, object_footprint(944));
    assert_eq!(volume.objects().read_object(full)?.data, vec![3u8; 944]);
    assert_file_consistent(&volume, file)
}

#[test]
fn released_pages_return_to_the_extent_map() -> Result<()> {
    let (volume, file) = small_volume()?;
    put(&volume, file, None, &[7u8; 900])?;
    let lone = put(&volume, file, None, &[8u8; 900])?;
    let ppe = volume.options().pages_per_extent;
    let extent = strata::types::ExtentNo(lone.page_no.0 / ppe);
    let bit = 1u32 << (lone.page_no.0 % ppe);
    let used = |v: &Volume| v.extent_map().record(extent).map(|r| r.used & bit != 0);
    assert_eq!(used(&volume), Some(true));

    let mut pool = volume.dealloc_pool();
    let mut list = DeallocList::new();
    volume
        .objects()
        .destroy_object(file, lone, &mut pool, &mut list)?;
    assert_eq!(used(&volume), Some(true), "retired pages stay allocated until released");

    let released = volume.release_deallocated(&mut list, &mut pool)?;
    assert_eq!(released, 1);
    assert!(list.is_empty());
    assert_eq!(pool.available(), pool.capacity());
    assert_eq!(used(&volume), Some(false));
    Ok(())
}

#[test]
fn exhausted_pool_blocks_retirement_without_mutation() -> Result<()> {
    let (volume, file) = small_volume()?;
    put(&volume, file, None, &[1u8; 900])?;
    let a = put(&volume, file, None, &[2u8; 900])?;
    let b = put(&volume, file, None, &[3u8; 900])?;
    assert_ne!(a.page_no, b.page_no);

    let mut pool = strata::storage::DeallocPool::new(1);
    let mut list = DeallocList::new();
    volume
        .objects()
        .destroy_object(file, a, &mut pool, &mut list)?;
    let before = summaries(&volume, file)?;

    let err = volume
        .objects()
        .destroy_object(file, b, &mut pool, &mut list)
        .unwrap_err();
    assert!(matches!(err, StrataError::PoolExhausted { capacity: 1 }));
    assert_eq!(summaries(&volume, file)?, before);
    assert_eq!(volume.objects().read_object(b)?.data, vec![3u8; 900]);
    assert_eq!(list.len(), 1);
    Ok(())
}

#[test]
fn oversize_object_is_rejected_untouched() -> Result<()> {
    let (volume, file) = small_volume()?;
    put(&volume, file, None, b"resident")?;
    let max = volume.options().max_object_len();
    let entry_before = volume.objects().catalog().read_entry(file)?;
    let pages_before = summaries(&volume, file)?;
    let extents_before = volume.extent_map();

    let err = put(&volume, file, None, &vec![0u8; max + 1]).unwrap_err();
    match err {
        StrataError::UnsupportedObjectSize { len, max: limit } => {
            assert_eq!(len, max + 1);
            assert_eq!(limit, max);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(volume.objects().catalog().read_entry(file)?, entry_before);
    assert_eq!(summaries(&volume, file)?, pages_before);
    assert_eq!(volume.extent_map(), extents_before);

    let largest = put(&volume, file, None, &vec![5u8; max])?;
    assert_eq!(volume.objects().read_object(largest)?.data.len(), max);
    assert_file_consistent(&volume, file)
}

#[test]
fn inline_threshold_caps_object_size() -> Result<()> {
    init_test_logging();
    let options = StoreOptions::default().page_size(PAGE).inline_threshold(64);
    let volume = Volume::in_memory(options)?;
    let file = volume.create_file()?;
    put(&volume, file, None, &[1u8; 64])?;
    assert!(matches!(
        put(&volume, file, None, &[1u8; 65]),
        Err(StrataError::UnsupportedObjectSize { max: 64, .. })
    ));
    Ok(())
}

#[test]
fn near_placement_links_new_page_after_anchor() -> Result<()> {
    let (volume, file) = small_volume()?;
    let first = first_page(&volume, file)?;
    let anchor = put(&volume, file, None, &[1u8; 900])?;
    let tail = put(&volume, file, None, &[2u8; 900])?;
    let near = put(&volume, file, Some(anchor), &[3u8; 900])?;

    assert_ne!(near.page_no, anchor.page_no);
    assert_eq!(
        volume.objects().file_pages(file)?,
        vec![first, near.page_no, tail.page_no]
    );

    let small = put(&volume, file, Some(near), b"neighbour")?;
    assert_eq!(small.page_no, near.page_no);
    assert_file_consistent(&volume, file)
}

#[test]
fn destroy_checks_owning_file() -> Result<()> {
    let (volume, file) = small_volume()?;
    let other = volume.create_file()?;
    let oid = put(&volume, file, None, b"mine")?;

    let mut pool = volume.dealloc_pool();
    let mut list = DeallocList::new();
    let err = volume
        .objects()
        .destroy_object(other, oid, &mut pool, &mut list)
        .unwrap_err();
    assert!(matches!(err, StrataError::FileMismatch { expected, found } if expected == other && found == file));
    assert_eq!(volume.objects().read_object(oid)?.data, b"mine");

    let err = put(&volume, other, Some(oid), b"intruder").unwrap_err();
    assert!(matches!(err, StrataError::FileMismatch { .. }));
    Ok(())
}

#[test]
fn stale_and_foreign_ids_are_not_found() -> Result<()> {
    let (volume, file) = small_volume()?;
    let oid = put(&volume, file, None, b"live")?;
    let stale = ObjectId { unique: strata::types::Unique(oid.unique.0 + 100), ..oid };
    assert!(matches!(
        volume.objects().read_object(stale),
        Err(StrataError::ObjectNotFound(_))
    ));
    let beyond = ObjectId { slot: 40, ..oid };
    assert!(matches!(
        volume.objects().read_object(beyond),
        Err(StrataError::ObjectNotFound(_))
    ));
    let catalog = ObjectId { page_no: PageNo(1), ..oid };
    assert!(matches!(
        volume.objects().read_object(catalog),
        Err(StrataError::ObjectNotFound(_))
    ));
    Ok(())
}

#[test]
fn files_keep_separate_page_chains() -> Result<()> {
    let (volume, left) = small_volume()?;
    let right = volume.create_file()?;
    for i in 0..20u8 {
        put(&volume, left, None, &[i; 120])?;
        put(&volume, right, None, &[i; 80])?;
    }
    let left_pages = volume.objects().file_pages(left)?;
    let right_pages = volume.objects().file_pages(right)?;
    assert!(left_pages.iter().all(|p| !right_pages.contains(p)));
    assert_eq!(volume.objects().object_ids(left)?.len(), 20);
    assert_eq!(volume.objects().object_ids(right)?.len(), 20);
    assert_eq!(volume.files()?, vec![left, right]);
    assert_file_consistent(&volume, left)?;
    assert_file_consistent(&volume, right)
}

#[test]
fn two_objects_on_a_fresh_page_end_to_end() -> Result<()> {
    let (volume, file) = small_volume()?;
    let first = first_page(&volume, file)?;
    put(&volume, file, None, &[0u8; 900])?;

    let a_bytes: Vec<u8> = (0..100u8).collect();
    let b_bytes: Vec<u8> = (100..150u8).collect();
    let a = put(&volume, file, None, &a_bytes)?;
    let b = put(&volume, file, None, &b_bytes)?;
    assert_ne!(a.page_no, first, "A lands on a new page");
    assert_eq!(b.page_no, a.page_no, "B shares A's page");

    let mut pool = volume.dealloc_pool();
    let mut list = DeallocList::new();
    volume
        .objects()
        .destroy_object(file, a, &mut pool, &mut list)?;
    assert_eq!(volume.objects().read_object(b)?.data, b_bytes);
    let summary = volume.objects().page_summary(b.page_id())?;
    assert_eq!(summary.live_objects, 1);
    let tier = Tier::for_free(summary.contiguous_free, PAGE as usize).map_or(0, |t| t.tag());
    assert_ne!(tier, 0);
    assert_eq!(summary.tier, tier);
    assert!(list.is_empty());
    assert_file_consistent(&volume, file)?;

    volume
        .objects()
        .destroy_object(file, b, &mut pool, &mut list)?;
    assert_eq!(volume.objects().file_pages(file)?, vec![first]);
    assert_eq!(list.len(), 1);
    assert!(list.contains(&DeallocEntry::Page(b.page_id())));
    let filed: Vec<PageNo> = volume
        .objects()
        .tier_pages(file)?
        .into_iter()
        .flat_map(|(_, pages)| pages)
        .collect();
    assert!(!filed.contains(&b.page_no));
    assert_file_consistent(&volume, file)
}
