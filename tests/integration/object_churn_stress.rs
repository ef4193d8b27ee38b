#![allow(missing_docs)]

use std::collections::HashMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use strata::{
    storage::{page::object_footprint, DeallocList, ObjectHeader, StoreOptions, Tier},
    types::{FileId, ObjectId, PageId, Result},
    volume::Volume,
};

const PAGE: usize = 2048;

fn check_pages(volume: &Volume, file: FileId, live: &HashMap<ObjectId, Vec<u8>>) -> Result<()> {
    let objects = volume.objects();
    for page_no in objects.file_pages(file)? {
        let summary = objects.page_summary(PageId::new(file.volume, page_no))?;
        let bytes: usize = live
            .iter()
            .filter(|(oid, _)| oid.page_no == page_no)
            .map(|(_, data)| object_footprint(data.len()))
            .sum();
        assert_eq!(summary.free - summary.unused, bytes, "page {page_no:?}");
        let tier = Tier::for_free(summary.contiguous_free, PAGE).map_or(0, |t| t.tag());
        assert_eq!(summary.tier, tier, "page {page_no:?}");
    }
    Ok(())
}

#[test]
fn seeded_churn_keeps_pages_consistent() -> Result<()> {
    let options = StoreOptions::default()
        .page_size(PAGE as u32)
        .cache_pages(32)
        .pages_per_extent(8)
        .fill_factor(75);
    let volume = Volume::in_memory(options)?;
    let file = volume.create_file()?;
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    let mut live: HashMap<ObjectId, Vec<u8>> = HashMap::new();
    let mut pool = volume.dealloc_pool();
    let mut list = DeallocList::new();

    for step in 0..2_000u32 {
        let destroy = !live.is_empty() && rng.gen_bool(0.45);
        if destroy {
            let pick = rng.gen_range(0..live.len());
            let oid = *live.keys().nth(pick).expect("non-empty");
            volume
                .objects()
                .destroy_object(file, oid, &mut pool, &mut list)?;
            live.remove(&oid);
        } else {
            let len = rng.gen_range(0..600);
            let byte = (step % 251) as u8;
            let data = vec![byte; len];
            let near = if rng.gen_bool(0.2) {
                live.keys().next().copied()
            } else {
                None
            };
            let oid = volume
                .objects()
                .create_object(file, near, &ObjectHeader::new(0, 3), &data)?;
            assert!(live.insert(oid, data).is_none(), "ids are never reissued");
        }
        if pool.available() < 4 {
            volume.release_deallocated(&mut list, &mut pool)?;
        }
        if step % 100 == 0 {
            check_pages(&volume, file, &live)?;
        }
    }

    volume.release_deallocated(&mut list, &mut pool)?;
    check_pages(&volume, file, &live)?;
    for (oid, data) in &live {
        assert_eq!(&volume.objects().read_object(*oid)?.data, data);
    }
    let mut listed = volume.objects().object_ids(file)?;
    listed.sort();
    let mut expected: Vec<ObjectId> = live.keys().copied().collect();
    expected.sort();
    assert_eq!(listed, expected);
    Ok(())
}
