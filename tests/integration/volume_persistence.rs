#![allow(missing_docs)]

use std::fs;

use strata::{
    storage::{DeallocList, ObjectHeader, StoreOptions},
    types::{Result, StrataError},
    volume::Volume,
};
use tempfile::tempdir;

fn options() -> StoreOptions {
    StoreOptions::default().page_size(1024).cache_pages(8)
}

#[test]
fn objects_survive_flush_and_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("objects.strata");

    let (file, ids) = {
        let volume = Volume::create(&path, options())?;
        let file = volume.create_file()?;
        let mut ids = Vec::new();
        for i in 0..40u16 {
            let payload = vec![i as u8; 50 + i as usize];
            let oid = volume
                .objects()
                .create_object(file, None, &ObjectHeader::new(i, i * 2), &payload)?;
            ids.push((oid, payload));
        }
        volume.flush()?;
        (file, ids)
    };

    let volume = Volume::open(&path, StoreOptions::default())?;
    assert_eq!(volume.page_size(), 1024);
    assert_eq!(volume.files()?, vec![file]);
    for (i, (oid, payload)) in ids.iter().enumerate() {
        let object = volume.objects().read_object(*oid)?;
        assert_eq!(&object.data, payload);
        assert_eq!(object.header.properties, i as u16);
        assert_eq!(object.header.tag, i as u16 * 2);
    }
    let listed = volume.objects().object_ids(file)?;
    assert_eq!(listed.len(), ids.len());
    Ok(())
}

#[test]
fn extent_map_and_unique_counter_persist() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("extents.strata");

    let (file, map, last) = {
        let volume = Volume::create(&path, options())?;
        let file = volume.create_file()?;
        let mut last = None;
        for _ in 0..12 {
            last = Some(
                volume
                    .objects()
                    .create_object(file, None, &ObjectHeader::new(0, 0), &[9u8; 400])?,
            );
        }
        volume.flush()?;
        (file, volume.extent_map(), last)
    };
    let last = last.expect("objects were created");

    let volume = Volume::open(&path, options())?;
    assert_eq!(volume.extent_map(), map);
    let fresh = volume
        .objects()
        .create_object(file, Some(last), &ObjectHeader::new(0, 0), b"later")?;
    assert!(fresh.unique > last.unique);
    Ok(())
}

#[test]
fn released_pages_stay_free_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("released.strata");

    let (file, retired) = {
        let volume = Volume::create(&path, options())?;
        let file = volume.create_file()?;
        volume
            .objects()
            .create_object(file, None, &ObjectHeader::default(), &[1u8; 900])?;
        let lone = volume
            .objects()
            .create_object(file, None, &ObjectHeader::default(), &[2u8; 900])?;
        let mut pool = volume.dealloc_pool();
        let mut list = DeallocList::new();
        volume
            .objects()
            .destroy_object(file, lone, &mut pool, &mut list)?;
        assert_eq!(volume.release_deallocated(&mut list, &mut pool)?, 1);
        volume.flush()?;
        (file, lone)
    };

    let volume = Volume::open(&path, options())?;
    assert_eq!(volume.objects().file_pages(file)?.len(), 1);
    let ppe = volume.options().pages_per_extent;
    let record = volume
        .extent_map()
        .record(strata::types::ExtentNo(retired.page_no.0 / ppe))
        .expect("extent recorded");
    assert_eq!(record.used & (1 << (retired.page_no.0 % ppe)), 0);
    assert!(matches!(
        volume.objects().read_object(retired),
        Err(StrataError::ObjectNotFound(_))
    ));
    Ok(())
}

#[test]
fn create_refuses_existing_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("taken.strata");
    fs::write(&path, b"occupied")?;
    assert!(matches!(
        Volume::create(&path, options()),
        Err(StrataError::Io(_))
    ));
    Ok(())
}

#[test]
fn open_rejects_damaged_meta_page() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("damaged.strata");
    {
        let volume = Volume::create(&path, options())?;
        volume.create_file()?;
        volume.flush()?;
    }
    let mut bytes = fs::read(&path)?;
    bytes[40] ^= 0xFF;
    fs::write(&path, &bytes)?;
    assert!(matches!(
        Volume::open(&path, options()),
        Err(StrataError::Corruption(_))
    ));
    Ok(())
}

#[test]
fn small_cache_evicts_and_writes_back() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("evict.strata");
    let volume = Volume::create(&path, StoreOptions::default().page_size(512).cache_pages(4))?;
    let file = volume.create_file()?;
    let mut ids = Vec::new();
    for i in 0..30u8 {
        ids.push(
            volume
                .objects()
                .create_object(file, None, &ObjectHeader::default(), &[i; 200])?,
        );
    }
    let stats = volume.cache_stats();
    assert!(stats.evictions > 0);
    assert!(stats.dirty_writebacks > 0);
    for (i, oid) in ids.iter().enumerate() {
        assert_eq!(volume.objects().read_object(*oid)?.data, vec![i as u8; 200]);
    }
    Ok(())
}
