//! Volume meta page (page 0).
//!
//! Layout, big-endian:
//!
//! | bytes  | field                     |
//! |--------|---------------------------|
//! | 0..4   | magic `STRV`              |
//! | 4..6   | format version            |
//! | 6..8   | volume id                 |
//! | 8..12  | page size                 |
//! | 12..16 | pages per extent          |
//! | 16..24 | salt                      |
//! | 24..28 | crc32 of bytes 32..       |
//! | 28..32 | reserved                  |
//! | 32..   | extent map                |

use std::ops::Range;

use crate::storage::extent::{ExtentMap, EXTENT_RECORD_LEN};
use crate::storage::page::{get_u16, get_u32, put_u16, put_u32};
use crate::types::{page_crc32, Result, StrataError, VolumeId};

/// Identifies the meta page.
pub const META_MAGIC: [u8; 4] = *b"STRV";
/// On-disk format version.
pub const FORMAT_VERSION: u16 = 1;
/// Bytes of fixed fields before the extent map.
pub const META_HDR_LEN: usize = 32;

const MAGIC: Range<usize> = 0..4;
const VERSION: Range<usize> = 4..6;
const VOLUME: Range<usize> = 6..8;
const PAGE_SIZE: Range<usize> = 8..12;
const PAGES_PER_EXTENT: Range<usize> = 12..16;
const SALT: Range<usize> = 16..24;
const CRC: Range<usize> = 24..28;

/// Fixed fields of the meta page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaHeader {
    /// Volume id stamped into every page.
    pub volume: VolumeId,
    /// Page size in bytes.
    pub page_size: u32,
    /// Pages per extent.
    pub pages_per_extent: u32,
    /// Random value chosen at format time.
    pub salt: u64,
}

impl MetaHeader {
    /// Reads the fixed fields without checking the checksum.
    ///
    /// Used before the page size is known, so `src` may be just the header.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < META_HDR_LEN || src[MAGIC] != META_MAGIC {
            return Err(StrataError::Corruption("not a strata volume"));
        }
        if get_u16(src, VERSION) != FORMAT_VERSION {
            return Err(StrataError::Corruption("unsupported volume format version"));
        }
        let mut salt = [0u8; 8];
        salt.copy_from_slice(&src[SALT]);
        Ok(Self {
            volume: VolumeId(get_u16(src, VOLUME)),
            page_size: get_u32(src, PAGE_SIZE),
            pages_per_extent: get_u32(src, PAGES_PER_EXTENT),
            salt: u64::from_be_bytes(salt),
        })
    }
}

/// Extents the meta page of a `page_size` volume can describe.
pub fn max_extents(page_size: usize) -> usize {
    (page_size - META_HDR_LEN - 4) / EXTENT_RECORD_LEN
}

/// Writes the header and extent map into `page` and seals it with a checksum.
pub fn write_meta(page: &mut [u8], header: &MetaHeader, map: &ExtentMap) -> Result<()> {
    page.fill(0);
    page[MAGIC].copy_from_slice(&META_MAGIC);
    put_u16(page, VOLUME, header.volume.0);
    put_u16(page, VERSION, FORMAT_VERSION);
    put_u32(page, PAGE_SIZE, header.page_size);
    put_u32(page, PAGES_PER_EXTENT, header.pages_per_extent);
    page[SALT].copy_from_slice(&header.salt.to_be_bytes());
    map.encode(&mut page[META_HDR_LEN..])?;
    let crc = page_crc32(0, header.salt, &page[META_HDR_LEN..]);
    put_u32(page, CRC, crc);
    Ok(())
}

/// Validates a full meta page and returns its header and extent map.
pub fn read_meta(page: &[u8]) -> Result<(MetaHeader, ExtentMap)> {
    let header = MetaHeader::decode(page)?;
    if header.page_size as usize != page.len() {
        return Err(StrataError::Corruption("meta page size disagrees with header"));
    }
    let expected = get_u32(page, CRC);
    if page_crc32(0, header.salt, &page[META_HDR_LEN..]) != expected {
        return Err(StrataError::Corruption("meta page checksum mismatch"));
    }
    let map = ExtentMap::decode(
        &page[META_HDR_LEN..],
        header.pages_per_extent,
        max_extents(page.len()),
    )?;
    Ok((header, map))
}
