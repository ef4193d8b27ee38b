#![forbid(unsafe_code)]
//! Identifiers, the crate error type and shared on-disk constants.

use std::fmt;
use std::str::FromStr;

/// Page checksums.
pub mod checksum;

pub use checksum::page_crc32;

/// Number of a volume (one database file).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct VolumeId(pub u16);

/// Page number within a volume.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageNo(pub u32);

/// Index of an extent within a volume.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ExtentNo(pub u32);

/// Tag that disambiguates reuse of a slot index.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Unique(pub u32);

/// Fully qualified page identity.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId {
    /// Volume holding the page.
    pub volume: VolumeId,
    /// Page number within the volume.
    pub page_no: PageNo,
}

impl PageId {
    /// Names page `page_no` of `volume`.
    pub const fn new(volume: VolumeId, page_no: PageNo) -> Self {
        Self { volume, page_no }
    }
}

/// Identity of a data file: the volume it lives on plus a per-volume serial.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FileId {
    /// Volume holding the file.
    pub volume: VolumeId,
    /// Per-volume serial, starting at 1.
    pub serial: u32,
}

impl FileId {
    /// Names file `serial` of `volume`.
    pub const fn new(volume: VolumeId, serial: u32) -> Self {
        Self { volume, serial }
    }
}

/// External name of an object: page, slot index and the slot's unique tag.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ObjectId {
    /// Volume holding the object.
    pub volume: VolumeId,
    /// Page holding the object.
    pub page_no: PageNo,
    /// Slot directory index.
    pub slot: u16,
    /// Tag the slot was bound with when the object was stored.
    pub unique: Unique,
}

impl ObjectId {
    /// Names `slot` of `page` as bound with `unique`.
    pub const fn new(page: PageId, slot: u16, unique: Unique) -> Self {
        Self {
            volume: page.volume,
            page_no: page.page_no,
            slot,
            unique,
        }
    }

    /// Page holding the object.
    pub const fn page_id(&self) -> PageId {
        PageId::new(self.volume, self.page_no)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.volume.0, self.page_no.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.volume.0, self.serial)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.volume.0, self.page_no.0, self.slot, self.unique.0
        )
    }
}

impl FromStr for ObjectId {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let volume = parse_field::<u16>(&mut parts, "object id volume is missing or malformed")?;
        let page_no = parse_field::<u32>(&mut parts, "object id page is missing or malformed")?;
        let slot = parse_field::<u16>(&mut parts, "object id slot is missing or malformed")?;
        let unique =
            parse_field::<u32>(&mut parts, "object id unique tag is missing or malformed")?;
        if parts.next().is_some() {
            return Err(StrataError::Invalid("object id has trailing fields"));
        }
        Ok(ObjectId {
            volume: VolumeId(volume),
            page_no: PageNo(page_no),
            slot,
            unique: Unique(unique),
        })
    }
}

fn parse_field<'a, T: FromStr>(
    parts: &mut impl Iterator<Item = &'a str>,
    what: &'static str,
) -> Result<T> {
    parts
        .next()
        .and_then(|raw| raw.parse::<T>().ok())
        .ok_or(StrataError::Invalid(what))
}

/// Every failure the store reports.
#[derive(thiserror::Error, Debug)]
pub enum StrataError {
    /// The backing file failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk structures are inconsistent.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A caller-supplied value is out of range.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A named item is missing.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// The id does not name a live object.
    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),
    /// The page belongs to another file.
    #[error("object belongs to file {found}, not {expected}")]
    FileMismatch {
        /// File the caller named.
        expected: FileId,
        /// File owning the page.
        found: FileId,
    },
    /// The payload exceeds the inline limit.
    #[error("object of {len} bytes exceeds the inline limit of {max} bytes")]
    UnsupportedObjectSize {
        /// Requested payload length.
        len: usize,
        /// Largest accepted payload length.
        max: usize,
    },
    /// The deallocation pool has no element left.
    #[error("deallocation pool exhausted ({capacity} elements)")]
    PoolExhausted {
        /// Size of the exhausted pool.
        capacity: usize,
    },
    /// No extent can be claimed.
    #[error("volume has no free extent")]
    VolumeFull,
    /// Every frame of the buffer pool is pinned.
    #[error("buffer pool full: all {0} frames are pinned")]
    CacheFull(usize),
    /// A config file could not be read or parsed.
    #[error("config: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Sentinel stored on disk for an absent page link.
pub const NIL_PAGE: u32 = u32::MAX;

/// Encodes an optional page number for a header link field.
pub fn encode_link(page: Option<PageNo>) -> u32 {
    page.map_or(NIL_PAGE, |p| p.0)
}

/// Decodes a header link field.
pub fn decode_link(raw: u32) -> Option<PageNo> {
    (raw != NIL_PAGE).then_some(PageNo(raw))
}
