//! Slotted data page layout.
//!
//! ```text
//! +--------+---------------------------+.........+----------------------+
//! | header | data area (grows up) ->   |  free   | <- slot n-1 .. slot 0 |
//! +--------+---------------------------+.........+----------------------+
//! 0        56                    56+free                             len
//! ```
//!
//! Object offsets stored in slots are relative to the start of the data area.
//! Holes left by destroyed objects stay in place (`unused`) until [`SlottedPage::compact`].

use std::ops::Range;

use serde::Serialize;

use crate::types::{
    decode_link, encode_link, FileId, ObjectId, PageId, PageNo, Result, StrataError, Unique,
    VolumeId,
};

/// Identifies a formatted slotted page.
pub const PAGE_MAGIC: [u8; 4] = *b"STRP";
/// Page kind byte of a slotted data page.
pub const PAGE_KIND_SLOTTED: u8 = 1;
/// Size of the fixed page header.
pub const PAGE_HDR_LEN: usize = 56;
/// Size of one slot directory entry.
pub const SLOT_LEN: usize = 8;
/// Size of the header in front of every payload.
pub const OBJECT_HDR_LEN: usize = 8;
/// Payload alignment in the data area.
pub const ALIGN: usize = 4;
/// Smallest payload footprint; a destroyed object's hole can always hold a page number.
pub const MIN_OBJECT_FOOTPRINT: usize = 4;
/// Slot offset marking a tombstone.
pub const EMPTY_SLOT: u16 = u16::MAX;

/// Header field offsets.
pub mod header {
    //! Byte offsets for fixed header fields.
    #![allow(missing_docs)]
    use core::ops::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const KIND: usize = 4;
    pub const TIER: usize = 5;
    pub const RESERVED: Range<usize> = 6..8;
    pub const VOLUME: Range<usize> = 8..10;
    pub const PAGE_NO: Range<usize> = 10..14;
    pub const FILE_VOLUME: Range<usize> = 14..16;
    pub const FILE_SERIAL: Range<usize> = 16..20;
    pub const N_SLOTS: Range<usize> = 20..22;
    pub const FREE: Range<usize> = 22..24;
    pub const UNUSED: Range<usize> = 24..26;
    pub const RESERVED_2: Range<usize> = 26..28;
    pub const PREV_PAGE: Range<usize> = 28..32;
    pub const NEXT_PAGE: Range<usize> = 32..36;
    pub const SPACE_PREV: Range<usize> = 36..40;
    pub const SPACE_NEXT: Range<usize> = 40..44;
    pub const UNIQUE: Range<usize> = 44..48;
    pub const UNIQUE_LIMIT: Range<usize> = 48..52;
    pub const RESERVED_3: Range<usize> = 52..56;
}

pub(crate) fn get_u16(buf: &[u8], at: Range<usize>) -> u16 {
    u16::from_be_bytes([buf[at.start], buf[at.start + 1]])
}

pub(crate) fn get_u32(buf: &[u8], at: Range<usize>) -> u32 {
    let s = at.start;
    u32::from_be_bytes([buf[s], buf[s + 1], buf[s + 2], buf[s + 3]])
}

pub(crate) fn put_u16(buf: &mut [u8], at: Range<usize>, v: u16) {
    buf[at].copy_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], at: Range<usize>, v: u32) {
    buf[at].copy_from_slice(&v.to_be_bytes());
}

/// `len` rounded up to [`ALIGN`].
pub const fn aligned_len(len: usize) -> usize {
    (len + ALIGN - 1) & !(ALIGN - 1)
}

/// Bytes an object of `len` payload bytes occupies in the data area.
pub const fn object_footprint(len: usize) -> usize {
    let aligned = aligned_len(len);
    OBJECT_HDR_LEN
        + if aligned > MIN_OBJECT_FOOTPRINT {
            aligned
        } else {
            MIN_OBJECT_FOOTPRINT
        }
}

/// Space an insert must find on a page: the object plus one slot entry.
pub const fn needed_space(len: usize) -> usize {
    object_footprint(len) + SLOT_LEN
}

/// Largest payload that always fits on a freshly formatted page.
pub const fn max_inline_len(page_size: usize) -> usize {
    let room = page_size.saturating_sub(PAGE_HDR_LEN + OBJECT_HDR_LEN + 2 * SLOT_LEN);
    room & !(ALIGN - 1)
}

/// Per-object header stored in front of the payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Caller-defined property bits.
    pub properties: u16,
    /// Caller-defined type tag.
    pub tag: u16,
    /// Payload length in bytes; filled in on insert.
    pub length: u32,
}

impl ObjectHeader {
    /// A template header; `length` is set when the object is stored.
    pub fn new(properties: u16, tag: u16) -> Self {
        Self {
            properties,
            tag,
            length: 0,
        }
    }

    fn encode(&self, dst: &mut [u8]) {
        put_u16(dst, 0..2, self.properties);
        put_u16(dst, 2..4, self.tag);
        put_u32(dst, 4..8, self.length);
    }

    fn decode(src: &[u8]) -> Self {
        Self {
            properties: get_u16(src, 0..2),
            tag: get_u16(src, 2..4),
            length: get_u32(src, 4..8),
        }
    }
}

/// One slot directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    /// Data-area offset of the object, `None` for a tombstone.
    pub offset: Option<u16>,
    /// Tag the slot was last bound with.
    pub unique: Unique,
}

impl Slot {
    /// True for a tombstone.
    pub fn is_empty(&self) -> bool {
        self.offset.is_none()
    }
}

/// Outcome of [`SlottedPage::remove_object`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Removed {
    /// Bytes the object held in the data area.
    pub footprint: usize,
    /// True when the object was the last appended one and `free` moved back.
    pub reclaimed: bool,
}

/// Flat view of a page header, used by inspection tooling.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct PageSummary {
    /// Page number.
    pub page_no: u32,
    /// Serial of the owning file.
    pub file_serial: u32,
    /// Slot directory length, tombstones included.
    pub n_slots: u16,
    /// Slots holding an object.
    pub live_objects: usize,
    /// End of the last appended object.
    pub free: usize,
    /// Bytes held by holes below `free`.
    pub unused: usize,
    /// Room between the data area and the slot directory.
    pub contiguous_free: usize,
    /// Tier tag, 0 when the page is in no tier.
    pub tier: u8,
    /// Previous page in the file chain.
    pub prev_page: Option<u32>,
    /// Next page in the file chain.
    pub next_page: Option<u32>,
}

/// Typed view over the bytes of one slotted page.
pub struct SlottedPage<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> SlottedPage<B> {
    /// Wraps an already formatted page, validating its header.
    pub fn open(buf: B) -> Result<Self> {
        let page = Self { buf };
        page.validate()?;
        Ok(page)
    }

    fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    fn validate(&self) -> Result<()> {
        let bytes = self.bytes();
        if bytes.len() < PAGE_HDR_LEN + SLOT_LEN || bytes.len() - PAGE_HDR_LEN >= EMPTY_SLOT as usize
        {
            return Err(StrataError::Corruption("slotted page has unsupported length"));
        }
        if bytes[header::MAGIC] != PAGE_MAGIC {
            return Err(StrataError::Corruption("invalid slotted page magic"));
        }
        if bytes[header::KIND] != PAGE_KIND_SLOTTED {
            return Err(StrataError::Corruption("page is not a slotted data page"));
        }
        let dir = self.n_slots() as usize * SLOT_LEN;
        if self.free() + dir > self.data_capacity() {
            return Err(StrataError::Corruption("slot directory overlaps data area"));
        }
        if self.unused() > self.free() {
            return Err(StrataError::Corruption("unused bytes exceed allocated bytes"));
        }
        Ok(())
    }

    /// Identity stamped at format time.
    pub fn page_id(&self) -> PageId {
        let bytes = self.bytes();
        PageId::new(
            VolumeId(get_u16(bytes, header::VOLUME)),
            PageNo(get_u32(bytes, header::PAGE_NO)),
        )
    }

    /// File owning the page.
    pub fn file_id(&self) -> FileId {
        let bytes = self.bytes();
        FileId::new(
            VolumeId(get_u16(bytes, header::FILE_VOLUME)),
            get_u32(bytes, header::FILE_SERIAL),
        )
    }

    /// Slot directory length, tombstones included.
    pub fn n_slots(&self) -> u16 {
        get_u16(self.bytes(), header::N_SLOTS)
    }

    /// Offset where the next object is appended.
    pub fn free(&self) -> usize {
        get_u16(self.bytes(), header::FREE) as usize
    }

    /// Bytes held by holes below [`SlottedPage::free`].
    pub fn unused(&self) -> usize {
        get_u16(self.bytes(), header::UNUSED) as usize
    }

    /// Previous page of the file chain.
    pub fn prev_page(&self) -> Option<PageNo> {
        decode_link(get_u32(self.bytes(), header::PREV_PAGE))
    }

    /// Next page of the file chain.
    pub fn next_page(&self) -> Option<PageNo> {
        decode_link(get_u32(self.bytes(), header::NEXT_PAGE))
    }

    /// Previous page of the same free-space tier.
    pub fn space_prev(&self) -> Option<PageNo> {
        decode_link(get_u32(self.bytes(), header::SPACE_PREV))
    }

    /// Next page of the same free-space tier.
    pub fn space_next(&self) -> Option<PageNo> {
        decode_link(get_u32(self.bytes(), header::SPACE_NEXT))
    }

    /// Raw tier tag: 0 when the page is in no tier.
    pub fn tier_tag(&self) -> u8 {
        self.bytes()[header::TIER]
    }

    /// Next unique tag this page hands out.
    pub fn unique(&self) -> u32 {
        get_u32(self.bytes(), header::UNIQUE)
    }

    /// End of the tag batch reserved from the catalog.
    pub fn unique_limit(&self) -> u32 {
        get_u32(self.bytes(), header::UNIQUE_LIMIT)
    }

    /// Page size in bytes.
    pub fn page_len(&self) -> usize {
        self.bytes().len()
    }

    /// Bytes shared by the data area and the slot directory.
    pub fn data_capacity(&self) -> usize {
        self.page_len() - PAGE_HDR_LEN
    }

    /// Free bytes between the end of the data area and the slot directory.
    pub fn contiguous_free(&self) -> usize {
        let used = self.free() + self.n_slots() as usize * SLOT_LEN;
        self.data_capacity().saturating_sub(used)
    }

    /// Free bytes available once the page is compacted.
    pub fn compactable_free(&self) -> usize {
        self.contiguous_free() + self.unused()
    }

    fn slot_range(&self, idx: u16) -> Range<usize> {
        let end = self.page_len() - idx as usize * SLOT_LEN;
        end - SLOT_LEN..end
    }

    /// Slot directory entry `idx`.
    pub fn slot(&self, idx: u16) -> Result<Slot> {
        if idx >= self.n_slots() {
            return Err(StrataError::Invalid("slot index beyond slot directory"));
        }
        let range = self.slot_range(idx);
        let raw = &self.bytes()[range];
        let offset = get_u16(raw, 0..2);
        Ok(Slot {
            offset: (offset != EMPTY_SLOT).then_some(offset),
            unique: Unique(get_u32(raw, 4..8)),
        })
    }

    /// Live slots in ascending index order.
    pub fn live_slots(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        (0..self.n_slots()).filter_map(move |idx| {
            self.slot(idx)
                .ok()
                .and_then(|slot| slot.offset.map(|offset| (idx, offset)))
        })
    }

    /// Number of live objects.
    pub fn live_count(&self) -> usize {
        self.live_slots().count()
    }

    /// True when no slot holds an object.
    pub fn is_empty(&self) -> bool {
        self.live_slots().next().is_none()
    }

    /// Object header at data-area `offset`.
    pub fn object_header(&self, offset: u16) -> Result<ObjectHeader> {
        let start = PAGE_HDR_LEN + offset as usize;
        if offset as usize + OBJECT_HDR_LEN > self.free() {
            return Err(StrataError::Corruption("object header beyond free offset"));
        }
        Ok(ObjectHeader::decode(&self.bytes()[start..start + OBJECT_HDR_LEN]))
    }

    /// Header and payload of the object at data-area `offset`.
    pub fn object_at(&self, offset: u16) -> Result<(ObjectHeader, &[u8])> {
        let header = self.object_header(offset)?;
        let start = PAGE_HDR_LEN + offset as usize + OBJECT_HDR_LEN;
        let end = start + header.length as usize;
        if offset as usize + object_footprint(header.length as usize) > self.free() {
            return Err(StrataError::Corruption("object extends past free offset"));
        }
        Ok((header, &self.bytes()[start..end]))
    }

    /// Resolves `oid` to its data offset if the slot is live and the unique tag matches.
    pub fn locate(&self, oid: &ObjectId) -> Option<u16> {
        if oid.page_id() != self.page_id() {
            return None;
        }
        let slot = self.slot(oid.slot).ok()?;
        match slot.offset {
            Some(offset) if slot.unique == oid.unique => Some(offset),
            _ => None,
        }
    }

    /// Snapshot of the header fields.
    pub fn summary(&self) -> PageSummary {
        PageSummary {
            page_no: self.page_id().page_no.0,
            file_serial: self.file_id().serial,
            n_slots: self.n_slots(),
            live_objects: self.live_count(),
            free: self.free(),
            unused: self.unused(),
            contiguous_free: self.contiguous_free(),
            tier: self.tier_tag(),
            prev_page: self.prev_page().map(|p| p.0),
            next_page: self.next_page().map(|p| p.0),
        }
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SlottedPage<B> {
    /// Formats `buf` as an empty page owned by `file`.
    pub fn init(mut buf: B, page: PageId, file: FileId) -> Result<Self> {
        {
            let bytes = buf.as_mut();
            let len = bytes.len();
            if len < PAGE_HDR_LEN + SLOT_LEN || len - PAGE_HDR_LEN >= EMPTY_SLOT as usize {
                return Err(StrataError::Invalid("page size unsupported by slotted layout"));
            }
            bytes[..PAGE_HDR_LEN].fill(0);
            bytes[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            bytes[header::KIND] = PAGE_KIND_SLOTTED;
            bytes[header::TIER] = 0;
            put_u16(bytes, header::VOLUME, page.volume.0);
            put_u32(bytes, header::PAGE_NO, page.page_no.0);
            put_u16(bytes, header::FILE_VOLUME, file.volume.0);
            put_u32(bytes, header::FILE_SERIAL, file.serial);
            put_u16(bytes, header::N_SLOTS, 1);
            put_u16(bytes, header::FREE, 0);
            put_u16(bytes, header::UNUSED, 0);
            for link in [
                header::PREV_PAGE,
                header::NEXT_PAGE,
                header::SPACE_PREV,
                header::SPACE_NEXT,
            ] {
                put_u32(bytes, link, encode_link(None));
            }
            put_u32(bytes, header::UNIQUE, 0);
            put_u32(bytes, header::UNIQUE_LIMIT, 0);
        }
        let mut page = Self { buf };
        page.write_slot(
            0,
            Slot {
                offset: None,
                unique: Unique(0),
            },
        );
        Ok(page)
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    fn set_n_slots(&mut self, n: u16) {
        put_u16(self.bytes_mut(), header::N_SLOTS, n);
    }

    fn set_free(&mut self, free: usize) {
        put_u16(self.bytes_mut(), header::FREE, free as u16);
    }

    fn set_unused(&mut self, unused: usize) {
        put_u16(self.bytes_mut(), header::UNUSED, unused as u16);
    }

    /// Links the previous chain page.
    pub fn set_prev_page(&mut self, page: Option<PageNo>) {
        put_u32(self.bytes_mut(), header::PREV_PAGE, encode_link(page));
    }

    /// Links the next chain page.
    pub fn set_next_page(&mut self, page: Option<PageNo>) {
        put_u32(self.bytes_mut(), header::NEXT_PAGE, encode_link(page));
    }

    /// Links the previous tier page.
    pub fn set_space_prev(&mut self, page: Option<PageNo>) {
        put_u32(self.bytes_mut(), header::SPACE_PREV, encode_link(page));
    }

    /// Links the next tier page.
    pub fn set_space_next(&mut self, page: Option<PageNo>) {
        put_u32(self.bytes_mut(), header::SPACE_NEXT, encode_link(page));
    }

    /// Records the tier the page is filed in.
    pub fn set_tier_tag(&mut self, tag: u8) {
        self.bytes_mut()[header::TIER] = tag;
    }

    /// Stores the tag cursor and the end of its reserved batch.
    pub fn set_unique(&mut self, next: u32, limit: u32) {
        let bytes = self.bytes_mut();
        put_u32(bytes, header::UNIQUE, next);
        put_u32(bytes, header::UNIQUE_LIMIT, limit);
    }

    fn write_slot(&mut self, idx: u16, slot: Slot) {
        let range = self.slot_range(idx);
        let raw = &mut self.bytes_mut()[range];
        put_u16(raw, 0..2, slot.offset.unwrap_or(EMPTY_SLOT));
        put_u16(raw, 2..4, 0);
        put_u32(raw, 4..8, slot.unique.0);
    }

    /// Lowest tombstoned slot, or a new slot at the end of the directory.
    fn claim_slot(&mut self) -> Result<u16> {
        let n_slots = self.n_slots();
        for idx in 0..n_slots {
            if self.slot(idx)?.is_empty() {
                return Ok(idx);
            }
        }
        if (n_slots as usize + 1) * SLOT_LEN + self.free() > self.data_capacity() {
            return Err(StrataError::Corruption("no room to grow slot directory"));
        }
        self.set_n_slots(n_slots + 1);
        Ok(n_slots)
    }

    /// Appends an object at `free` and binds it to a slot.
    ///
    /// The caller guarantees `needed_space(data.len()) <= contiguous_free()`.
    /// `next_unique` is asked for the tag after the slot is chosen.
    pub fn insert_object<F>(
        &mut self,
        template: &ObjectHeader,
        data: &[u8],
        next_unique: F,
    ) -> Result<(u16, Unique)>
    where
        F: FnOnce(&mut Self) -> Result<Unique>,
    {
        let footprint = object_footprint(data.len());
        if footprint + SLOT_LEN > self.contiguous_free() {
            return Err(StrataError::Invalid("object does not fit contiguously"));
        }
        let offset = self.free();
        let header = ObjectHeader {
            length: data.len() as u32,
            ..*template
        };
        {
            let start = PAGE_HDR_LEN + offset;
            let bytes = self.bytes_mut();
            header.encode(&mut bytes[start..start + OBJECT_HDR_LEN]);
            let payload = start + OBJECT_HDR_LEN;
            bytes[payload..payload + data.len()].copy_from_slice(data);
            bytes[payload + data.len()..start + footprint].fill(0);
        }
        let slot = self.claim_slot()?;
        let unique = next_unique(self)?;
        self.write_slot(
            slot,
            Slot {
                offset: Some(offset as u16),
                unique,
            },
        );
        self.set_free(offset + footprint);
        Ok((slot, unique))
    }

    /// Tombstones `slot` and accounts for the space it held.
    pub fn remove_object(&mut self, slot: u16) -> Result<Removed> {
        let current = self.slot(slot)?;
        let offset = current
            .offset
            .ok_or(StrataError::Invalid("slot is already empty"))?;
        let header = self.object_header(offset)?;
        let footprint = object_footprint(header.length as usize);
        self.write_slot(
            slot,
            Slot {
                offset: None,
                unique: current.unique,
            },
        );
        let reclaimed = offset as usize + footprint == self.free();
        if reclaimed {
            // Holes below the removed object stay in `unused` until compaction.
            let free = self.free() - footprint;
            self.set_free(free);
        } else {
            let unused = self.unused() + footprint;
            self.set_unused(unused);
        }
        let mut n_slots = self.n_slots();
        while n_slots > 0 && self.slot(n_slots - 1)?.is_empty() {
            n_slots -= 1;
            self.set_n_slots(n_slots);
        }
        Ok(Removed {
            footprint,
            reclaimed,
        })
    }

    /// Slides live objects to the start of the data area in slot order.
    pub fn compact(&mut self) -> Result<()> {
        let live: Vec<(u16, u16)> = self.live_slots().collect();
        let mut packed = Vec::with_capacity(self.free() - self.unused());
        let mut moved = Vec::with_capacity(live.len());
        for (idx, offset) in live {
            let header = self.object_header(offset)?;
            let footprint = object_footprint(header.length as usize);
            let start = PAGE_HDR_LEN + offset as usize;
            moved.push((idx, packed.len() as u16));
            packed.extend_from_slice(&self.bytes()[start..start + footprint]);
        }
        let end = packed.len();
        self.bytes_mut()[PAGE_HDR_LEN..PAGE_HDR_LEN + end].copy_from_slice(&packed);
        for (idx, offset) in moved {
            let unique = self.slot(idx)?.unique;
            self.write_slot(
                idx,
                Slot {
                    offset: Some(offset),
                    unique,
                },
            );
        }
        self.set_free(end);
        self.set_unused(0);
        Ok(())
    }
}
