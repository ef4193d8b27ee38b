#![forbid(unsafe_code)]

/// CRC32 over a system page image, seeded with the page number and the volume salt
/// so that a page copied to the wrong location fails verification.
pub fn page_crc32(page_no: u32, salt: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(&salt.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
