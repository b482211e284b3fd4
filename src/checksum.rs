//! CRC-32 conventions used by the supported image formats.
//!
//! Both formats use the reflected IEEE polynomial but disagree on the output
//! convention: partclone stores the raw register value (seeded with
//! `0xFFFFFFFF`, never xor-finalised, optionally carried across checksum
//! emissions), while partimage stores the conventional finalised CRC and
//! restarts it for every check record. Both are expressed here on top of
//! `crc32fast` by moving in and out of its finalised domain.

/// Initial register value for a partclone checksum run.
pub const CRC32_SEED: u32 = 0xFFFF_FFFF;

/// Advance a partclone-style CRC-32 register over `data`.
///
/// `seed` and the return value are raw register values; chain calls to
/// checksum a stream in pieces.
pub fn crc32_running(seed: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed ^ 0xFFFF_FFFF);
    hasher.update(data);
    hasher.finalize() ^ 0xFFFF_FFFF
}

/// Advance a conventional CRC-32 over `data` from a previous finalised value.
///
/// Start from `0` for a fresh checksum.
pub fn crc32_update(crc: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(crc);
    hasher.update(data);
    hasher.finalize()
}

/// Sum of all bytes interpreted as signed, as used by the partimage header
/// checksums.
pub fn signed_byte_sum(data: &[u8]) -> i32 {
    data.iter().map(|&b| b as i8 as i32).sum()
}
