//! Partclone image parser (format version 0002).
//!
//! The on-disk descriptor is 110 bytes of three packed structs plus a CRC:
//!   image head (36 bytes):
//!     magic[16] + tool_version[14] + image_version[4] + endianness(u16)
//!   file system info (52 bytes):
//!     fs[16] + device_size(u64) + total_blocks(u64) + superblock_used(u64)
//!     + bitmap_used(u64) + block_size(u32)
//!   image options (18 bytes):
//!     feature_size(u32) + image_version(u16) + cpu_bits(u16)
//!     + checksum_mode(u16) + checksum_size(u16) + blocks_per_checksum(u32)
//!     + reseed_checksum(u8) + bitmap_mode(u8)
//!   crc32(u32)
//! The bitmap follows (packed bits or one byte per block, per bitmap_mode),
//! terminated by its own CRC-32. Both CRCs use partclone's un-finalised
//! convention.

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};

use crate::bitmap::Bitmap;
use crate::checksum::{crc32_running, CRC32_SEED};
use crate::error::{ImageError, Result};
use crate::image::{nul_terminated, ChecksumKind, ChecksumSpec, ImageFormat, ImageHeader};

pub(crate) const MAGIC: &[u8; 16] = b"partclone-image\0";

const HEADER_SIZE: usize = 110;
/// The descriptor CRC covers everything before itself.
const HEADER_CRC_SPAN: usize = 106;

const ENDIAN_LITTLE: u16 = 0xC0DE;
const ENDIAN_BIG: u16 = 0xDEC0;

const CHECKSUM_MODE_NONE: u16 = 0;
const CHECKSUM_MODE_CRC32: u16 = 32;

const BITMAP_MODE_BIT: u8 = 1;
const BITMAP_MODE_BYTE: u8 = 8;

pub(crate) struct ParsedPartclone {
    pub header: ImageHeader,
    pub bitmap: Bitmap,
}

/// Parse header and bitmap, leaving `reader` positioned at the blocks section.
pub(crate) fn parse(reader: &mut impl Read) -> Result<ParsedPartclone> {
    let mut raw = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw)?;

    if &raw[..MAGIC.len()] != MAGIC {
        return Err(ImageError::UnknownFormat(raw[..MAGIC.len()].to_vec()));
    }

    let image_version = String::from_utf8_lossy(&raw[30..34]).into_owned();
    if image_version != "0002" {
        return Err(ImageError::UnsupportedVersion {
            format: "partclone",
            version: image_version,
        });
    }

    match LittleEndian::read_u16(&raw[34..36]) {
        ENDIAN_LITTLE => {}
        ENDIAN_BIG => {
            return Err(ImageError::UnsupportedVersion {
                format: "partclone",
                version: "big-endian".to_string(),
            })
        }
        other => {
            return Err(ImageError::CorruptHeader(format!(
                "unexpected endianness marker {other:#06x}"
            )))
        }
    }

    let fs_label = nul_terminated(&raw[36..52]);

    let _device_size = LittleEndian::read_u64(&raw[52..60]);
    let total_blocks = LittleEndian::read_u64(&raw[60..68]);
    let superblock_used = LittleEndian::read_u64(&raw[68..76]);
    let bitmap_used = LittleEndian::read_u64(&raw[76..84]);
    let block_size = LittleEndian::read_u32(&raw[84..88]);
    let _feature_size = LittleEndian::read_u32(&raw[88..92]);
    let _image_version_minor = LittleEndian::read_u16(&raw[92..94]);
    let _cpu_bits = LittleEndian::read_u16(&raw[94..96]);
    let checksum_mode = LittleEndian::read_u16(&raw[96..98]);
    let checksum_size = LittleEndian::read_u16(&raw[98..100]);
    let blocks_per_checksum = LittleEndian::read_u32(&raw[100..104]);
    let reseed_checksum = raw[104];
    let bitmap_mode = raw[105];
    let header_crc = LittleEndian::read_u32(&raw[106..110]);

    let computed = crc32_running(CRC32_SEED, &raw[..HEADER_CRC_SPAN]);
    if computed != header_crc {
        return Err(ImageError::CorruptHeader(format!(
            "descriptor CRC mismatch: stored {header_crc:#010x}, computed {computed:#010x}"
        )));
    }

    if block_size == 0 {
        return Err(ImageError::CorruptHeader("block size is zero".to_string()));
    }
    if checksum_mode != CHECKSUM_MODE_NONE && checksum_mode != CHECKSUM_MODE_CRC32 {
        return Err(ImageError::CorruptHeader(format!(
            "unsupported checksum mode {checksum_mode}"
        )));
    }

    // Bitmap, in either encoding, followed by its CRC over the raw bytes.
    let bitmap_len = match bitmap_mode {
        BITMAP_MODE_BIT => total_blocks.div_ceil(8),
        BITMAP_MODE_BYTE => total_blocks,
        other => {
            return Err(ImageError::CorruptHeader(format!(
                "unsupported bitmap mode {other}"
            )))
        }
    } as usize;

    let mut bitmap_raw = vec![0u8; bitmap_len];
    reader.read_exact(&mut bitmap_raw)?;
    let mut crc_buf = [0u8; 4];
    reader.read_exact(&mut crc_buf)?;
    let bitmap_crc = LittleEndian::read_u32(&crc_buf);
    let computed = crc32_running(CRC32_SEED, &bitmap_raw);
    if computed != bitmap_crc {
        return Err(ImageError::CorruptBitmap(format!(
            "bitmap CRC mismatch: stored {bitmap_crc:#010x}, computed {computed:#010x}"
        )));
    }

    let bitmap = match bitmap_mode {
        BITMAP_MODE_BIT => Bitmap::from_bit_bytes(bitmap_raw, total_blocks)?,
        _ => Bitmap::from_byte_mode(&bitmap_raw, total_blocks)?,
    };

    // The header carries two used-block counts (superblock-derived and
    // bitmap-derived); the bitmap itself is authoritative for block layout
    // and must agree with the larger of the two.
    let used_blocks = superblock_used.max(bitmap_used);
    let popcount = bitmap.count_ones();
    if popcount != used_blocks {
        return Err(ImageError::CorruptBitmap(format!(
            "{used_blocks} blocks in use according to header but {popcount} found in bitmap"
        )));
    }

    let checksum = if checksum_mode == CHECKSUM_MODE_CRC32 && checksum_size > 0 {
        ChecksumSpec {
            kind: ChecksumKind::Crc32,
            size: checksum_size as u32,
            blocks_per_sum: blocks_per_checksum,
            reseed: reseed_checksum != 0,
        }
    } else {
        ChecksumSpec::NONE
    };

    let header = ImageHeader {
        format: ImageFormat::Partclone,
        fs_label,
        block_size,
        total_blocks,
        used_blocks,
        blocks_section_offset: (HEADER_SIZE + bitmap_len + 4) as u64,
        checksum,
    };

    Ok(ParsedPartclone { header, bitmap })
}
