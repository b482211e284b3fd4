//! Partimage image parser.
//!
//! A partimage file opens with a 512-byte volume header, then a sequence of
//! 16388-byte header blocks (16384 bytes of payload plus a signed-byte-sum
//! checksum) and `MAGIC-BEGIN-<NAME>` delimited segments: local header,
//! per-filesystem info header, optional MBR dumps, the used-block bitmap and
//! finally the data blocks. Segment order is discovered by scanning, not
//! assumed, and unknown segments are skipped — which is also what makes every
//! filesystem partimage supports readable here without per-fs decoding.
//!
//! Inside the data section a 16-byte `CHK\0` record (CRC-32 plus writer
//! position) follows every 64 KiB of block payload.

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::bitmap::Bitmap;
use crate::checksum::signed_byte_sum;
use crate::error::{ImageError, Result};
use crate::image::{nul_terminated, ChecksumKind, ChecksumSpec, ImageFormat, ImageHeader};

pub(crate) const MAGIC: &[u8; 16] = b"PaRtImAgE-VoLuMe";

const VOLUME_HEADER_SIZE: usize = 512;
/// Header block payload plus its 4-byte checksum.
const HEADER_BLOCK_SIZE: usize = 16388;
const HEADER_PAYLOAD_SIZE: usize = 16384;

const MAGIC_BEGIN: &[u8] = b"MAGIC-BEGIN-";
const SEG_LOCALHEADER: &[u8] = b"MAGIC-BEGIN-LOCALHEADER";
const SEG_INFO: &[u8] = b"MAGIC-BEGIN-INFO";
const SEG_BITMAP: &[u8] = b"MAGIC-BEGIN-BITMAP";
const SEG_DATABLOCKS: &[u8] = b"MAGIC-BEGIN-DATABLOCKS";
/// Longest token we must be able to read in one piece.
const TOKEN_SPAN: usize = 28;
const READ_SIZE: usize = 1024;

/// A `CHK\0` + crc32 + position record every this many payload bytes.
pub(crate) const CHECK_FREQUENCY: u32 = 65536;
pub(crate) const CHECK_MAGIC: &[u8; 4] = b"CHK\0";
pub(crate) const CHECK_SIZE: u32 = 16;

pub(crate) struct ParsedPartimage {
    pub header: ImageHeader,
    pub bitmap: Bitmap,
}

struct LocalHeader {
    block_size: u64,
    used_blocks: u64,
    block_count: u64,
    bitmap_size: u64,
    label: String,
}

/// Parse all headers, leaving `reader` positioned at the data blocks.
pub(crate) fn parse(reader: &mut impl Read) -> Result<ParsedPartimage> {
    let mut scanner = Scanner::new(reader);

    // Volume header: magic, tool version, volume number, image identifier.
    let volume = scanner.take_exact(VOLUME_HEADER_SIZE)?;
    if &volume[..MAGIC.len()] != MAGIC || volume[MAGIC.len()..32].iter().any(|&b| b != 0) {
        return Err(ImageError::UnknownFormat(volume[..MAGIC.len()].to_vec()));
    }
    let _tool_version = nul_terminated(&volume[32..96]);
    let volume_no = LittleEndian::read_u32(&volume[96..100]);
    let _identifier = LittleEndian::read_u64(&volume[100..108]);
    if volume_no != 0 {
        return Err(ImageError::CorruptHeader(format!(
            "volume {volume_no} is not the first volume of the image"
        )));
    }

    // Main header follows immediately, no segment marker.
    let main = scanner.take_exact(HEADER_BLOCK_SIZE)?;
    check_block_sum("main", &main)?;
    let filesystem = nul_terminated(&main[..512]);
    // strings: fs 512, description 4096, device 512, firstpath 4095, then
    // five 65-byte uname fields; the numeric tail starts at 9540.
    let _compression = LittleEndian::read_u32(&main[9540..9544]);
    let encrypt_algo = LittleEndian::read_u32(&main[9800..9804]);
    if encrypt_algo != 0 {
        return Err(ImageError::UnsupportedVersion {
            format: "partimage",
            version: format!("encryption algorithm {encrypt_algo}"),
        });
    }

    let mut local: Option<LocalHeader> = None;
    let mut bitmap_raw: Option<Vec<u8>> = None;

    let blocks_section = loop {
        match find_subslice(&scanner.buffer, MAGIC_BEGIN) {
            Some(found) => {
                let idx = if scanner.buffer.len() - found < TOKEN_SPAN {
                    // Token may be cut off; align it to the front and refill.
                    scanner.dispose(found);
                    if scanner.read_more(READ_SIZE)? == 0
                        && scanner.buffer.len() <= MAGIC_BEGIN.len()
                    {
                        return Err(ImageError::CorruptHeader(
                            "end of file while reading headers".to_string(),
                        ));
                    }
                    0
                } else {
                    found
                };
                // Known segment payloads follow their token immediately and
                // may begin with token-alphabet bytes, so match known names
                // exactly and consume only the token itself.
                let rest = &scanner.buffer[idx..];
                if rest.starts_with(SEG_LOCALHEADER) {
                    scanner.dispose(idx + SEG_LOCALHEADER.len());
                    let block = scanner.take_exact(HEADER_BLOCK_SIZE)?;
                    check_block_sum("local", &block)?;
                    local = Some(parse_local(&block));
                } else if rest.starts_with(SEG_BITMAP) {
                    scanner.dispose(idx + SEG_BITMAP.len());
                    let local = local.as_ref().ok_or_else(|| {
                        ImageError::CorruptHeader(
                            "bitmap segment before local header".to_string(),
                        )
                    })?;
                    bitmap_raw = Some(scanner.take_exact(local.bitmap_size as usize)?);
                } else if rest.starts_with(SEG_DATABLOCKS) {
                    scanner.dispose(idx + SEG_DATABLOCKS.len());
                    break scanner.address;
                } else if rest.starts_with(SEG_INFO) {
                    // Filesystem-specific geometry; checked but unused.
                    scanner.dispose(idx + SEG_INFO.len());
                    let block = scanner.take_exact(HEADER_BLOCK_SIZE)?;
                    check_block_sum("info", &block)?;
                } else {
                    // Unknown segment (e.g. an MBR dump): skip its token,
                    // the scan walks over its content.
                    let mut end = idx + MAGIC_BEGIN.len();
                    while end < scanner.buffer.len() && is_token_char(scanner.buffer[end]) {
                        end += 1;
                    }
                    scanner.dispose(end);
                }
            }
            None => {
                // Keep a tail in case a token is torn across reads.
                let keep = MAGIC_BEGIN.len() - 1;
                if scanner.buffer.len() > keep {
                    let drop = scanner.buffer.len() - keep;
                    scanner.dispose(drop);
                }
                if scanner.read_more(READ_SIZE)? == 0 {
                    return Err(ImageError::CorruptHeader(
                        "end of file while reading headers".to_string(),
                    ));
                }
            }
        }
    };

    let local = local.ok_or_else(|| {
        ImageError::CorruptHeader("data blocks before local header".to_string())
    })?;
    let bitmap_raw = bitmap_raw.ok_or_else(|| {
        ImageError::CorruptHeader("data blocks before bitmap".to_string())
    })?;

    if local.block_size == 0 || local.block_size > u32::MAX as u64 {
        return Err(ImageError::CorruptHeader(format!(
            "implausible block size {}",
            local.block_size
        )));
    }
    let block_size = local.block_size as u32;
    if local.used_blocks > local.block_count {
        return Err(ImageError::CorruptHeader(format!(
            "{} used blocks exceed block count {}",
            local.used_blocks, local.block_count
        )));
    }

    let bitmap = Bitmap::from_bit_bytes(bitmap_raw, local.block_count)?;
    let used_blocks = bitmap.count_ones();
    if used_blocks != local.used_blocks {
        warn!(
            "header reports {} used blocks, bitmap holds {used_blocks}",
            local.used_blocks
        );
    }

    let blocks_per_sum = CHECK_FREQUENCY / block_size;
    let checksum = if blocks_per_sum > 0 {
        ChecksumSpec {
            kind: ChecksumKind::ChkTag,
            size: CHECK_SIZE,
            blocks_per_sum,
            reseed: true,
        }
    } else {
        warn!("block size {block_size} exceeds the check interval, checks disabled");
        ChecksumSpec::NONE
    };

    if !local.label.is_empty() {
        log::debug!("volume label {:?}", local.label);
    }

    let header = ImageHeader {
        format: ImageFormat::Partimage,
        fs_label: filesystem.to_uppercase(),
        block_size,
        total_blocks: local.block_count,
        used_blocks,
        blocks_section_offset: blocks_section,
        checksum,
    };

    Ok(ParsedPartimage { header, bitmap })
}

fn parse_local(block: &[u8]) -> LocalHeader {
    LocalHeader {
        block_size: LittleEndian::read_u64(&block[0..8]),
        used_blocks: LittleEndian::read_u64(&block[8..16]),
        block_count: LittleEndian::read_u64(&block[16..24]),
        bitmap_size: LittleEndian::read_u64(&block[24..32]),
        // bad-block count at 32..40 is unused here
        label: nul_terminated(&block[40..104]),
    }
}

/// Verify a header block's trailing signed-byte-sum checksum.
fn check_block_sum(kind: &str, block: &[u8]) -> Result<()> {
    let stored = LittleEndian::read_i32(&block[HEADER_PAYLOAD_SIZE..HEADER_BLOCK_SIZE]);
    let computed = signed_byte_sum(&block[..HEADER_PAYLOAD_SIZE]);
    if stored != computed {
        return Err(ImageError::CorruptHeader(format!(
            "{kind} header checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }
    Ok(())
}

fn is_token_char(b: u8) -> bool {
    b.is_ascii_digit() || b.is_ascii_uppercase()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Buffered scanner that tracks the absolute image offset of its window.
struct Scanner<'a, R: Read> {
    reader: &'a mut R,
    buffer: Vec<u8>,
    /// Image offset of `buffer[0]`.
    address: u64,
}

impl<'a, R: Read> Scanner<'a, R> {
    fn new(reader: &'a mut R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            address: 0,
        }
    }

    /// Append up to `n` bytes from the reader; returns how many arrived.
    fn read_more(&mut self, n: usize) -> Result<usize> {
        let old = self.buffer.len();
        self.buffer.resize(old + n, 0);
        let mut filled = 0;
        while filled < n {
            let got = self.reader.read(&mut self.buffer[old + filled..])?;
            if got == 0 {
                break;
            }
            filled += got;
        }
        self.buffer.truncate(old + filled);
        Ok(filled)
    }

    /// Consume and return exactly `n` bytes.
    fn take_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        while self.buffer.len() < n {
            let need = n - self.buffer.len();
            if self.read_more(need.max(READ_SIZE))? == 0 {
                return Err(ImageError::CorruptHeader(format!(
                    "end of file at offset {} while reading headers",
                    self.address + self.buffer.len() as u64
                )));
            }
        }
        let out = self.buffer[..n].to_vec();
        self.dispose(n);
        Ok(out)
    }

    /// Drop `n` leading bytes, advancing the absolute address.
    fn dispose(&mut self, n: usize) {
        self.buffer.drain(..n);
        self.address += n as u64;
    }
}
