//! Common image model and the open-image entry points.
//!
//! The three parsers share no state; an image is a tagged [`ImageFormat`]
//! plus the uniform [`ImageHeader`] geometry, and dispatch is a peek at the
//! leading magic bytes. [`open_image`] runs the whole open-time pipeline —
//! parse, optional verification, index construction — on a sequential
//! source, so compressed images can be inspected; only the switch to random
//! access in [`Image::into_block_io`] requires a seekable file.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::debug;

use crate::bitmap::{Bitmap, PopcountIndex, DEFAULT_INDEX_WINDOW};
use crate::blockio::{BlockIo, DEFAULT_CACHE_BLOCKS};
use crate::error::{ImageError, Result};
use crate::input;
use crate::ntfsclone::{self, RunIndex};
use crate::partclone;
use crate::partimage;
use crate::progress::Progress;
use crate::resolver::{BlockResolver, ImageIndex};
use crate::verify;

/// Tool that produced a backup image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Partclone,
    Partimage,
    Ntfsclone,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Partclone => "partclone",
            ImageFormat::Partimage => "partimage",
            ImageFormat::Ntfsclone => "ntfsclone",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checksum convention embedded in the blocks section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// No embedded checksums.
    None,
    /// Partclone: un-finalised CRC-32 trailer after each batch.
    Crc32,
    /// Partimage: 16-byte `CHK\0` record after each batch.
    ChkTag,
}

/// How the blocks section is checksummed.
#[derive(Debug, Clone, Copy)]
pub struct ChecksumSpec {
    pub kind: ChecksumKind,
    /// Trailer size in bytes.
    pub size: u32,
    /// Used blocks per trailer.
    pub blocks_per_sum: u32,
    /// Restart the running checksum after each trailer.
    pub reseed: bool,
}

impl ChecksumSpec {
    pub const NONE: ChecksumSpec = ChecksumSpec {
        kind: ChecksumKind::None,
        size: 0,
        blocks_per_sum: 0,
        reseed: false,
    };

    /// Do trailers interleave with block data?
    pub(crate) fn per_batch(&self) -> bool {
        self.kind != ChecksumKind::None && self.blocks_per_sum > 0 && self.size > 0
    }
}

/// Uniform geometry of a backup image, independent of its source format.
#[derive(Debug, Clone)]
pub struct ImageHeader {
    pub format: ImageFormat,
    /// File system name, informational (e.g. "NTFS", "BTRFS").
    pub fs_label: String,
    pub block_size: u32,
    /// Logical blocks in the partition, present or not.
    pub total_blocks: u64,
    /// Blocks whose data is stored in the image.
    pub used_blocks: u64,
    /// Image offset where block payload begins.
    pub blocks_section_offset: u64,
    pub checksum: ChecksumSpec,
}

impl ImageHeader {
    /// Size of the virtual partition in bytes.
    pub fn partition_size(&self) -> u64 {
        self.total_blocks * self.block_size as u64
    }

    /// Bytes of actual payload stored in the image.
    pub fn used_size(&self) -> u64 {
        self.used_blocks * self.block_size as u64
    }
}

impl fmt::Display for ImageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "format            {}", self.format)?;
        writeln!(f, "fs type           {}", self.fs_label)?;
        writeln!(f, "block size        {}", self.block_size)?;
        writeln!(
            f,
            "total blocks      {} ({})",
            self.total_blocks,
            format_size(self.partition_size())
        )?;
        writeln!(
            f,
            "used blocks       {} ({})",
            self.used_blocks,
            format_size(self.used_size())
        )?;
        writeln!(f, "blocks section    at {}", self.blocks_section_offset)?;
        match self.checksum.kind {
            ChecksumKind::None => write!(f, "checksums         none"),
            ChecksumKind::Crc32 => write!(
                f,
                "checksums         crc32, {} bytes per {} block(s){}",
                self.checksum.size,
                self.checksum.blocks_per_sum,
                if self.checksum.reseed { ", reseeded" } else { "" }
            ),
            ChecksumKind::ChkTag => write!(
                f,
                "checksums         CHK records, {} bytes per {} block(s)",
                self.checksum.size, self.checksum.blocks_per_sum
            ),
        }
    }
}

/// Render a byte count with a binary unit, one decimal.
pub fn format_size(size: u64) -> String {
    const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];
    let mut unit = 0;
    let mut value = size as f64;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{size} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Decode a NUL-terminated fixed-width string field.
pub(crate) fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Knobs for [`open_image`].
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Popcount index window in bits; positive multiple of 8. Larger windows
    /// shrink the index and lengthen per-query bit counting.
    pub index_window: u32,
    /// Run the checksum verification pass while the image is parsed.
    pub verify_checksums: bool,
    /// Block cache capacity for the returned `BlockIo`; 0 disables caching.
    pub cache_blocks: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            index_window: DEFAULT_INDEX_WINDOW,
            verify_checksums: false,
            cache_blocks: DEFAULT_CACHE_BLOCKS,
        }
    }
}

/// A parsed and indexed image, ready to inspect or to turn into a
/// [`BlockIo`] for random access.
pub struct Image {
    header: ImageHeader,
    index: ImageIndex,
    cache_blocks: usize,
    path: PathBuf,
    verify_failure: Option<u64>,
}

impl Image {
    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// Used-block index of the first checksum failure, when verification was
    /// requested and failed. Advisory: the caller decides whether to proceed.
    pub fn verify_failure(&self) -> Option<u64> {
        self.verify_failure
    }

    /// Reopen the image for random access and build the block reader.
    ///
    /// Compressed input fails here with `UnseekableCompressed`; header
    /// inspection of such images still works through [`open_image`].
    pub fn into_block_io(self) -> Result<(ImageHeader, BlockIo)> {
        let source = input::open_seekable(&self.path)?;
        let resolver = BlockResolver::new(&self.header, self.index);
        let header = self.header.clone();
        Ok((
            header.clone(),
            BlockIo::new(header, resolver, source, self.cache_blocks),
        ))
    }
}

/// Bytes peeked for format dispatch.
const PEEK_LEN: usize = 64;

/// Open an image: detect its format, parse header and bitmap, optionally
/// verify checksums, and build the random-access index.
pub fn open_image(
    path: &Path,
    options: &OpenOptions,
    progress: &mut dyn Progress,
) -> Result<Image> {
    if options.index_window == 0 || options.index_window % 8 != 0 {
        return Err(ImageError::InvalidIndexWindow(options.index_window));
    }

    let stream = input::open_stream(path)?;
    let mut rest = stream.reader;
    let mut head = [0u8; PEEK_LEN];
    let got = input::read_up_to(&mut rest, &mut head)?;
    let head = &head[..got];
    let mut reader = std::io::Cursor::new(head.to_vec()).chain(rest);

    if head.starts_with(partclone::MAGIC) {
        let parsed = partclone::parse(&mut reader)?;
        let verify_failure =
            run_verification(options, &mut reader, &parsed.header, &parsed.bitmap, progress)?;
        let index = PopcountIndex::build(&parsed.bitmap, options.index_window)?;
        debug!(
            "{}: partclone {} image, {}/{} blocks used",
            path.display(),
            parsed.header.fs_label,
            parsed.header.used_blocks,
            parsed.header.total_blocks
        );
        Ok(Image {
            header: parsed.header,
            index: ImageIndex::Bitmap {
                bitmap: parsed.bitmap,
                index,
            },
            cache_blocks: options.cache_blocks,
            path: path.to_path_buf(),
            verify_failure,
        })
    } else if head.starts_with(partimage::MAGIC) {
        let parsed = partimage::parse(&mut reader)?;
        let verify_failure =
            run_verification(options, &mut reader, &parsed.header, &parsed.bitmap, progress)?;
        let index = PopcountIndex::build(&parsed.bitmap, options.index_window)?;
        debug!(
            "{}: partimage {} image, {}/{} blocks used",
            path.display(),
            parsed.header.fs_label,
            parsed.header.used_blocks,
            parsed.header.total_blocks
        );
        Ok(Image {
            header: parsed.header,
            index: ImageIndex::Bitmap {
                bitmap: parsed.bitmap,
                index,
            },
            cache_blocks: options.cache_blocks,
            path: path.to_path_buf(),
            verify_failure,
        })
    } else if head.starts_with(ntfsclone::MAGIC) {
        let mut header = ntfsclone::parse(&mut reader)?;
        let runs = RunIndex::build(&mut reader, &header, progress)?;
        // The header's in-use count is advisory; the stream decides.
        header.used_blocks = runs.used_blocks();
        debug!(
            "{}: ntfsclone image, {}/{} clusters used across {} runs",
            path.display(),
            header.used_blocks,
            header.total_blocks,
            runs.runs().len()
        );
        Ok(Image {
            header,
            index: ImageIndex::Runs(runs),
            cache_blocks: options.cache_blocks,
            path: path.to_path_buf(),
            verify_failure: None,
        })
    } else {
        Err(ImageError::UnknownFormat(
            head[..head.len().min(16)].to_vec(),
        ))
    }
}

/// Read only the header of an image, skipping index construction. Quick
/// metadata extraction for `info`-style callers.
pub fn read_header(path: &Path) -> Result<ImageHeader> {
    let stream = input::open_stream(path)?;
    let mut rest = stream.reader;
    let mut head = [0u8; PEEK_LEN];
    let got = input::read_up_to(&mut rest, &mut head)?;
    let head = &head[..got];
    let mut reader = std::io::Cursor::new(head.to_vec()).chain(rest);

    if head.starts_with(partclone::MAGIC) {
        Ok(partclone::parse(&mut reader)?.header)
    } else if head.starts_with(partimage::MAGIC) {
        Ok(partimage::parse(&mut reader)?.header)
    } else if head.starts_with(ntfsclone::MAGIC) {
        ntfsclone::parse(&mut reader)
    } else {
        Err(ImageError::UnknownFormat(
            head[..head.len().min(16)].to_vec(),
        ))
    }
}

fn run_verification(
    options: &OpenOptions,
    reader: &mut impl Read,
    header: &ImageHeader,
    bitmap: &Bitmap,
    progress: &mut dyn Progress,
) -> Result<Option<u64>> {
    if !options.verify_checksums {
        return Ok(None);
    }
    match verify::verify_blocks(reader, header, bitmap, progress) {
        Ok(()) => Ok(None),
        Err(ImageError::VerifyFailed { block }) => Ok(Some(block)),
        Err(e) => Err(e),
    }
}
