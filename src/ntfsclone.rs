//! Ntfsclone image parser and run index.
//!
//! The 50-byte header carries cluster geometry; everything after
//! `offset_to_image_data` is a command stream: `0x00` plus a little-endian
//! count of consecutive unused clusters, or `0x01` plus one cluster of data.
//! There is no bitmap, so random access needs one sequential scan that turns
//! the command stream into a table of gap/data runs.

use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use log::{debug, warn};

use crate::error::{ImageError, Result};
use crate::image::{ChecksumSpec, ImageFormat, ImageHeader};
use crate::progress::{Progress, Throttled};

pub(crate) const MAGIC: &[u8; 16] = b"\0ntfsclone-image";

const HEADER_SIZE: usize = 50;
const VER_MAJOR: u8 = 10;
const VER_MINOR: u8 = 1;

const CMD_GAP: u8 = 0x00;
const CMD_DATA: u8 = 0x01;

/// Parse the header, leaving `reader` positioned at the command stream.
pub(crate) fn parse(reader: &mut impl Read) -> Result<ImageHeader> {
    let mut raw = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw)?;

    if &raw[..MAGIC.len()] != MAGIC {
        return Err(ImageError::UnknownFormat(raw[..MAGIC.len()].to_vec()));
    }

    let major = raw[16];
    let minor = raw[17];
    let cluster_size = LittleEndian::read_u32(&raw[18..22]);
    let _device_size = LittleEndian::read_u64(&raw[22..30]);
    let nr_clusters = LittleEndian::read_u64(&raw[30..38]);
    let inuse = LittleEndian::read_u64(&raw[38..46]);
    let offset_to_image_data = LittleEndian::read_u32(&raw[46..50]);

    if major != VER_MAJOR {
        return Err(ImageError::UnsupportedVersion {
            format: "ntfsclone",
            version: format!("{major}.{minor}"),
        });
    }
    if minor != VER_MINOR {
        warn!("ntfsclone minor version {minor} unknown, parsing as {VER_MAJOR}.{VER_MINOR}");
    }
    if cluster_size == 0 {
        return Err(ImageError::CorruptHeader("cluster size is zero".to_string()));
    }
    if (offset_to_image_data as usize) < HEADER_SIZE {
        return Err(ImageError::CorruptHeader(format!(
            "image data offset {offset_to_image_data} overlaps the header"
        )));
    }

    // Skip the padding between the fixed header and the command stream.
    let padding = offset_to_image_data as u64 - HEADER_SIZE as u64;
    let skipped = io::copy(&mut reader.take(padding), &mut io::sink())?;
    if skipped != padding {
        return Err(ImageError::CorruptHeader(format!(
            "end of file inside header padding ({skipped} of {padding} bytes)"
        )));
    }

    Ok(ImageHeader {
        format: ImageFormat::Ntfsclone,
        fs_label: "NTFS".to_string(),
        block_size: cluster_size,
        total_blocks: nr_clusters,
        used_blocks: inuse,
        blocks_section_offset: offset_to_image_data as u64,
        checksum: ChecksumSpec::NONE,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Data,
    Gap,
}

/// A maximal span of consecutive clusters sharing one kind.
#[derive(Debug, Clone)]
pub struct Run {
    pub start_block: u64,
    pub blocks: u64,
    pub kind: RunKind,
    /// Image offset of the first cluster's data; unused for gaps.
    pub image_offset: u64,
}

impl Run {
    fn end(&self) -> u64 {
        self.start_block + self.blocks
    }
}

/// Offset-ordered run table over the whole partition.
pub struct RunIndex {
    block_size: u64,
    runs: Vec<Run>,
    used_blocks: u64,
}

impl RunIndex {
    /// Scan the command stream into a run table. `reader` must be positioned
    /// at the blocks section; the whole stream is consumed.
    pub(crate) fn build(
        reader: &mut impl Read,
        header: &ImageHeader,
        progress: &mut dyn Progress,
    ) -> Result<RunIndex> {
        let block_size = header.block_size as u64;
        let mut runs: Vec<Run> = Vec::new();
        let mut image_off = header.blocks_section_offset;
        let mut block: u64 = 0;
        let mut used: u64 = 0;
        let mut data_buf = vec![0u8; header.block_size as usize];
        let mut progress = Throttled::new(progress, header.used_blocks);

        loop {
            let mut cmd = [0u8; 1];
            if reader.read(&mut cmd)? == 0 {
                break;
            }
            image_off += 1;
            match cmd[0] {
                CMD_GAP => {
                    let count = reader
                        .read_u64::<LittleEndian>()
                        .map_err(|e| stream_eof(e, image_off))?;
                    image_off += 8;
                    push_run(&mut runs, block, count, RunKind::Gap, 0);
                    block = block.saturating_add(count);
                }
                CMD_DATA => {
                    if block >= header.total_blocks {
                        return Err(ImageError::CorruptStream(format!(
                            "data cluster {block} beyond cluster count {}",
                            header.total_blocks
                        )));
                    }
                    reader
                        .read_exact(&mut data_buf)
                        .map_err(|e| stream_eof(e, image_off))?;
                    push_run(&mut runs, block, 1, RunKind::Data, image_off);
                    image_off += block_size;
                    block += 1;
                    used += 1;
                    progress.advance(1);
                }
                other => {
                    return Err(ImageError::CorruptStream(format!(
                        "unknown command byte {other:#04x} at image offset {}",
                        image_off - 1
                    )))
                }
            }
        }
        progress.finish();

        // Clamp a gap overrun and pad a short stream so the table always
        // covers exactly the partition.
        if block > header.total_blocks {
            warn!(
                "run table overruns partition by {} clusters, clamping",
                block - header.total_blocks
            );
            if let Some(last) = runs.last_mut() {
                last.blocks -= block - header.total_blocks;
                if last.blocks == 0 {
                    runs.pop();
                }
            }
        } else if block < header.total_blocks {
            push_run(
                &mut runs,
                block,
                header.total_blocks - block,
                RunKind::Gap,
                0,
            );
        }

        if used != header.used_blocks {
            debug!(
                "header reports {} clusters in use, stream holds {used}",
                header.used_blocks
            );
        }

        Ok(RunIndex {
            block_size,
            runs,
            used_blocks: used,
        })
    }

    /// Used clusters actually present in the stream.
    pub fn used_blocks(&self) -> u64 {
        self.used_blocks
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    /// Clusters covered by the table; equals the partition's cluster count.
    pub fn coverage(&self) -> u64 {
        self.runs.last().map_or(0, |r| r.end())
    }

    /// Image offset of a cluster's data, or `None` inside a gap.
    ///
    /// Within a data run, consecutive clusters sit `block_size + 1` apart:
    /// every cluster in the image carries its own command byte.
    pub fn resolve(&self, block: u64) -> Option<u64> {
        let idx = self.runs.partition_point(|r| r.start_block <= block);
        if idx == 0 {
            return None;
        }
        let run = &self.runs[idx - 1];
        if block >= run.end() || run.kind == RunKind::Gap {
            return None;
        }
        Some(run.image_offset + (block - run.start_block) * (self.block_size + 1))
    }
}

fn stream_eof(e: io::Error, image_off: u64) -> ImageError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ImageError::CorruptStream(format!("command stream truncated near offset {image_off}"))
    } else {
        ImageError::Io(e)
    }
}

fn push_run(runs: &mut Vec<Run>, start_block: u64, blocks: u64, kind: RunKind, image_offset: u64) {
    if blocks == 0 {
        return;
    }
    if let Some(last) = runs.last_mut() {
        if last.kind == kind && last.end() == start_block {
            last.blocks += blocks;
            return;
        }
    }
    runs.push(Run {
        start_block,
        blocks,
        kind,
        image_offset,
    });
}
