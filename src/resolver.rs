//! Logical block to image offset resolution.

use crate::bitmap::{Bitmap, PopcountIndex};
use crate::image::{ChecksumSpec, ImageHeader};
use crate::ntfsclone::RunIndex;

/// Index structure backing random access, per format family.
pub(crate) enum ImageIndex {
    /// Bitmap formats: presence bits plus the windowed popcount index.
    Bitmap {
        bitmap: Bitmap,
        index: PopcountIndex,
    },
    /// Run formats: the scanned gap/data run table.
    Runs(RunIndex),
}

/// Maps a logical block index to the image byte offset of its data, or
/// `None` for blocks the image does not store.
pub struct BlockResolver {
    block_size: u64,
    blocks_section_offset: u64,
    checksum: ChecksumSpec,
    index: ImageIndex,
}

impl BlockResolver {
    pub(crate) fn new(header: &ImageHeader, index: ImageIndex) -> Self {
        Self {
            block_size: header.block_size as u64,
            blocks_section_offset: header.blocks_section_offset,
            checksum: header.checksum,
            index,
        }
    }

    /// Image byte offset of `block`'s data, `None` when the block is absent.
    pub fn resolve(&self, block: u64) -> Option<u64> {
        match &self.index {
            ImageIndex::Bitmap { bitmap, index } => {
                let nth = index.rank(bitmap, block)?;
                let mut offset = self.blocks_section_offset + nth * self.block_size;
                if self.checksum.per_batch() {
                    // A checksum trailer sits after every `blocks_per_sum`
                    // stored blocks, so skip one trailer per completed batch.
                    offset +=
                        (nth / self.checksum.blocks_per_sum as u64) * self.checksum.size as u64;
                }
                Some(offset)
            }
            ImageIndex::Runs(runs) => runs.resolve(block),
        }
    }
}
