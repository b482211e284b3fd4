//! Random-access reads over the virtual partition.
//!
//! `BlockIo` serves arbitrary `(offset, size)` reads by lowering them to
//! whole-block fetches: cache hit, zero synthesis for absent blocks, or a
//! single seek-and-read against the image for present ones. The seekable
//! image handle and the block cache form one shared resource behind a mutex,
//! so `read_at` may be called concurrently from a FUSE dispatch pool.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Mutex;

use crate::error::{ImageError, Result};
use crate::image::ImageHeader;
use crate::input::SeekableSource;
use crate::resolver::BlockResolver;

/// Default cache capacity in blocks.
pub const DEFAULT_CACHE_BLOCKS: usize = 128;

/// Fixed-capacity LRU of decoded blocks keyed by logical block index.
struct BlockCache {
    capacity: usize,
    clock: u64,
    entries: HashMap<u64, (u64, Vec<u8>)>,
}

impl BlockCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            clock: 0,
            entries: HashMap::with_capacity(capacity),
        }
    }

    fn get(&mut self, block: u64) -> Option<&[u8]> {
        self.clock += 1;
        let clock = self.clock;
        let (stamp, data) = self.entries.get_mut(&block)?;
        *stamp = clock;
        Some(data)
    }

    fn insert(&mut self, block: u64, data: Vec<u8>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&block) {
            if let Some((&oldest, _)) = self.entries.iter().min_by_key(|(_, (stamp, _))| *stamp) {
                self.entries.remove(&oldest);
            }
        }
        self.clock += 1;
        self.entries.insert(block, (self.clock, data));
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

struct IoState {
    /// `None` once the handle is closed; reads then fail with `Closed`.
    source: Option<SeekableSource>,
    cache: BlockCache,
}

/// Read-only view of the logical partition backed by a backup image.
pub struct BlockIo {
    header: ImageHeader,
    resolver: BlockResolver,
    state: Mutex<IoState>,
}

impl BlockIo {
    pub(crate) fn new(
        header: ImageHeader,
        resolver: BlockResolver,
        source: SeekableSource,
        cache_blocks: usize,
    ) -> Self {
        Self {
            header,
            resolver,
            state: Mutex::new(IoState {
                source: Some(source),
                cache: BlockCache::new(cache_blocks),
            }),
        }
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// Size of the virtual partition in bytes.
    pub fn partition_size(&self) -> u64 {
        self.header.partition_size()
    }

    /// Read `size` bytes at `offset` in the logical partition.
    ///
    /// Absent blocks read as zeros. Ranges that leave the partition fail
    /// with `OutOfRange`; a zero-length read of a valid offset succeeds.
    pub fn read_at(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let partition_size = self.header.partition_size();
        let end = offset
            .checked_add(size as u64)
            .filter(|&end| end <= partition_size)
            .ok_or(ImageError::OutOfRange {
                offset,
                size: size as u64,
                partition_size,
            })?;
        if size == 0 {
            return Ok(Vec::new());
        }

        let block_size = self.header.block_size as u64;
        let first = offset / block_size;
        let last = (end - 1) / block_size;

        let mut state = self
            .state
            .lock()
            .map_err(|_| ImageError::Io(io::Error::other("block cache lock poisoned")))?;

        let mut out = Vec::with_capacity(size);
        for block in first..=last {
            let data = state.fetch(&self.resolver, block, block_size as usize)?;
            let from = if block == first {
                (offset % block_size) as usize
            } else {
                0
            };
            let to = if block == last {
                ((end - 1) % block_size) as usize + 1
            } else {
                block_size as usize
            };
            out.extend_from_slice(&data[from..to]);
        }
        Ok(out)
    }

    /// Release the image handle. Subsequent reads fail with `Closed`.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.source = None;
            state.cache.clear();
        }
    }
}

impl IoState {
    fn fetch(
        &mut self,
        resolver: &BlockResolver,
        block: u64,
        block_size: usize,
    ) -> Result<Vec<u8>> {
        if let Some(data) = self.cache.get(block) {
            return Ok(data.to_vec());
        }
        let source = self.source.as_mut().ok_or(ImageError::Closed)?;
        let data = match resolver.resolve(block) {
            None => vec![0u8; block_size],
            Some(image_offset) => {
                source.seek(SeekFrom::Start(image_offset))?;
                let mut buf = vec![0u8; block_size];
                source.read_exact(&mut buf).map_err(|e| {
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        ImageError::CorruptStream(format!(
                            "image ends inside block {block} at offset {image_offset}"
                        ))
                    } else {
                        ImageError::Io(e)
                    }
                })?;
                buf
            }
        };
        self.cache.insert(block, data.clone());
        Ok(data)
    }
}
