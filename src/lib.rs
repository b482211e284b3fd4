//! Read-only virtual partitions from partition-backup images.
//!
//! Partclone, partimage and ntfsclone images store only the used blocks of a
//! partition, so they cannot be loop-mounted or checked directly. This crate
//! resolves any byte offset of the original partition to its place in the
//! compact image — or to synthesised zeros for unused blocks — in O(1)
//! expected time: a windowed popcount index over the bitmap formats, a run
//! table over ntfsclone's command stream, and an LRU block cache over a
//! seekable source.
//!
//! ```no_run
//! use rusty_mount::{open_image, NoProgress, OpenOptions};
//!
//! let image = open_image(
//!     std::path::Path::new("sda1.partclone.img"),
//!     &OpenOptions::default(),
//!     &mut NoProgress,
//! )?;
//! let (header, io) = image.into_block_io()?;
//! let boot_sector = io.read_at(0, 512)?;
//! assert_eq!(boot_sector.len(), 512.min(header.partition_size() as usize));
//! # Ok::<(), rusty_mount::ImageError>(())
//! ```
//!
//! Split files (`.aa`, `.ab`, ...) are concatenated transparently, and
//! gzip/bzip2/xz/lzma/zstd/lz4 images can be parsed and verified in
//! streaming mode; only random access requires uncompressed input.

pub mod bitmap;
pub mod blockio;
pub mod checksum;
pub mod error;
pub mod image;
pub mod input;
pub mod progress;

mod ntfsclone;
mod partclone;
mod partimage;
mod resolver;
mod verify;

pub use blockio::{BlockIo, DEFAULT_CACHE_BLOCKS};
pub use error::{ImageError, Result};
pub use image::{
    format_size, open_image, read_header, ChecksumKind, ChecksumSpec, Image, ImageFormat,
    ImageHeader, OpenOptions,
};
pub use progress::{NoProgress, Progress};
