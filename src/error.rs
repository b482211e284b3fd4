use thiserror::Error;

/// Errors surfaced by the image-reading core.
///
/// Header-time errors are fatal: the caller gets them from `open_image` and
/// aborts before mounting anything. Read-time errors (`Io`, `Closed`,
/// `OutOfRange`) surface from `BlockIo::read_at` and map onto the adapter's
/// read-error status.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("not a recognised backup image (magic {0:02x?})")]
    UnknownFormat(Vec<u8>),

    #[error("{format} version {version} not supported")]
    UnsupportedVersion { format: &'static str, version: String },

    #[error("corrupt header: {0}")]
    CorruptHeader(String),

    #[error("corrupt bitmap: {0}")]
    CorruptBitmap(String),

    #[error("corrupt block stream: {0}")]
    CorruptStream(String),

    #[error("cannot seek in {0}-compressed input; uncompress the image first")]
    UnseekableCompressed(&'static str),

    #[error("read of {size} bytes at {offset} exceeds partition size {partition_size}")]
    OutOfRange {
        offset: u64,
        size: u64,
        partition_size: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image handle is closed")]
    Closed,

    #[error("checksum mismatch at used block {block}")]
    VerifyFailed { block: u64 },

    #[error("index window {0} must be a positive multiple of 8 bits")]
    InvalidIndexWindow(u32),
}

pub type Result<T> = std::result::Result<T, ImageError>;
