//! Image input layer: split-file concatenation and transparent decompression.
//!
//! Backup images arrive either as plain files, as split files (`img.aa`,
//! `img.ab`, ... produced by `split`), or wrapped in a stream compressor.
//! [`open_stream`] hides all of that behind a sequential reader; this is
//! enough for header parsing, index construction and verification.
//! [`open_seekable`] is the random-access variant used for mounting and
//! refuses compressed input: seeking through block-compressed formats means
//! re-decoding from the start on every backwards seek.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{ImageError, Result};

/// Stream compression recognised on the outside of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
    Lzma,
    Zstd,
    Lz4,
}

impl Compression {
    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
            Compression::Lzma => "lzma",
            Compression::Zstd => "zstd",
            Compression::Lz4 => "lz4",
        }
    }
}

/// Number of bytes sniffed from the head of the stream. Covers the longest
/// container magic (xz, 6 bytes) with room to spare.
const SNIFF_LEN: usize = 16;

/// Identify the container by its leading magic bytes, first match wins.
pub fn sniff_compression(head: &[u8]) -> Compression {
    if head.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
        Compression::Zstd
    } else if head.starts_with(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]) {
        Compression::Xz
    } else if head.starts_with(&[0x5D, 0x00, 0x00]) {
        Compression::Lzma
    } else if head.starts_with(&[0x42, 0x5A, 0x68]) {
        Compression::Bzip2
    } else if head.starts_with(&[0x1F, 0x8B]) {
        Compression::Gzip
    } else if head.starts_with(&[0x04, 0x22, 0x4D, 0x18]) {
        Compression::Lz4
    } else {
        Compression::None
    }
}

// ---------------------------------------------------------------------------
// Split files
// ---------------------------------------------------------------------------

/// Suffix index of "yz", the last two-letter suffix `split` emits.
const YZ: u64 = 649;
/// Suffix index of "zaaa", the first four-letter suffix.
const ZAAA: u64 = 439_400;

/// The n-th suffix in split(1) order: aa, ab, ..., yz, zaaa, zaab, ...
fn split_suffix(idx: u64) -> String {
    let a = b'a';
    if idx < ZAAA {
        let (i, j) = (idx / 26, idx % 26);
        String::from_utf8(vec![a + i as u8, a + j as u8]).unwrap()
    } else {
        let (k, l) = (idx / 26, idx % 26);
        let (j, k) = (k / 26, k % 26);
        let (i, j) = (j / 26, j % 26);
        String::from_utf8(vec![a + i as u8, a + j as u8, a + k as u8, a + l as u8]).unwrap()
    }
}

/// If `path` is the first file of a split set (`...aa` with an `...ab`
/// sibling), return all sibling paths in concatenation order.
fn split_segments(path: &Path) -> Option<Vec<PathBuf>> {
    let s = path.to_str()?;
    let base = s.strip_suffix("aa")?;
    if !Path::new(&format!("{base}ab")).exists() {
        return None;
    }
    let mut segments = vec![path.to_path_buf()];
    let mut idx: u64 = 0;
    loop {
        idx = if idx == YZ { ZAAA } else { idx + 1 };
        let candidate = PathBuf::from(format!("{base}{}", split_suffix(idx)));
        if !candidate.exists() {
            break;
        }
        segments.push(candidate);
    }
    Some(segments)
}

/// One member of a split set.
struct Segment {
    path: PathBuf,
    /// Offset of this file within the virtual concatenation.
    offset: u64,
    size: u64,
}

impl Segment {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Keep at most this many split-file handles open at a time.
const MAX_OPEN_SEGMENTS: usize = 16;

/// `Read + Seek` over the virtual concatenation of a split set.
///
/// Files are opened on demand; an LRU keeps the open-handle count bounded so
/// very large split sets do not exhaust file descriptors.
pub struct SplitSource {
    segments: Vec<Segment>,
    /// Open handle and its current file position, per segment.
    handles: Vec<Option<(File, u64)>>,
    /// Segment indices with open handles, most recently used last.
    recency: Vec<usize>,
    /// Current absolute position in the concatenation.
    pos: u64,
    /// Hint: segment containing `pos` (or the last one touched).
    cur: usize,
    total: u64,
}

impl SplitSource {
    fn open(paths: Vec<PathBuf>) -> io::Result<Self> {
        let mut segments = Vec::with_capacity(paths.len());
        let mut offset = 0u64;
        for path in paths {
            let size = std::fs::metadata(&path)?.len();
            if size == 0 {
                continue;
            }
            segments.push(Segment { path, offset, size });
            offset += size;
        }
        let handles = segments.iter().map(|_| None).collect();
        Ok(Self {
            segments,
            handles,
            recency: Vec::new(),
            pos: 0,
            cur: 0,
            total: offset,
        })
    }

    pub fn size(&self) -> u64 {
        self.total
    }

    /// Binary search for the segment containing `pos`, with the last-used
    /// segment as a fast path.
    fn segment_for(&self, pos: u64) -> usize {
        let cur = &self.segments[self.cur];
        if pos >= cur.offset && pos < cur.end() {
            return self.cur;
        }
        match self
            .segments
            .binary_search_by(|seg| {
                if pos < seg.offset {
                    std::cmp::Ordering::Greater
                } else if pos >= seg.end() {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            }) {
            Ok(idx) => idx,
            Err(idx) => idx.min(self.segments.len() - 1),
        }
    }

    fn touch(&mut self, idx: usize) {
        self.recency.retain(|&i| i != idx);
        self.recency.push(idx);
        while self.recency.len() > MAX_OPEN_SEGMENTS {
            let evicted = self.recency.remove(0);
            self.handles[evicted] = None;
        }
    }

    /// Read from segment `idx` at absolute position `pos`.
    fn read_segment(&mut self, idx: usize, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        let seg_off = pos - self.segments[idx].offset;
        let avail = (self.segments[idx].size - seg_off) as usize;
        if self.handles[idx].is_none() {
            let file = File::open(&self.segments[idx].path)?;
            self.handles[idx] = Some((file, 0));
        }
        self.touch(idx);
        let (file, file_pos) = self.handles[idx].as_mut().unwrap();
        if *file_pos != seg_off {
            file.seek(SeekFrom::Start(seg_off))?;
            *file_pos = seg_off;
        }
        let len = buf.len().min(avail);
        let n = file.read(&mut buf[..len])?;
        *file_pos += n as u64;
        Ok(n)
    }
}

impl Read for SplitSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.total {
            return Ok(0);
        }
        let idx = self.segment_for(self.pos);
        self.cur = idx;
        let n = self.read_segment(idx, self.pos, buf)?;
        self.pos += n as u64;
        if n == 0 && self.pos < self.total {
            // A segment shrank underneath us since it was sized.
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("split file {} truncated", self.segments[idx].path.display()),
            ));
        }
        Ok(n)
    }
}

impl Seek for SplitSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.total as i64 + offset,
            SeekFrom::Current(offset) => self.pos as i64 + offset,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to negative position",
            ));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Random-access byte source over an uncompressed image.
pub enum SeekableSource {
    Plain { file: File, size: u64 },
    Split(SplitSource),
}

impl SeekableSource {
    pub fn size(&self) -> u64 {
        match self {
            SeekableSource::Plain { size, .. } => *size,
            SeekableSource::Split(split) => split.size(),
        }
    }
}

impl Read for SeekableSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SeekableSource::Plain { file, .. } => file.read(buf),
            SeekableSource::Split(split) => split.read(buf),
        }
    }
}

impl Seek for SeekableSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            SeekableSource::Plain { file, .. } => file.seek(pos),
            SeekableSource::Split(split) => split.seek(pos),
        }
    }
}

/// Sequential byte source with the container layer already removed.
pub struct ImageStream {
    pub reader: Box<dyn Read + Send>,
    pub compression: Compression,
}

/// Open `path` for sequential reading: concatenate split siblings, sniff the
/// container magic, and stack the matching decoder.
pub fn open_stream(path: &Path) -> Result<ImageStream> {
    let mut base: Box<dyn Read + Send> = match split_segments(path) {
        Some(segments) => Box::new(SplitSource::open(segments)?),
        None => Box::new(File::open(path)?),
    };

    let mut head = [0u8; SNIFF_LEN];
    let got = read_up_to(&mut base, &mut head)?;
    let compression = sniff_compression(&head[..got]);

    // Reattach the sniffed bytes in front of the rest of the stream.
    let stream = Cursor::new(head[..got].to_vec()).chain(base);
    let reader: Box<dyn Read + Send> = match compression {
        Compression::None => Box::new(stream),
        Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(stream)),
        Compression::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(stream)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(stream)?),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(stream)),
        Compression::Lzma => {
            let lzma = xz2::stream::Stream::new_lzma_decoder(u64::MAX)
                .map_err(|e| io::Error::other(format!("lzma decoder: {e}")))?;
            Box::new(xz2::read::XzDecoder::new_stream(stream, lzma))
        }
        Compression::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(stream)),
    };

    Ok(ImageStream {
        reader,
        compression,
    })
}

/// Open `path` for random access. Fails with [`ImageError::UnseekableCompressed`]
/// when the image (or the concatenation of its split files) is compressed.
pub fn open_seekable(path: &Path) -> Result<SeekableSource> {
    let segments = split_segments(path);

    // Sniff the head of the (concatenated) stream before committing.
    let mut head = [0u8; SNIFF_LEN];
    let got = {
        let mut file = File::open(segments.as_ref().map_or(path, |s| s[0].as_path()))?;
        read_up_to(&mut file, &mut head)?
    };
    let compression = sniff_compression(&head[..got]);
    if compression != Compression::None {
        return Err(ImageError::UnseekableCompressed(compression.name()));
    }

    match segments {
        Some(segments) => Ok(SeekableSource::Split(SplitSource::open(segments)?)),
        None => {
            let file = File::open(path)?;
            let size = file.metadata()?.len();
            Ok(SeekableSource::Plain { file, size })
        }
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
pub(crate) fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
