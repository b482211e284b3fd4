//! Sequential checksum verification of the blocks section.
//!
//! This is a long-running pass over the whole image, invoked only on
//! request. It reads every used block in bitmap order, accumulates the
//! format's checksum and compares it against each embedded trailer. It must
//! run on its own sequential source and never interleave with `read_at`.

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};

use crate::bitmap::Bitmap;
use crate::checksum::{crc32_running, crc32_update, CRC32_SEED};
use crate::error::{ImageError, Result};
use crate::image::{ChecksumKind, ImageFormat, ImageHeader};
use crate::partimage::CHECK_MAGIC;
use crate::progress::{Progress, Throttled};

/// Verify all used blocks. `reader` must be positioned at the blocks
/// section. On a checksum mismatch the error carries the zero-based index
/// of the failed batch's first block within the used-block sequence.
pub(crate) fn verify_blocks(
    reader: &mut impl Read,
    header: &ImageHeader,
    bitmap: &Bitmap,
    progress: &mut dyn Progress,
) -> Result<()> {
    let spec = header.checksum;
    let batch = spec.blocks_per_sum as u64;
    let mut block_buf = vec![0u8; header.block_size as usize];
    let mut trailer = vec![0u8; spec.size as usize];
    let mut crc: u32 = match spec.kind {
        ChecksumKind::Crc32 => CRC32_SEED,
        _ => 0,
    };
    let mut count: u64 = 0;
    let mut progress = Throttled::new(progress, header.used_blocks);

    for _block in bitmap.iter_used() {
        read_block(reader, &mut block_buf, count)?;
        count += 1;
        progress.advance(1);

        match spec.kind {
            ChecksumKind::None => {}
            ChecksumKind::Crc32 => {
                crc = crc32_running(crc, &block_buf);
                if batch > 0 && count % batch == 0 {
                    read_trailer(reader, &mut trailer, count)?;
                    let stored = LittleEndian::read_u32(&trailer[..4]);
                    if stored != crc {
                        return Err(ImageError::VerifyFailed {
                            block: count - batch,
                        });
                    }
                    if spec.reseed {
                        crc = CRC32_SEED;
                    }
                }
            }
            ChecksumKind::ChkTag => {
                crc = crc32_update(crc, &block_buf);
                if batch > 0 && count % batch == 0 {
                    read_trailer(reader, &mut trailer, count)?;
                    if &trailer[..4] != CHECK_MAGIC {
                        return Err(ImageError::CorruptStream(format!(
                            "expected CHK record after used block {}",
                            count - 1
                        )));
                    }
                    let stored = LittleEndian::read_u32(&trailer[4..8]);
                    if stored != crc {
                        return Err(ImageError::VerifyFailed {
                            block: count - batch,
                        });
                    }
                    crc = 0;
                }
            }
        }
    }

    // A final partial batch still carries a trailing checksum.
    if spec.kind == ChecksumKind::Crc32 && batch > 0 && count % batch != 0 {
        read_trailer(reader, &mut trailer, count)?;
        let stored = LittleEndian::read_u32(&trailer[..4]);
        if stored != crc {
            return Err(ImageError::VerifyFailed {
                block: count - count % batch,
            });
        }
    }

    // Partclone images end right after the last checksum; partimage appends
    // a tail section.
    if header.format == ImageFormat::Partclone {
        let extra = reader.take(block_buf.len() as u64).read(&mut block_buf)?;
        if extra != 0 {
            return Err(ImageError::CorruptStream(
                "unexpected data after end of backup".to_string(),
            ));
        }
    }

    progress.finish();
    Ok(())
}

fn read_block(reader: &mut impl Read, buf: &mut [u8], count: u64) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ImageError::CorruptStream(format!("end of file reading used block {count}"))
        } else {
            ImageError::Io(e)
        }
    })
}

fn read_trailer(reader: &mut impl Read, buf: &mut [u8], count: u64) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ImageError::CorruptStream(format!(
                "end of file reading checksum after used block {}",
                count - 1
            ))
        } else {
            ImageError::Io(e)
        }
    })
}
