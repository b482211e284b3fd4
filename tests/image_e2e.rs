//! End-to-end tests over synthetic partclone, partimage and ntfsclone
//! images built in-memory, written to temp files, and read back through the
//! public API.
//!
//! Run with: cargo test --test image_e2e

use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use tempfile::TempDir;

use rusty_mount::bitmap::{Bitmap, PopcountIndex};
use rusty_mount::checksum::{crc32_running, crc32_update, signed_byte_sum, CRC32_SEED};
use rusty_mount::{open_image, read_header, ImageError, ImageFormat, NoProgress, OpenOptions};

// ============================================================================
// Image builders
// ============================================================================

/// Build a partclone v0002 image. `blocks[i]` is the payload of the i-th
/// *used* block; `used` lists the present block indices in ascending order.
fn build_partclone(
    block_size: u32,
    total_blocks: u64,
    used: &[u64],
    blocks: &[&[u8]],
    checksum: Option<(u32, bool)>, // (blocks_per_checksum, reseed)
) -> Vec<u8> {
    assert_eq!(used.len(), blocks.len());
    let (checksum_mode, checksum_size, blocks_per_checksum, reseed) = match checksum {
        Some((bpc, reseed)) => (32u16, 4u16, bpc, reseed),
        None => (0, 0, 0, false),
    };

    let mut header = Vec::new();
    header.extend_from_slice(b"partclone-image\0");
    header.extend_from_slice(b"0.3.32\0\0\0\0\0\0\0\0");
    header.extend_from_slice(b"0002");
    header.write_u16::<LittleEndian>(0xC0DE).unwrap();
    let mut fs = [0u8; 16];
    fs[..5].copy_from_slice(b"BTRFS");
    header.extend_from_slice(&fs);
    header
        .write_u64::<LittleEndian>(total_blocks * block_size as u64)
        .unwrap();
    header.write_u64::<LittleEndian>(total_blocks).unwrap();
    header.write_u64::<LittleEndian>(used.len() as u64).unwrap();
    header.write_u64::<LittleEndian>(used.len() as u64).unwrap();
    header.write_u32::<LittleEndian>(block_size).unwrap();
    header.write_u32::<LittleEndian>(18).unwrap();
    header.write_u16::<LittleEndian>(2).unwrap();
    header.write_u16::<LittleEndian>(64).unwrap();
    header.write_u16::<LittleEndian>(checksum_mode).unwrap();
    header.write_u16::<LittleEndian>(checksum_size).unwrap();
    header.write_u32::<LittleEndian>(blocks_per_checksum).unwrap();
    header.write_u8(reseed as u8).unwrap();
    header.write_u8(1).unwrap(); // BIT bitmap mode
    let crc = crc32_running(CRC32_SEED, &header);
    header.write_u32::<LittleEndian>(crc).unwrap();

    let mut bitmap = vec![0u8; total_blocks.div_ceil(8) as usize];
    for &b in used {
        bitmap[(b / 8) as usize] |= 1 << (b % 8);
    }
    let bitmap_crc = crc32_running(CRC32_SEED, &bitmap);
    bitmap.write_u32::<LittleEndian>(bitmap_crc).unwrap();

    let mut payload = Vec::new();
    let mut seed = CRC32_SEED;
    let mut in_batch = 0u32;
    for (i, data) in blocks.iter().enumerate() {
        assert_eq!(data.len(), block_size as usize);
        payload.write_all(data).unwrap();
        if checksum_mode == 32 && blocks_per_checksum > 0 {
            seed = crc32_running(seed, data);
            in_batch += 1;
            if in_batch == blocks_per_checksum || i == blocks.len() - 1 {
                payload.write_u32::<LittleEndian>(seed).unwrap();
                in_batch = 0;
                if reseed {
                    seed = CRC32_SEED;
                }
            }
        }
    }

    let mut image = header;
    image.extend_from_slice(&bitmap);
    image.extend_from_slice(&payload);
    image
}

/// Build an ntfsclone image from per-cluster descriptions.
fn build_ntfsclone(cluster_size: u32, clusters: &[Option<Vec<u8>>]) -> Vec<u8> {
    let nr_clusters = clusters.len() as u64;
    let inuse = clusters.iter().filter(|c| c.is_some()).count() as u64;

    let mut image = Vec::new();
    image.extend_from_slice(b"\0ntfsclone-image");
    image.write_u8(10).unwrap();
    image.write_u8(1).unwrap();
    image.write_u32::<LittleEndian>(cluster_size).unwrap();
    image
        .write_u64::<LittleEndian>(nr_clusters * cluster_size as u64)
        .unwrap();
    image.write_u64::<LittleEndian>(nr_clusters).unwrap();
    image.write_u64::<LittleEndian>(inuse).unwrap();
    image.write_u32::<LittleEndian>(56).unwrap();
    image.extend_from_slice(&[0u8; 6]);

    let mut i = 0usize;
    while i < clusters.len() {
        match &clusters[i] {
            Some(data) => {
                image.write_u8(0x01).unwrap();
                image.write_all(data).unwrap();
                i += 1;
            }
            None => {
                let start = i;
                while i < clusters.len() && clusters[i].is_none() {
                    i += 1;
                }
                image.write_u8(0x00).unwrap();
                image.write_u64::<LittleEndian>((i - start) as u64).unwrap();
            }
        }
    }
    image
}

/// Build a single-volume partimage file with CHK records every 64 KiB.
fn build_partimage(block_size: u32, total_blocks: u64, used: &[u64]) -> Vec<u8> {
    fn header_block(fill: impl FnOnce(&mut [u8])) -> Vec<u8> {
        let mut block = vec![0u8; 16384];
        fill(&mut block);
        let sum = signed_byte_sum(&block);
        block.write_i32::<LittleEndian>(sum).unwrap();
        block
    }

    let mut image = Vec::new();
    let mut volume = vec![0u8; 512];
    volume[..16].copy_from_slice(b"PaRtImAgE-VoLuMe");
    volume[32..38].copy_from_slice(b"0.6.9\0");
    image.extend_from_slice(&volume);

    image.extend_from_slice(&header_block(|block| {
        block[..5].copy_from_slice(b"ntfs\0");
        LittleEndian::write_u64(&mut block[9592..9600], total_blocks * block_size as u64);
    }));

    let bitmap_size = total_blocks.div_ceil(8);
    image.extend_from_slice(b"MAGIC-BEGIN-LOCALHEADER");
    image.extend_from_slice(&header_block(|block| {
        LittleEndian::write_u64(&mut block[0..8], block_size as u64);
        LittleEndian::write_u64(&mut block[8..16], used.len() as u64);
        LittleEndian::write_u64(&mut block[16..24], total_blocks);
        LittleEndian::write_u64(&mut block[24..32], bitmap_size);
    }));

    image.extend_from_slice(b"MAGIC-BEGIN-INFO");
    image.extend_from_slice(&header_block(|_| {}));

    image.extend_from_slice(b"MAGIC-BEGIN-BITMAP");
    let mut bits = vec![0u8; bitmap_size as usize];
    for &b in used {
        bits[(b / 8) as usize] |= 1 << (b % 8);
    }
    image.extend_from_slice(&bits);

    image.extend_from_slice(b"MAGIC-BEGIN-DATABLOCKS");
    let blocks_per_sum = (65536 / block_size) as u64;
    let mut crc: u32 = 0;
    let mut in_batch: u64 = 0;
    for &b in used {
        let data = partimage_block(b, block_size);
        image.write_all(&data).unwrap();
        crc = crc32_update(crc, &data);
        in_batch += 1;
        if in_batch == blocks_per_sum {
            image.extend_from_slice(b"CHK\0");
            image.write_u32::<LittleEndian>(crc).unwrap();
            image.write_u64::<LittleEndian>(b).unwrap();
            crc = 0;
            in_batch = 0;
        }
    }
    image
}

fn partimage_block(block: u64, block_size: u32) -> Vec<u8> {
    let mut data = vec![(block as u8) ^ 0x5A; block_size as usize];
    LittleEndian::write_u64(&mut data[..8], block);
    data
}

fn write_image(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::File::create(&path).unwrap().write_all(bytes).unwrap();
    path
}

fn open_block_io(path: &Path, options: &OpenOptions) -> rusty_mount::BlockIo {
    let image = open_image(path, options, &mut NoProgress).unwrap();
    image.into_block_io().unwrap().1
}

// ============================================================================
// S1 — tiny partclone image, BIT bitmap
// ============================================================================

#[test]
fn test_s1_tiny_partclone_expansion() {
    let tmp = TempDir::new().unwrap();
    let bytes = build_partclone(
        4,
        8,
        &[0, 2, 3, 7],
        &[b"AAAA", b"BBBB", b"CCCC", b"DDDD"],
        None,
    );
    let path = write_image(&tmp, "s1.img", &bytes);

    let io = open_block_io(&path, &OpenOptions::default());
    assert_eq!(io.partition_size(), 32);
    let all = io.read_at(0, 32).unwrap();
    assert_eq!(
        all,
        b"AAAA\0\0\0\0BBBBCCCC\0\0\0\0\0\0\0\0\0\0\0\0DDDD"
    );
}

// ============================================================================
// S2 — partclone with grouped checksums
// ============================================================================

#[test]
fn test_s2_grouped_checksums() {
    let tmp = TempDir::new().unwrap();
    let blocks: Vec<Vec<u8>> = (0..4u8).map(|i| vec![0xD0 + i; 8]).collect();
    let block_refs: Vec<&[u8]> = blocks.iter().map(|b| b.as_slice()).collect();
    let bytes = build_partclone(8, 4, &[0, 1, 2, 3], &block_refs, Some((2, false)));
    let path = write_image(&tmp, "s2.img", &bytes);

    let header = read_header(&path).unwrap();
    // Layout is D0 D1 CRC(D0||D1) D2 D3 CRC(D2||D3): the third used block
    // starts 2 blocks and 1 checksum past the section start.
    let io = open_block_io(&path, &OpenOptions::default());
    assert_eq!(io.read_at(16, 8).unwrap(), vec![0xD2; 8]);
    assert_eq!(io.read_at(24, 8).unwrap(), vec![0xD3; 8]);
    assert_eq!(io.read_at(0, 8).unwrap(), vec![0xD0; 8]);

    // And the image is byte-exact where the resolver says the block lives.
    assert_eq!(
        bytes[(header.blocks_section_offset + 2 * 8 + 4) as usize],
        0xD2
    );
}

// ============================================================================
// S3 — popcount index correctness at scale
// ============================================================================

#[test]
fn test_s3_popcount_index_exact_on_large_bitmap() {
    // 1 MiB of bitmap = 8 Mi blocks, density ~0.3.
    let total_blocks: u64 = 8 * 1024 * 1024;
    let mut data = vec![0u8; (total_blocks / 8) as usize];
    let mut state: u64 = 0x1234_5678_9ABC_DEF0;
    for block in 0..total_blocks {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        if (state >> 33) % 10 < 3 {
            data[(block / 8) as usize] |= 1 << (block % 8);
        }
    }
    let bitmap = Bitmap::from_bit_bytes(data, total_blocks).unwrap();
    let index = PopcountIndex::build(&bitmap, 1024).unwrap();
    assert_eq!(index.used_blocks(), bitmap.count_ones());

    let mut rank: u64 = 0;
    let mut checked = 0u32;
    for block in 0..total_blocks {
        if bitmap.get(block) {
            if block % 101 == 0 {
                assert_eq!(index.rank(&bitmap, block), Some(rank));
                checked += 1;
            }
            rank += 1;
        } else if block % 1009 == 0 {
            assert_eq!(index.rank(&bitmap, block), None);
        }
    }
    assert!(checked > 10_000);
}

// ============================================================================
// S4 — ntfsclone decode
// ============================================================================

#[test]
fn test_s4_ntfsclone_runs_and_reads() {
    let tmp = TempDir::new().unwrap();
    let clusters: Vec<Option<Vec<u8>>> = vec![
        None,
        None,
        None,
        Some(b"block1..".to_vec()),
        None,
        Some(b"block2..".to_vec()),
    ];
    let path = write_image(&tmp, "s4.img", &build_ntfsclone(8, &clusters));

    let image = open_image(&path, &OpenOptions::default(), &mut NoProgress).unwrap();
    assert_eq!(image.header().format, ImageFormat::Ntfsclone);
    assert_eq!(image.header().used_blocks, 2);
    assert_eq!(image.header().partition_size(), 48);

    let (_, io) = image.into_block_io().unwrap();
    assert_eq!(io.read_at(24, 8).unwrap(), b"block1..");
    assert_eq!(io.read_at(40, 8).unwrap(), b"block2..");
    assert_eq!(io.read_at(0, 24).unwrap(), vec![0u8; 24]);
    assert_eq!(io.read_at(32, 8).unwrap(), vec![0u8; 8]);
    // Unaligned read across gap and data.
    assert_eq!(io.read_at(20, 10).unwrap(), b"\0\0\0\0block1");
}

// ============================================================================
// S5 — split and compressed input
// ============================================================================

#[test]
fn test_s5_split_zstd_header_then_unseekable() {
    let tmp = TempDir::new().unwrap();
    let bytes = build_partclone(
        4,
        8,
        &[0, 2, 3, 7],
        &[b"AAAA", b"BBBB", b"CCCC", b"DDDD"],
        None,
    );
    let plain_path = write_image(&tmp, "plain.img", &bytes);
    let plain_header = read_header(&plain_path).unwrap();

    // Whole-file zstd, then split into three parts.
    let compressed = zstd::encode_all(&bytes[..], 3).unwrap();
    let third = compressed.len().div_ceil(3);
    for (i, chunk) in compressed.chunks(third).enumerate() {
        let suffix: String = [b'a' + (i / 26) as u8, b'a' + (i % 26) as u8]
            .iter()
            .map(|&c| c as char)
            .collect();
        write_image(&tmp, &format!("img.{suffix}"), chunk);
    }
    let split_path = tmp.path().join("img.aa");

    // Sequential open sees the same header as the plain image.
    let image = open_image(&split_path, &OpenOptions::default(), &mut NoProgress).unwrap();
    let header = image.header();
    assert_eq!(header.format, plain_header.format);
    assert_eq!(header.block_size, plain_header.block_size);
    assert_eq!(header.total_blocks, plain_header.total_blocks);
    assert_eq!(header.used_blocks, plain_header.used_blocks);

    // Random access over compressed input is refused.
    match image.into_block_io() {
        Err(ImageError::UnseekableCompressed(name)) => assert_eq!(name, "zstd"),
        other => panic!("expected UnseekableCompressed, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_s5_split_uncompressed_is_seekable() {
    let tmp = TempDir::new().unwrap();
    let bytes = build_partclone(
        4,
        8,
        &[0, 2, 3, 7],
        &[b"AAAA", b"BBBB", b"CCCC", b"DDDD"],
        None,
    );
    // Split the raw image; boundaries intentionally land inside the header.
    let third = bytes.len().div_ceil(3);
    for (i, chunk) in bytes.chunks(third).enumerate() {
        let suffix: String = [b'a', b'a' + i as u8].iter().map(|&c| c as char).collect();
        write_image(&tmp, &format!("raw.{suffix}"), chunk);
    }
    let io = open_block_io(&tmp.path().join("raw.aa"), &OpenOptions::default());
    assert_eq!(
        io.read_at(0, 32).unwrap(),
        b"AAAA\0\0\0\0BBBBCCCC\0\0\0\0\0\0\0\0\0\0\0\0DDDD"
    );
}

// ============================================================================
// S6 — range boundaries
// ============================================================================

#[test]
fn test_s6_out_of_range() {
    let tmp = TempDir::new().unwrap();
    let bytes = build_partclone(4, 8, &[0], &[b"AAAA"], None);
    let path = write_image(&tmp, "s6.img", &bytes);
    let io = open_block_io(&path, &OpenOptions::default());

    let partition_size = io.partition_size();
    assert!(matches!(
        io.read_at(partition_size, 1),
        Err(ImageError::OutOfRange { .. })
    ));
    assert_eq!(io.read_at(partition_size - 1, 1).unwrap().len(), 1);
}

// ============================================================================
// Cross-cutting invariants
// ============================================================================

/// Pseudo-random used set and payloads for a mid-sized partclone image.
fn scrambled_partclone(block_size: u32, total_blocks: u64) -> (Vec<u8>, Vec<u8>) {
    let mut used = Vec::new();
    let mut state: u64 = 99;
    for block in 0..total_blocks {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        if (state >> 33) % 10 < 4 {
            used.push(block);
        }
    }
    let blocks: Vec<Vec<u8>> = used
        .iter()
        .map(|&b| {
            (0..block_size)
                .map(|i| (b as u8).wrapping_mul(31).wrapping_add(i as u8))
                .collect()
        })
        .collect();
    let block_refs: Vec<&[u8]> = blocks.iter().map(|b| b.as_slice()).collect();
    let image = build_partclone(block_size, total_blocks, &used, &block_refs, Some((4, true)));

    // The partition a restore would produce: zeros plus used payloads.
    let mut partition = vec![0u8; (total_blocks * block_size as u64) as usize];
    for (&b, data) in used.iter().zip(&blocks) {
        let at = (b * block_size as u64) as usize;
        partition[at..at + data.len()].copy_from_slice(data);
    }
    (image, partition)
}

#[test]
fn test_round_trip_matches_restored_partition() {
    let tmp = TempDir::new().unwrap();
    let (image, partition) = scrambled_partclone(16, 512);
    let path = write_image(&tmp, "roundtrip.img", &image);
    let io = open_block_io(&path, &OpenOptions::default());

    let all = io.read_at(0, partition.len()).unwrap();
    assert_eq!(all, partition);

    // Idempotence: unchanged image, identical bytes.
    assert_eq!(io.read_at(0, partition.len()).unwrap(), all);
}

#[test]
fn test_cache_transparency() {
    let tmp = TempDir::new().unwrap();
    let (image, partition) = scrambled_partclone(16, 256);
    let path = write_image(&tmp, "cache.img", &image);

    let cached = open_block_io(&path, &OpenOptions::default());
    let uncached = open_block_io(
        &path,
        &OpenOptions {
            cache_blocks: 0,
            ..OpenOptions::default()
        },
    );
    for (offset, size) in [(0u64, 4096usize), (13, 777), (1000, 2048), (4090, 6)] {
        let a = cached.read_at(offset, size).unwrap();
        let b = uncached.read_at(offset, size).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, &partition[offset as usize..offset as usize + size]);
    }
}

#[test]
fn test_index_window_independence() {
    let tmp = TempDir::new().unwrap();
    let (image, partition) = scrambled_partclone(8, 2048);
    let path = write_image(&tmp, "window.img", &image);

    for window in [512u32, 1024, 4096, 65536] {
        let io = open_block_io(
            &path,
            &OpenOptions {
                index_window: window,
                ..OpenOptions::default()
            },
        );
        for (offset, size) in [(0u64, 512usize), (333, 1000), (16_000, 384)] {
            assert_eq!(
                io.read_at(offset, size).unwrap(),
                &partition[offset as usize..offset as usize + size],
                "window {window}"
            );
        }
    }
}

#[test]
fn test_absent_ranges_read_zero() {
    let tmp = TempDir::new().unwrap();
    // Only block 9 present out of 64.
    let bytes = build_partclone(32, 64, &[9], &[&[0xFFu8; 32]], None);
    let path = write_image(&tmp, "absent.img", &bytes);
    let io = open_block_io(&path, &OpenOptions::default());

    assert_eq!(io.read_at(0, 9 * 32).unwrap(), vec![0u8; 9 * 32]);
    assert_eq!(io.read_at(10 * 32, 54 * 32).unwrap(), vec![0u8; 54 * 32]);
    assert_eq!(io.read_at(9 * 32, 32).unwrap(), vec![0xFF; 32]);
}

#[test]
fn test_verify_targets_flipped_block() {
    let tmp = TempDir::new().unwrap();
    let blocks: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 8]).collect();
    let block_refs: Vec<&[u8]> = blocks.iter().map(|b| b.as_slice()).collect();
    let mut bytes = build_partclone(8, 8, &[0, 1, 2, 4, 5, 6], &block_refs, Some((1, true)));
    let header = read_header(&write_image(&tmp, "tmp.img", &bytes)).unwrap();

    // Flip one byte in the fourth used block's payload.
    let at = header.blocks_section_offset as usize + 3 * (8 + 4) + 2;
    bytes[at] ^= 0x10;
    let path = write_image(&tmp, "flip.img", &bytes);

    let options = OpenOptions {
        verify_checksums: true,
        ..OpenOptions::default()
    };
    let image = open_image(&path, &options, &mut NoProgress).unwrap();
    assert_eq!(image.verify_failure(), Some(3));
}

// ============================================================================
// Partimage end to end
// ============================================================================

#[test]
fn test_partimage_reads_and_verifies() {
    let tmp = TempDir::new().unwrap();
    // 40 used blocks of 4 KiB: two full CHK batches of 16, one partial tail.
    let used: Vec<u64> = (0..64).filter(|b| b % 3 != 1).take(40).collect();
    let bytes = build_partimage(4096, 64, &used);
    let path = write_image(&tmp, "pi.img", &bytes);

    let options = OpenOptions {
        verify_checksums: true,
        ..OpenOptions::default()
    };
    let image = open_image(&path, &options, &mut NoProgress).unwrap();
    assert_eq!(image.header().format, ImageFormat::Partimage);
    assert_eq!(image.header().fs_label, "NTFS");
    assert_eq!(image.header().used_blocks, 40);
    assert_eq!(image.verify_failure(), None);

    let (header, io) = image.into_block_io().unwrap();
    for &b in &used {
        assert_eq!(
            io.read_at(b * header.block_size as u64, header.block_size as usize)
                .unwrap(),
            partimage_block(b, header.block_size),
            "block {b}"
        );
    }
    // A block the bitmap marks absent reads as zeros.
    assert_eq!(io.read_at(4096, 4096).unwrap(), vec![0u8; 4096]);
}

// ============================================================================
// Compressed containers
// ============================================================================

#[test]
fn test_all_containers_decode_to_same_header() {
    let tmp = TempDir::new().unwrap();
    let bytes = build_partclone(
        4,
        8,
        &[0, 2, 3, 7],
        &[b"AAAA", b"BBBB", b"CCCC", b"DDDD"],
        None,
    );
    let plain = read_header(&write_image(&tmp, "c.img", &bytes)).unwrap();

    let mut gz = Vec::new();
    let mut enc = flate2::write::GzEncoder::new(&mut gz, flate2::Compression::default());
    enc.write_all(&bytes).unwrap();
    enc.finish().unwrap();

    let mut bz = Vec::new();
    let mut enc = bzip2::write::BzEncoder::new(&mut bz, bzip2::Compression::default());
    enc.write_all(&bytes).unwrap();
    enc.finish().unwrap();

    let mut xz = Vec::new();
    let mut enc = xz2::write::XzEncoder::new(&mut xz, 6);
    enc.write_all(&bytes).unwrap();
    enc.finish().unwrap();

    let mut lzma = Vec::new();
    let lzma_opts = xz2::stream::LzmaOptions::new_preset(6).unwrap();
    let lzma_stream = xz2::stream::Stream::new_lzma_encoder(&lzma_opts).unwrap();
    let mut enc = xz2::write::XzEncoder::new_stream(&mut lzma, lzma_stream);
    enc.write_all(&bytes).unwrap();
    enc.finish().unwrap();

    let zst = zstd::encode_all(&bytes[..], 3).unwrap();

    let mut lz4 = Vec::new();
    let mut enc = lz4_flex::frame::FrameEncoder::new(&mut lz4);
    enc.write_all(&bytes).unwrap();
    enc.finish().unwrap();

    for (name, data) in [
        ("c.gz", gz),
        ("c.bz2", bz),
        ("c.xz", xz),
        ("c.lzma", lzma),
        ("c.zst", zst),
        ("c.lz4", lz4),
    ] {
        let header = read_header(&write_image(&tmp, name, &data)).unwrap();
        assert_eq!(header.format, plain.format, "{name}");
        assert_eq!(header.total_blocks, plain.total_blocks, "{name}");
        assert_eq!(header.used_blocks, plain.used_blocks, "{name}");
    }
}
