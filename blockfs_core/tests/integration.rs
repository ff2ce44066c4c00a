/// End-to-end tests of the block image container driving the zstd plugin:
/// create, append, read back, inspect.
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use blockfs_codecs::{ZstdCodec, ZstdMode, ZSTD_DEFAULT_COMPRESSION_LEVEL};
use blockfs_core::format::{FLAG_COMP_OPTS, SUPERBLOCK_SIZE};
use blockfs_core::{Compressor, Configuration, Reader, Writer};
use tempfile::TempDir;

const BLOCK_SIZE: u32 = 64 * 1024;

/// Generate `len` deterministic bytes using a simple LCG.
fn pseudo_random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = seed;
    (0..len)
        .map(|_| {
            rng = rng
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (rng >> 56) as u8
        })
        .collect()
}

/// Generate `len` highly compressible bytes (repeating pattern).
fn compressible_bytes(len: usize) -> Vec<u8> {
    let pattern = b"the quick brown fox jumps over the lazy dog. ";
    (0..len).map(|i| pattern[i % pattern.len()]).collect()
}

// ── helpers ───────────────────────────────────────────────────────────────

fn image_path(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(format!("{}.img", name))
}

fn zstd() -> Arc<dyn Compressor> {
    Arc::new(ZstdCodec::new())
}

fn read_all(reader: &mut Reader) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..reader.block_count() {
        out.extend(reader.read_block(i).unwrap());
    }
    out
}

fn build(path: &PathBuf, codec: Arc<dyn Compressor>, config: Configuration, data: &[u8]) -> u64 {
    let mut w = Writer::create(path, codec, config, BLOCK_SIZE).unwrap();
    w.write(data).unwrap();
    w.finish().unwrap()
}

// ── tests ──────────────────────────────────────────────────────────────────

#[test]
fn test_roundtrip_default_options_has_no_record() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir, "default");
    let data = compressible_bytes(8 * BLOCK_SIZE as usize + 777);
    let codec = zstd();

    let blocks = build(&path, codec.clone(), codec.default_configuration(), &data);
    assert_eq!(blocks, 9);

    let mut r = Reader::open(&path, codec).unwrap();
    assert!(!r.superblock.has_flag(FLAG_COMP_OPTS));
    assert!(r.options_record().is_empty());
    assert_eq!(r.configuration().compression_level, ZSTD_DEFAULT_COMPRESSION_LEVEL);
    assert_eq!(read_all(&mut r), data);
    assert!(r.compressed_size() < r.raw_size());
}

#[test]
fn test_non_default_level_is_embedded() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir, "level19");
    let data = compressible_bytes(3 * BLOCK_SIZE as usize);

    build(&path, zstd(), Configuration::with_level(19), &data);

    // Record sits right after the superblock: u16 length, then i32 LE level.
    let raw = std::fs::read(&path).unwrap();
    let at = SUPERBLOCK_SIZE as usize;
    assert_eq!(&raw[at..at + 2], &4u16.to_le_bytes());
    assert_eq!(&raw[at + 2..at + 6], &19i32.to_le_bytes());

    let mut r = Reader::open(&path, zstd()).unwrap();
    assert!(r.superblock.has_flag(FLAG_COMP_OPTS));
    assert_eq!(r.configuration().compression_level, 19);
    assert_eq!(read_all(&mut r), data);

    let mut shown = Vec::new();
    r.display_options(&mut shown).unwrap();
    assert_eq!(String::from_utf8(shown).unwrap(), "\tcompression-level 19\n");
}

#[test]
fn test_append_restores_stored_options() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir, "append");
    let first = compressible_bytes(2 * BLOCK_SIZE as usize);
    let second = pseudo_random_bytes(BLOCK_SIZE as usize / 2, 99);

    build(&path, zstd(), Configuration::with_level(4), &first);

    let mut w = Writer::append(&path, zstd()).unwrap();
    assert_eq!(w.configuration().compression_level, 4);
    w.write(&second).unwrap();
    assert_eq!(w.finish().unwrap(), 3);

    let mut r = Reader::open(&path, zstd()).unwrap();
    assert_eq!(r.configuration().compression_level, 4);
    let mut expected = first.clone();
    expected.extend_from_slice(&second);
    assert_eq!(read_all(&mut r), expected);
}

#[test]
fn test_append_without_record_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir, "append_default");
    let codec = zstd();
    build(&path, codec.clone(), codec.default_configuration(), b"first partial block");

    let mut w = Writer::append(&path, codec.clone()).unwrap();
    assert_eq!(*w.configuration(), codec.default_configuration());
    w.write(b" and a second one").unwrap();
    assert_eq!(w.finish().unwrap(), 2);

    // Blocks of uneven size: ranges must still resolve by raw offsets.
    let mut r = Reader::open(&path, codec).unwrap();
    assert_eq!(r.read_range(6, 20).unwrap(), b"partial block and a ".to_vec());
}

#[test]
fn test_incompressible_blocks_are_stored_raw() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir, "incompressible");
    let data = pseudo_random_bytes(BLOCK_SIZE as usize * 4, 0x1234_5678);

    build(&path, zstd(), Configuration::with_level(3), &data);

    let mut r = Reader::open(&path, zstd()).unwrap();
    assert_eq!(r.uncompressed_blocks(), 4);
    assert_eq!(r.compressed_size(), r.raw_size());
    assert_eq!(read_all(&mut r), data);
}

#[test]
fn test_stream_mode_image_reads_in_block_mode() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir, "stream");
    let data = compressible_bytes(5 * BLOCK_SIZE as usize + 10);

    build(
        &path,
        Arc::new(ZstdCodec::with_mode(ZstdMode::Stream)),
        Configuration::with_level(12),
        &data,
    );

    let mut r = Reader::open(&path, zstd()).unwrap();
    assert_eq!(read_all(&mut r), data);
}

#[test]
fn test_read_range_crosses_block_boundary() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir, "range");
    let data = compressible_bytes(4 * BLOCK_SIZE as usize);
    build(&path, zstd(), Configuration::with_level(1), &data);

    let mut r = Reader::open(&path, zstd()).unwrap();
    let start = BLOCK_SIZE as u64 - 100;
    let result = r.read_range(start, 300).unwrap();
    assert_eq!(result.as_slice(), &data[start as usize..start as usize + 300]);
}

#[test]
fn test_read_range_past_the_end_is_clamped() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir, "range_tail");
    let data = compressible_bytes(BLOCK_SIZE as usize + 500);
    build(&path, zstd(), Configuration::with_level(1), &data);

    let mut r = Reader::open(&path, zstd()).unwrap();
    let result = r.read_range(10, u64::MAX).unwrap();
    assert_eq!(result.as_slice(), &data[10..]);
}

/// Overwrite bytes in an existing image.
fn patch(path: &PathBuf, offset: u64, bytes: &[u8]) {
    let mut f = OpenOptions::new().write(true).open(path).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(bytes).unwrap();
}

#[test]
fn test_huge_block_count_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir, "huge_count");
    build(&path, zstd(), Configuration::with_level(3), &compressible_bytes(5000));

    // block_count lives at superblock bytes 16..24.
    patch(&path, 16, &(u64::MAX / 2).to_le_bytes());

    let err = Reader::open(&path, zstd()).err().unwrap();
    assert!(format!("{:#}", err).contains("block index"), "{err:#}");
    assert!(Writer::append(&path, zstd()).is_err());
}

#[test]
fn test_block_past_index_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir, "long_block");
    build(&path, zstd(), Configuration::with_level(3), &compressible_bytes(5000));

    let bytes = std::fs::read(&path).unwrap();
    let footer: [u8; 8] = bytes[bytes.len() - 8..].try_into().unwrap();
    let index_offset = u64::from_le_bytes(footer);
    // stored_len of the first entry lives at entry bytes 8..12.
    patch(&path, index_offset + 8, &u32::MAX.to_le_bytes());

    let err = Reader::open(&path, zstd()).err().unwrap();
    assert!(format!("{:#}", err).contains("outside the data area"), "{err:#}");
}

#[test]
fn test_truncated_image_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir, "truncated");
    build(&path, zstd(), Configuration::with_level(3), &compressible_bytes(5000));

    let len = std::fs::metadata(&path).unwrap().len();
    OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 20).unwrap();

    assert!(Reader::open(&path, zstd()).is_err());
}

#[test]
fn test_corrupt_options_record_fails_open() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir, "corrupt_opts");
    build(&path, zstd(), Configuration::with_level(19), &compressible_bytes(1000));

    // Overwrite the stored level with an out-of-range one.
    let mut f = OpenOptions::new().write(true).open(&path).unwrap();
    f.seek(SeekFrom::Start(SUPERBLOCK_SIZE + 2)).unwrap();
    f.write_all(&1000i32.to_le_bytes()).unwrap();
    drop(f);

    let err = Reader::open(&path, zstd()).err().unwrap();
    assert!(format!("{:#}", err).contains("compression options"), "{err:#}");
    assert!(Writer::append(&path, zstd()).is_err());
}

#[test]
fn test_corrupt_options_record_still_inspects() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir, "inspect_corrupt");
    let data = compressible_bytes(3 * BLOCK_SIZE as usize);
    let blocks = build(&path, zstd(), Configuration::with_level(19), &data);
    patch(&path, SUPERBLOCK_SIZE + 2, &1000i32.to_le_bytes());

    let mut r = Reader::inspect(&path, zstd()).unwrap();
    assert_eq!(r.block_count(), blocks);
    assert_eq!(r.raw_size(), data.len() as u64);
    let reason = r.options_error().expect("record error is kept").to_string();
    assert!(reason.contains("bad compression level 1000"), "{reason}");

    let err = r.read_block(0).unwrap_err().to_string();
    assert!(err.contains("cannot be decompressed"), "{err}");
}

#[test]
fn test_checksum_mismatch_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir, "checksum");
    build(&path, zstd(), Configuration::with_level(3), &compressible_bytes(5000));

    let offset = Reader::open(&path, zstd()).unwrap().entries()[0].offset;
    let mut f = OpenOptions::new().write(true).open(&path).unwrap();
    f.seek(SeekFrom::Start(offset + 5)).unwrap();
    f.write_all(&[0xAA]).unwrap();
    drop(f);

    let mut r = Reader::open(&path, zstd()).unwrap();
    let err = r.read_block(0).unwrap_err().to_string();
    assert!(err.contains("checksum mismatch"), "{err}");
}

#[test]
fn test_wrong_magic_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir, "not_an_image");
    std::fs::write(&path, vec![0u8; 128]).unwrap();
    let err = Reader::open(&path, zstd()).err().unwrap();
    assert!(err.to_string().contains("magic"), "{err}");
}
