use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use xxhash_rust::xxh3::xxh3_64;

use crate::codec::Compressor;
use crate::error::CodecError;
use crate::format::{
    BlockEntry, Superblock, BLOCK_ENTRY_SIZE, FLAG_COMP_OPTS, FLAG_HAS_CHECKSUM, FOOTER_SIZE,
    FORMAT_VERSION, SUPERBLOCK_SIZE,
};
use crate::options::Configuration;

/// Random-access reader for blockfs images.
///
/// # Open sequence
/// 1. Read the 40-byte superblock (magic, version, compression id).
/// 2. Read the options record, if flagged, and hand it to the codec's
///    extractor. This always happens before any block is decompressed.
/// 3. Seek to `file_end - 8`, read the index offset, validate the index
///    extent against the file length, and load the block index.
pub struct Reader {
    file: File,
    pub superblock: Superblock,
    entries: Vec<BlockEntry>,
    codec: Arc<dyn Compressor>,
    config: Configuration,
    options_record: Vec<u8>,
    /// Set only by [`Reader::inspect`] when the stored record did not load.
    options_error: Option<CodecError>,
}

impl Reader {
    /// Open an image. `codec` must match the compression id in the superblock.
    ///
    /// Fails if the stored options record is corrupt.
    pub fn open(path: impl AsRef<Path>, codec: Arc<dyn Compressor>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut reader = Self::load(path, codec)?;
        if let Some(e) = reader.options_error.take() {
            return Err(e).with_context(|| format!("loading compressor options from {:?}", path));
        }
        Ok(reader)
    }

    /// Open an image for inspection.
    ///
    /// A corrupt options record does not fail the open: the superblock and
    /// block index stay readable, the error is kept in [`options_error`],
    /// and [`read_block`] refuses to decompress anything.
    ///
    /// [`options_error`]: Reader::options_error
    /// [`read_block`]: Reader::read_block
    pub fn inspect(path: impl AsRef<Path>, codec: Arc<dyn Compressor>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let reader = Self::load(path, codec)?;
        if let Some(e) = &reader.options_error {
            log::warn!("{:?}: {}", path, e);
        }
        Ok(reader)
    }

    fn load(path: &Path, codec: Arc<dyn Compressor>) -> anyhow::Result<Self> {
        let mut file = File::open(path).with_context(|| format!("opening image {:?}", path))?;

        let superblock = read_superblock(&mut file)?;
        check_superblock(&superblock, codec.as_ref())?;

        let options_record = read_options_record(&mut file, &superblock)?;
        let mut config = codec.default_configuration();
        let options_error = codec
            .extract_options(&mut config, superblock.block_size as usize, &options_record)
            .err();

        let (_, entries) = read_index(&mut file, &superblock)?;

        Ok(Self {
            file,
            superblock,
            entries,
            codec,
            config,
            options_record,
            options_error,
        })
    }

    /// Why the stored options record failed to load, for images opened
    /// with [`Reader::inspect`].
    pub fn options_error(&self) -> Option<&CodecError> {
        self.options_error.as_ref()
    }

    /// Total number of blocks in the image.
    #[inline]
    pub fn block_count(&self) -> u64 {
        self.superblock.block_count
    }

    /// Nominal raw bytes per block.
    #[inline]
    pub fn block_size(&self) -> u32 {
        self.superblock.block_size
    }

    /// The configuration restored from the options record.
    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// Raw options record bytes as stored (empty when the image has none).
    pub fn options_record(&self) -> &[u8] {
        &self.options_record
    }

    /// Print the stored options through the codec's display operation.
    /// Images built with default options print nothing.
    pub fn display_options(&self, out: &mut dyn Write) -> std::io::Result<()> {
        if self.superblock.has_flag(FLAG_COMP_OPTS) {
            self.codec.display_options(&self.options_record, out)?;
        }
        Ok(())
    }

    /// Total uncompressed size of all blocks in bytes.
    pub fn raw_size(&self) -> u64 {
        self.entries.iter().map(|e| e.raw_len as u64).sum()
    }

    /// Total stored size of all blocks in bytes (excluding index/superblock).
    pub fn compressed_size(&self) -> u64 {
        self.entries.iter().map(|e| e.stored_len as u64).sum()
    }

    /// Compression ratio (raw / stored).
    pub fn ratio(&self) -> f64 {
        let raw = self.raw_size();
        let compressed = self.compressed_size();
        if compressed == 0 {
            return 1.0;
        }
        raw as f64 / compressed as f64
    }

    /// Number of blocks that were stored uncompressed.
    pub fn uncompressed_blocks(&self) -> usize {
        self.entries.iter().filter(|e| e.is_uncompressed()).count()
    }

    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    /// Read and, if needed, decompress block `idx`.
    pub fn read_block(&mut self, idx: u64) -> anyhow::Result<Vec<u8>> {
        let entry = self
            .entries
            .get(idx as usize)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "block index {} out of range (total {})",
                    idx,
                    self.superblock.block_count
                )
            })?
            .clone();

        self.file.seek(SeekFrom::Start(entry.offset))?;
        let mut stored = vec![0u8; entry.stored_len as usize];
        self.file.read_exact(&mut stored)?;

        if self.superblock.has_flag(FLAG_HAS_CHECKSUM) {
            let computed = xxh3_64(&stored);
            if computed != entry.checksum {
                anyhow::bail!(
                    "block {} checksum mismatch: expected {:016x}, got {:016x}",
                    idx,
                    entry.checksum,
                    computed
                );
            }
        }

        if entry.is_uncompressed() {
            if stored.len() != entry.raw_len as usize {
                anyhow::bail!(
                    "uncompressed block {} holds {} bytes but index says {}",
                    idx,
                    stored.len(),
                    entry.raw_len
                );
            }
            return Ok(stored);
        }

        if let Some(e) = &self.options_error {
            anyhow::bail!("block {} cannot be decompressed: {}", idx, e);
        }

        let capacity = (self.superblock.block_size as usize).max(entry.raw_len as usize);
        let mut raw = vec![0u8; capacity];
        let n = self
            .codec
            .uncompress(&self.config, &mut raw, &stored)
            .with_context(|| {
                format!(
                    "decompressing block {} ({} stored bytes, {} raw)",
                    idx, entry.stored_len, entry.raw_len
                )
            })?;

        if n != entry.raw_len as usize {
            anyhow::bail!(
                "block {} decompressed to {} bytes but index says {}",
                idx,
                n,
                entry.raw_len
            );
        }
        raw.truncate(n);
        Ok(raw)
    }

    /// Decompress and return up to `len` bytes starting at raw byte offset
    /// `start` within the logical (uncompressed) image contents.
    ///
    /// Blocks are located by their cumulative raw lengths, so images that
    /// were appended to after a partial trailing block are handled too.
    pub fn read_range(&mut self, start: u64, len: u64) -> anyhow::Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }

        let raw_total = self.raw_size();
        if start >= raw_total {
            anyhow::bail!("read_range start {} is beyond raw size {}", start, raw_total);
        }
        let end = start.saturating_add(len).min(raw_total);

        let mut result = Vec::with_capacity((end - start) as usize);
        let mut block_start = 0u64;
        for idx in 0..self.entries.len() {
            let block_end = block_start + self.entries[idx].raw_len as u64;
            if block_end > start && block_start < end {
                let block_raw = self.read_block(idx as u64)?;
                let from = start.saturating_sub(block_start) as usize;
                let to = (end.min(block_end) - block_start) as usize;
                result.extend_from_slice(&block_raw[from..to]);
            }
            if block_end >= end {
                break;
            }
            block_start = block_end;
        }

        Ok(result)
    }
}

pub(crate) fn read_superblock(file: &mut File) -> anyhow::Result<Superblock> {
    let mut buf = [0u8; SUPERBLOCK_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf).context("reading superblock")?;
    Superblock::from_bytes(&buf)
}

pub(crate) fn check_superblock(
    superblock: &Superblock,
    codec: &dyn Compressor,
) -> anyhow::Result<()> {
    if superblock.version != FORMAT_VERSION {
        anyhow::bail!(
            "unsupported image version {} (only version {} is supported)",
            superblock.version,
            FORMAT_VERSION
        );
    }
    if superblock.block_size == 0 {
        anyhow::bail!("superblock declares a zero block size");
    }
    if superblock.compression_id != codec.id() {
        anyhow::bail!(
            "compressor mismatch: image uses compression id {} but {} has id {}",
            superblock.compression_id,
            codec.name(),
            codec.id()
        );
    }
    if !codec.supported() {
        anyhow::bail!("compressor {} is not supported by this build", codec.name());
    }
    Ok(())
}

/// Load the options record that follows the superblock. Returns an empty
/// buffer when the image was built with default options.
pub(crate) fn read_options_record(
    file: &mut File,
    superblock: &Superblock,
) -> anyhow::Result<Vec<u8>> {
    if !superblock.has_flag(FLAG_COMP_OPTS) {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(SUPERBLOCK_SIZE))?;
    let mut len_buf = [0u8; 2];
    file.read_exact(&mut len_buf).context("reading options record length")?;
    let mut record = vec![0u8; u16::from_le_bytes(len_buf) as usize];
    file.read_exact(&mut record).context("reading options record")?;
    Ok(record)
}

/// Load the block index. Returns the index offset along with the entries.
///
/// The index must end exactly at the footer and every entry must lie
/// between the superblock and the index, so nothing read from disk sizes an
/// allocation before it has been checked against the file length.
pub(crate) fn read_index(
    file: &mut File,
    superblock: &Superblock,
) -> anyhow::Result<(u64, Vec<BlockEntry>)> {
    let file_len = file.metadata()?.len();
    if file_len < SUPERBLOCK_SIZE + FOOTER_SIZE {
        anyhow::bail!("image of {} bytes is too short to hold a block index", file_len);
    }

    file.seek(SeekFrom::Start(file_len - FOOTER_SIZE))
        .context("seeking to footer")?;
    let mut footer_buf = [0u8; FOOTER_SIZE as usize];
    file.read_exact(&mut footer_buf)?;
    let index_offset = u64::from_le_bytes(footer_buf);

    let index_end = superblock
        .block_count
        .checked_mul(BLOCK_ENTRY_SIZE)
        .and_then(|len| len.checked_add(index_offset))
        .and_then(|end| end.checked_add(FOOTER_SIZE));
    if index_offset < SUPERBLOCK_SIZE || index_end != Some(file_len) {
        anyhow::bail!(
            "block index of {} entries at offset {} does not fit an image of {} bytes",
            superblock.block_count,
            index_offset,
            file_len
        );
    }

    file.seek(SeekFrom::Start(index_offset))?;
    let mut entries = Vec::with_capacity(superblock.block_count as usize);
    let mut entry_buf = [0u8; BLOCK_ENTRY_SIZE as usize];
    for idx in 0..superblock.block_count {
        file.read_exact(&mut entry_buf)?;
        let entry = BlockEntry::from_bytes(&entry_buf)?;

        let block_end = entry.offset.checked_add(entry.stored_len as u64);
        if entry.offset < SUPERBLOCK_SIZE || block_end.map_or(true, |end| end > index_offset) {
            anyhow::bail!(
                "block {} ({} bytes at offset {}) lies outside the data area ending at {}",
                idx,
                entry.stored_len,
                entry.offset,
                index_offset
            );
        }
        if entry.raw_len > superblock.block_size {
            anyhow::bail!(
                "block {} claims {} raw bytes, more than the block size {}",
                idx,
                entry.raw_len,
                superblock.block_size
            );
        }
        entries.push(entry);
    }
    Ok((index_offset, entries))
}
