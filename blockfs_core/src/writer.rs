use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rayon::prelude::*;
use xxhash_rust::xxh3::xxh3_64;

use crate::codec::{CompressContext, CompressOutcome, Compressor};
use crate::error::CodecError;
use crate::format::{
    BlockEntry, Superblock, BLOCK_ENTRY_SIZE, BLOCK_UNCOMPRESSED, FLAG_COMP_OPTS,
    FLAG_HAS_CHECKSUM, FORMAT_VERSION, OPTIONS_LEN_SIZE, SUPERBLOCK_SIZE,
};
use crate::options::Configuration;
use crate::reader::{check_superblock, read_index, read_options_record, read_superblock};

/// Full blocks gathered before a batch is handed to the worker pool.
const BATCH_BLOCKS: usize = 64;

/// Writer for blockfs images.
///
/// # Write contract
/// Call [`write`] any number of times with arbitrary-sized byte slices.
/// Full blocks are compressed in parallel batches; each worker thread owns
/// its own compression context and all of them share the same read-only
/// [`Configuration`]. Call [`finish`] to flush the trailing partial block,
/// append the block index and footer, and write back the final superblock.
///
/// # Format layout written
/// ```text
/// [SUPERBLOCK: 40 bytes placeholder]
/// [OPTIONS: u16 len + record]               ← only if the config is non-default
/// [BLOCK 0] [BLOCK 1] ... [BLOCK N-1]      ← compressed or stored raw
/// [BLOCK INDEX: 32 bytes × N]
/// [FOOTER: 8 bytes, u64 LE offset of block index]
/// ← seek back to 0, overwrite superblock with real values
/// ```
///
/// [`write`]: Writer::write
/// [`finish`]: Writer::finish
pub struct Writer {
    file: File,
    codec: Arc<dyn Compressor>,
    config: Configuration,
    block_size: u32,
    flags: u64,
    /// Pending raw bytes not yet flushed into a block.
    pending: Vec<u8>,
    /// In-memory block index, appended to file on `finish()`.
    entries: Vec<BlockEntry>,
    /// Current write position in the file (mirrors the file cursor).
    current_offset: u64,
}

/// A block as it will land on disk.
struct StoredBlock {
    data: Vec<u8>,
    raw_len: u32,
    uncompressed: bool,
}

impl Writer {
    /// Create a new image at `path`, compressing with `codec` under `config`.
    ///
    /// Overwrites any existing file. The codec's options record is embedded
    /// right after the superblock when `config` differs from the default.
    pub fn create(
        path: impl AsRef<Path>,
        codec: Arc<dyn Compressor>,
        config: Configuration,
        block_size: u32,
    ) -> anyhow::Result<Self> {
        if !codec.supported() {
            anyhow::bail!("compressor {} is not supported by this build", codec.name());
        }
        if block_size == 0 {
            anyhow::bail!("block size must be non-zero");
        }

        let mut file = File::create(path)?;
        // Placeholder superblock, overwritten in finish()
        file.write_all(&[0u8; SUPERBLOCK_SIZE as usize])?;
        let mut current_offset = SUPERBLOCK_SIZE;
        let mut flags = FLAG_HAS_CHECKSUM;

        if let Some(record) = codec.dump_options(&config, block_size as usize) {
            let len = u16::try_from(record.len()).with_context(|| {
                format!("{} options record of {} bytes", codec.name(), record.len())
            })?;
            file.write_all(&len.to_le_bytes())?;
            file.write_all(&record)?;
            current_offset += OPTIONS_LEN_SIZE + record.len() as u64;
            flags |= FLAG_COMP_OPTS;
            log::debug!("{}: stored {}-byte options record", codec.name(), record.len());
        }

        Ok(Self {
            file,
            codec,
            config,
            block_size,
            flags,
            pending: Vec::with_capacity(block_size as usize * 2),
            entries: Vec::new(),
            current_offset,
        })
    }

    /// Reopen an existing image to add more blocks.
    ///
    /// The stored options record is loaded through the codec before anything
    /// else, so appended blocks use exactly the parameters the image was
    /// built with. An image without a record resets to the codec defaults.
    pub fn append(path: impl AsRef<Path>, codec: Arc<dyn Compressor>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening image {:?} for append", path))?;

        let superblock = read_superblock(&mut file)?;
        check_superblock(&superblock, codec.as_ref())?;

        let record = read_options_record(&mut file, &superblock)?;
        let mut config = codec.default_configuration();
        codec
            .extract_options(&mut config, superblock.block_size as usize, &record)
            .with_context(|| format!("loading compressor options from {:?}", path))?;

        let (index_offset, entries) = read_index(&mut file, &superblock)?;
        // Drop the old index and footer; they are rewritten by finish()
        file.set_len(index_offset)?;
        file.seek(SeekFrom::Start(index_offset))?;

        log::debug!(
            "appending to {:?}: {} existing blocks, level {}",
            path,
            entries.len(),
            config.compression_level
        );

        Ok(Self {
            file,
            codec,
            config,
            block_size: superblock.block_size,
            flags: superblock.flags,
            pending: Vec::with_capacity(superblock.block_size as usize * 2),
            entries,
            current_offset: index_offset,
        })
    }

    /// The configuration blocks are compressed with.
    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Buffer `data` and flush complete batches of blocks as they fill up.
    pub fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.pending.extend_from_slice(data);
        let batch = self.block_size as usize * BATCH_BLOCKS;
        while self.pending.len() >= batch {
            let raw: Vec<u8> = self.pending.drain(..batch).collect();
            self.flush_blocks(&raw)?;
        }
        Ok(())
    }

    /// Compress `raw` as consecutive blocks in parallel and write them in order.
    fn flush_blocks(&mut self, raw: &[u8]) -> anyhow::Result<()> {
        let block_size = self.block_size as usize;
        let codec = &self.codec;
        let config = &self.config;
        let first_index = self.entries.len();

        let blocks: Vec<StoredBlock> = raw
            .par_chunks(block_size)
            .enumerate()
            .map_init(
                || (codec.init(block_size, true), vec![0u8; block_size]),
                |(ctx, scratch), (i, chunk)| {
                    compress_block(ctx, scratch, config, chunk).with_context(|| {
                        format!(
                            "{}: block {} ({} bytes, block size {})",
                            codec.name(),
                            first_index + i,
                            chunk.len(),
                            block_size
                        )
                    })
                },
            )
            .collect::<anyhow::Result<_>>()?;

        for block in blocks {
            self.write_block(block)?;
        }
        Ok(())
    }

    fn write_block(&mut self, block: StoredBlock) -> anyhow::Result<()> {
        let checksum = xxh3_64(&block.data);
        self.file.write_all(&block.data)?;

        let stored_len = block.data.len() as u32;
        self.entries.push(BlockEntry {
            offset: self.current_offset,
            stored_len,
            raw_len: block.raw_len,
            checksum,
            flags: if block.uncompressed { BLOCK_UNCOMPRESSED } else { 0 },
        });
        self.current_offset += stored_len as u64;
        Ok(())
    }

    /// Flush remaining buffered data, write the block index + footer, and seal
    /// the image by writing the final superblock.
    ///
    /// Returns the total number of blocks in the image.
    pub fn finish(mut self) -> anyhow::Result<u64> {
        if !self.pending.is_empty() {
            let remaining = std::mem::take(&mut self.pending);
            self.flush_blocks(&remaining)?;
        }

        // ── Block index ────────────────────────────────────────────────────
        let index_offset = self.current_offset;
        for entry in &self.entries {
            self.file.write_all(&entry.to_bytes())?;
        }
        self.current_offset += self.entries.len() as u64 * BLOCK_ENTRY_SIZE;

        // ── Footer: 8-byte u64 LE offset of block index start ──────────────
        self.file.write_all(&index_offset.to_le_bytes())?;

        // ── Seek back to 0 and write the real superblock ───────────────────
        let block_count = self.entries.len() as u64;
        let superblock = Superblock {
            version: FORMAT_VERSION,
            compression_id: self.codec.id(),
            block_size: self.block_size,
            block_count,
            flags: self.flags,
        };
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&superblock.to_bytes())?;
        self.file.flush()?;

        Ok(block_count)
    }
}

/// Compress one block with this worker's context, falling back to storing it
/// raw when the codec signals it does not fit or it would not shrink.
fn compress_block(
    ctx: &mut Result<Box<dyn CompressContext>, CodecError>,
    scratch: &mut [u8],
    config: &Configuration,
    raw: &[u8],
) -> anyhow::Result<StoredBlock> {
    let ctx = match ctx {
        Ok(ctx) => ctx,
        Err(e) => anyhow::bail!("no compression context: {}", e),
    };

    let raw_len = raw.len() as u32;
    match ctx.compress(config, scratch, raw)? {
        CompressOutcome::Compressed(n) if n < raw.len() => Ok(StoredBlock {
            data: scratch[..n].to_vec(),
            raw_len,
            uncompressed: false,
        }),
        outcome => {
            log::debug!("storing {}-byte block uncompressed ({:?})", raw.len(), outcome);
            Ok(StoredBlock {
                data: raw.to_vec(),
                raw_len,
                uncompressed: true,
            })
        }
    }
}
