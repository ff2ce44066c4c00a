/// Magic bytes for blockfs version 1 images.
pub const MAGIC: &[u8; 8] = b"BLKFS1\n\x00";

/// Fixed size of the superblock in bytes.
///   magic[8] + version:u16 + compression_id:u16 + block_size:u32
///   + block_count:u64 + flags:u64 + reserved[8]
///   = 8 + 2 + 2 + 4 + 8 + 8 + 8 = 40
pub const SUPERBLOCK_SIZE: u64 = 40;

/// Size of each BlockEntry in the block index, in bytes.
///   offset:u64 + stored_len:u32 + raw_len:u32
///   + checksum:u64 + flags:u16 + _pad[6]
///   = 8 + 4 + 4 + 8 + 2 + 6 = 32
pub const BLOCK_ENTRY_SIZE: u64 = 32;

/// Size of the index footer (single u64 offset) in bytes.
pub const FOOTER_SIZE: u64 = 8;

/// Size of the length prefix framing the options record.
pub const OPTIONS_LEN_SIZE: u64 = 2;

/// Default block size: 128 KB.
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;

pub const FORMAT_VERSION: u16 = 1;

// ── Superblock flags ────────────────────────────────────────────────────────

/// A compressor options record follows the superblock.
pub const FLAG_COMP_OPTS: u64 = 1 << 0;

/// Each block carries an xxhash3-64 checksum of its stored bytes.
pub const FLAG_HAS_CHECKSUM: u64 = 1 << 1;

// ── Block flags ─────────────────────────────────────────────────────────────

/// The block is stored verbatim because it did not compress.
pub const BLOCK_UNCOMPRESSED: u16 = 1 << 0;

// ── Superblock ──────────────────────────────────────────────────────────────

/// Decoded representation of the 40-byte superblock.
#[derive(Debug, Clone)]
pub struct Superblock {
    pub version: u16,
    pub compression_id: u16,
    /// Nominal raw bytes per block (the last block may be smaller).
    pub block_size: u32,
    pub block_count: u64,
    pub flags: u64,
}

impl Superblock {
    /// Serialize to exactly `SUPERBLOCK_SIZE` bytes.
    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE as usize] {
        let mut buf = [0u8; SUPERBLOCK_SIZE as usize];
        buf[..8].copy_from_slice(MAGIC);
        buf[8..10].copy_from_slice(&self.version.to_le_bytes());
        buf[10..12].copy_from_slice(&self.compression_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.block_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.block_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.flags.to_le_bytes());
        // reserved[8] stays zero
        buf
    }

    /// Deserialize from `SUPERBLOCK_SIZE` bytes, checking the magic.
    pub fn from_bytes(buf: &[u8; SUPERBLOCK_SIZE as usize]) -> anyhow::Result<Self> {
        if &buf[..8] != MAGIC {
            anyhow::bail!("invalid magic bytes, not a blockfs image");
        }
        Ok(Self {
            version: u16::from_le_bytes(buf[8..10].try_into()?),
            compression_id: u16::from_le_bytes(buf[10..12].try_into()?),
            block_size: u32::from_le_bytes(buf[12..16].try_into()?),
            block_count: u64::from_le_bytes(buf[16..24].try_into()?),
            flags: u64::from_le_bytes(buf[24..32].try_into()?),
        })
    }

    pub fn has_flag(&self, flag: u64) -> bool {
        self.flags & flag != 0
    }
}

// ── Block index entry ───────────────────────────────────────────────────────

/// One entry in the block index.
#[derive(Debug, Clone, Default)]
pub struct BlockEntry {
    /// Byte offset of this block from the start of the image.
    pub offset: u64,
    /// Bytes occupied on disk (compressed length, or raw length if stored raw).
    pub stored_len: u32,
    /// Length of the original uncompressed data in bytes.
    pub raw_len: u32,
    /// xxhash3-64 of the stored bytes.
    pub checksum: u64,
    pub flags: u16,
}

impl BlockEntry {
    pub fn is_uncompressed(&self) -> bool {
        self.flags & BLOCK_UNCOMPRESSED != 0
    }

    /// Serialize to exactly `BLOCK_ENTRY_SIZE` bytes.
    pub fn to_bytes(&self) -> [u8; BLOCK_ENTRY_SIZE as usize] {
        let mut buf = [0u8; BLOCK_ENTRY_SIZE as usize];
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.stored_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.raw_len.to_le_bytes());
        buf[16..24].copy_from_slice(&self.checksum.to_le_bytes());
        buf[24..26].copy_from_slice(&self.flags.to_le_bytes());
        // buf[26..32] = 6 bytes padding, stays zero
        buf
    }

    /// Deserialize from `BLOCK_ENTRY_SIZE` bytes.
    pub fn from_bytes(buf: &[u8; BLOCK_ENTRY_SIZE as usize]) -> anyhow::Result<Self> {
        Ok(Self {
            offset: u64::from_le_bytes(buf[0..8].try_into()?),
            stored_len: u32::from_le_bytes(buf[8..12].try_into()?),
            raw_len: u32::from_le_bytes(buf[12..16].try_into()?),
            checksum: u64::from_le_bytes(buf[16..24].try_into()?),
            flags: u16::from_le_bytes(buf[24..26].try_into()?),
        })
    }
}
