use std::io::Write;

use crate::error::CodecError;
use crate::options::Configuration;

/// Result of offering command-line tokens to a compressor's option parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionParse {
    /// The flag was handled; this many tokens *after* the flag were consumed.
    Consumed(usize),
    /// Not one of this compressor's flags. Not an error: the caller should
    /// try its other parsers.
    Unrecognized,
}

/// Result of compressing one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressOutcome {
    /// `dest[..n]` holds the compressed block.
    Compressed(usize),
    /// The compressed form would not fit the destination. The builder should
    /// store the block uncompressed.
    StoreRaw,
}

/// Per-worker compression state returned by [`Compressor::init`].
///
/// A context is owned by exactly one worker and may be reused for any number
/// of blocks that worker processes in sequence. It never carries state from
/// one block to the next. Resources are released on drop.
pub trait CompressContext: Send {
    /// Compress `src` into `dest`, whose length is the capacity limit.
    fn compress(
        &mut self,
        config: &Configuration,
        dest: &mut [u8],
        src: &[u8],
    ) -> Result<CompressOutcome, CodecError>;
}

/// The operation table an image builder dispatches through.
///
/// Each implementation:
/// - Is identified by a stable numeric `id()` stored in the image superblock.
/// - Compresses every block independently and in a single call.
/// - Persists its non-default options into a fixed-size record that is read
///   back before any block of the image is decompressed.
pub trait Compressor: Send + Sync {
    /// Stable compression id stored in the image superblock.
    fn id(&self) -> u16;

    fn name(&self) -> &'static str;

    /// Whether this build can actually compress with the codec.
    fn supported(&self) -> bool {
        true
    }

    /// The configuration used when no options are given or stored.
    fn default_configuration(&self) -> Configuration;

    /// Highest accepted compression level.
    fn max_level(&self) -> i32;

    /// Create a context for one worker. `is_data_block` distinguishes data
    /// blocks from metadata blocks for codecs that tune them differently.
    fn init(
        &self,
        block_size: usize,
        is_data_block: bool,
    ) -> Result<Box<dyn CompressContext>, CodecError>;

    /// Decompress `src` into `dest` and return the decompressed length.
    fn uncompress(
        &self,
        config: &Configuration,
        dest: &mut [u8],
        src: &[u8],
    ) -> Result<usize, CodecError>;

    /// Parse one codec option. `args[0]` is the flag, followed by whatever
    /// tokens remain on the command line.
    fn parse_option(
        &self,
        config: &mut Configuration,
        args: &[String],
    ) -> Result<OptionParse, CodecError>;

    /// Serialized options record, or `None` when `config` is the default and
    /// nothing needs storing.
    fn dump_options(&self, config: &Configuration, block_size: usize) -> Option<Vec<u8>>;

    /// Restore `config` from a stored options record. An empty record resets
    /// to the default, overriding anything given on the command line.
    fn extract_options(
        &self,
        config: &mut Configuration,
        block_size: usize,
        record: &[u8],
    ) -> Result<(), CodecError>;

    /// Print a stored options record for inspection tools. A corrupt record
    /// is reported, not returned; only failures writing to `out` are errors.
    fn display_options(&self, record: &[u8], out: &mut dyn Write) -> std::io::Result<()>;

    /// Help text for the codec's command-line options.
    fn usage(&self) -> String;
}
