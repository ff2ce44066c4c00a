use std::fmt;
use std::io::Write;
use std::str::FromStr;

use blockfs_core::{
    CodecError, CompressContext, Compressor, Configuration, LevelRecord, OptionParse,
};

use crate::zstd_engine::{self, BlockContext, StreamContext, CODEC};

/// Compression id of zstd in the image superblock.
pub const ZSTD_COMPRESSION: u16 = 6;

/// Level used when none is given on the command line or stored in the image.
pub const ZSTD_DEFAULT_COMPRESSION_LEVEL: i32 = 15;

const LEVEL_OPTION: &str = "-Xcompression-level";

/// Which zstd engine compresses and decompresses blocks.
///
/// Both produce a single self-describing frame per block, so images written
/// in one mode read back in the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZstdMode {
    /// One-shot `ZSTD_compressCCtx` with a per-worker context.
    #[default]
    Block,
    /// `zstd::stream` encoder/decoder, finished within the single call.
    Stream,
}

impl FromStr for ZstdMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(ZstdMode::Block),
            "stream" => Ok(ZstdMode::Stream),
            other => Err(format!("unknown zstd mode '{}', expected block or stream", other)),
        }
    }
}

impl fmt::Display for ZstdMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZstdMode::Block => f.write_str("block"),
            ZstdMode::Stream => f.write_str("stream"),
        }
    }
}

/// Zstandard compressor plugin.
///
/// Its only tunable is the compression level, `-Xcompression-level <n>`
/// with `1 <= n <= zstd_safe::max_c_level()`. A non-default level is stored
/// in the image as a 4-byte little-endian options record.
#[derive(Debug, Clone, Default)]
pub struct ZstdCodec {
    mode: ZstdMode,
}

impl ZstdCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mode: ZstdMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ZstdMode {
        self.mode
    }

    fn level_in_range(&self, level: i32) -> bool {
        (1..=self.max_level()).contains(&level)
    }

    fn invalid_level(&self, reason: String) -> CodecError {
        CodecError::InvalidParameter {
            codec: CODEC,
            option: LEVEL_OPTION.to_string(),
            reason: format!("{}, it should be 1 <= n <= {}", reason, self.max_level()),
        }
    }

    /// Decode and validate a stored record without touching any configuration.
    fn decode_record(&self, record: &[u8]) -> Result<Configuration, CodecError> {
        let stored = LevelRecord::decode(record).ok_or_else(|| CodecError::CorruptOptions {
            codec: CODEC,
            reason: format!(
                "options record is {} bytes, expected {}",
                record.len(),
                LevelRecord::SIZE
            ),
        })?;
        if !self.level_in_range(stored.compression_level) {
            return Err(CodecError::CorruptOptions {
                codec: CODEC,
                reason: format!(
                    "bad compression level {} in compression options structure",
                    stored.compression_level
                ),
            });
        }
        Ok(stored)
    }
}

impl Compressor for ZstdCodec {
    fn id(&self) -> u16 {
        ZSTD_COMPRESSION
    }

    fn name(&self) -> &'static str {
        CODEC
    }

    fn default_configuration(&self) -> Configuration {
        Configuration::with_level(ZSTD_DEFAULT_COMPRESSION_LEVEL)
    }

    fn max_level(&self) -> i32 {
        zstd_safe::max_c_level()
    }

    fn init(
        &self,
        block_size: usize,
        _is_data_block: bool,
    ) -> Result<Box<dyn CompressContext>, CodecError> {
        match self.mode {
            ZstdMode::Block => Ok(Box::new(BlockContext::new()?)),
            ZstdMode::Stream => Ok(Box::new(StreamContext::with_capacity(block_size))),
        }
    }

    fn uncompress(
        &self,
        _config: &Configuration,
        dest: &mut [u8],
        src: &[u8],
    ) -> Result<usize, CodecError> {
        zstd_engine::uncompress(self.mode, dest, src)
    }

    fn parse_option(
        &self,
        config: &mut Configuration,
        args: &[String],
    ) -> Result<OptionParse, CodecError> {
        match args.first() {
            Some(flag) if flag == LEVEL_OPTION => {}
            _ => return Ok(OptionParse::Unrecognized),
        }

        let value = args
            .get(1)
            .ok_or_else(|| self.invalid_level("missing compression level".to_string()))?;
        let level: i32 = value
            .parse()
            .map_err(|_| self.invalid_level(format!("invalid value '{}'", value)))?;
        if !self.level_in_range(level) {
            return Err(self.invalid_level(format!("invalid level {}", level)));
        }

        config.compression_level = level;
        Ok(OptionParse::Consumed(1))
    }

    fn dump_options(&self, config: &Configuration, _block_size: usize) -> Option<Vec<u8>> {
        if *config == self.default_configuration() {
            return None;
        }
        Some(LevelRecord::encode(config))
    }

    fn extract_options(
        &self,
        config: &mut Configuration,
        _block_size: usize,
        record: &[u8],
    ) -> Result<(), CodecError> {
        if record.is_empty() {
            if *config != self.default_configuration() {
                log::debug!(
                    "zstd: image has no stored options, level {} reset to default {}",
                    config.compression_level,
                    ZSTD_DEFAULT_COMPRESSION_LEVEL
                );
            }
            *config = self.default_configuration();
            return Ok(());
        }

        *config = self.decode_record(record)?;
        Ok(())
    }

    fn display_options(&self, record: &[u8], out: &mut dyn Write) -> std::io::Result<()> {
        match self.decode_record(record) {
            Ok(stored) => writeln!(out, "\tcompression-level {}", stored.compression_level),
            Err(e) => {
                log::error!("{}", e);
                Ok(())
            }
        }
    }

    fn usage(&self) -> String {
        format!(
            "\t  {} <compression-level>\n\t\t<compression-level> should be 1 .. {} (default {})\n",
            LEVEL_OPTION,
            self.max_level(),
            ZSTD_DEFAULT_COMPRESSION_LEVEL
        )
    }
}
