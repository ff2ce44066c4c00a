/// Build-time tunables of a compressor.
///
/// Set once while parsing the command line (or once while loading the options
/// record of an image being appended to), then only read while blocks are
/// compressed in parallel. Every plugin operation takes it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configuration {
    pub compression_level: i32,
}

impl Configuration {
    pub fn with_level(compression_level: i32) -> Self {
        Self { compression_level }
    }
}

/// On-disk form of a [`Configuration`] for codecs whose only tunable is a
/// compression level: one little-endian `i32`.
pub struct LevelRecord;

impl LevelRecord {
    pub const SIZE: usize = 4;

    pub fn encode(config: &Configuration) -> Vec<u8> {
        config.compression_level.to_le_bytes().to_vec()
    }

    /// Decode the leading record of `buf`. Trailing bytes are ignored; a
    /// buffer shorter than [`Self::SIZE`] yields `None`.
    pub fn decode(buf: &[u8]) -> Option<Configuration> {
        let raw: [u8; Self::SIZE] = buf.get(..Self::SIZE)?.try_into().ok()?;
        Some(Configuration::with_level(i32::from_le_bytes(raw)))
    }
}
