use thiserror::Error;

/// Failures a compressor plugin can report to the image builder.
///
/// Two outcomes that look like failures are deliberately *not* here:
/// an unrecognised command-line flag ([`OptionParse::Unrecognized`]) and a
/// block that does not fit its destination ([`CompressOutcome::StoreRaw`]).
///
/// [`OptionParse::Unrecognized`]: crate::codec::OptionParse::Unrecognized
/// [`CompressOutcome::StoreRaw`]: crate::codec::CompressOutcome::StoreRaw
#[derive(Error, Debug)]
pub enum CodecError {
    /// A recognised option carried a missing or out-of-range argument.
    #[error("{codec}: {option} {reason}")]
    InvalidParameter {
        codec: &'static str,
        option: String,
        reason: String,
    },

    #[error("{codec}: failed to allocate compression context")]
    ContextAllocation { codec: &'static str },

    /// Any codec failure other than running out of destination space.
    /// `code` is the library's own error code, kept for diagnostics.
    #[error("{codec}: codec error {code} ({name})")]
    Codec {
        codec: &'static str,
        code: usize,
        name: &'static str,
    },

    /// Failure surfaced by the streaming engine, which reports through `io::Error`.
    #[error("{codec}: stream error: {source}")]
    Stream {
        codec: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The stored options record is too short or holds out-of-range values.
    #[error("{codec}: error reading stored compressor options from filesystem: {reason}")]
    CorruptOptions { codec: &'static str, reason: String },

    /// The input does not start with a frame this codec produced.
    #[error("{codec}: stream is not {codec} compressed data")]
    NotCodecOutput { codec: &'static str },

    /// The frame header declared one length but decoding produced another.
    #[error("{codec}: decoded {actual} bytes but frame header declares {declared}")]
    DecodeSizeMismatch {
        codec: &'static str,
        declared: u64,
        actual: u64,
    },

    #[error("{codec}: decoded data exceeds output capacity of {capacity} bytes")]
    OutputOverflow { codec: &'static str, capacity: usize },
}

impl CodecError {
    /// True for errors caused by the persisted options record rather than by
    /// block data.
    pub fn is_corrupt_options(&self) -> bool {
        matches!(self, CodecError::CorruptOptions { .. })
    }
}
