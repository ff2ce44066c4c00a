mod zstd_codec;
mod zstd_engine;

pub use zstd_codec::{ZstdCodec, ZstdMode, ZSTD_COMPRESSION, ZSTD_DEFAULT_COMPRESSION_LEVEL};
