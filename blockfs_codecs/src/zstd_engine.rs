//! Single-block compress/decompress for the zstd compressor.
//!
//! Two engines produce the same kind of output, a single zstd frame whose
//! header declares the content size:
//! - block mode drives a reusable `CCtx` with the one-shot API;
//! - stream mode feeds the block through `zstd::stream` and collects the
//!   finished frame before copying it out.

use std::io::{self, Read, Write};

use blockfs_core::{CodecError, CompressContext, CompressOutcome, Configuration};
use zstd_safe::CCtx;

use crate::zstd_codec::ZstdMode;

pub(crate) const CODEC: &str = "zstd";

// ZSTD_ErrorCode values (zstd_errors.h).
const ERROR_GENERIC: usize = 1;
const ERROR_DST_SIZE_TOO_SMALL: usize = 70;

/// Map a libzstd function result to its `ZSTD_ErrorCode`.
fn error_code(result: zstd_safe::ErrorCode) -> usize {
    0usize.wrapping_sub(result)
}

fn codec_error(result: zstd_safe::ErrorCode) -> CodecError {
    CodecError::Codec {
        codec: CODEC,
        code: error_code(result),
        name: zstd_safe::get_error_name(result),
    }
}

fn stream_error(source: io::Error) -> CodecError {
    CodecError::Stream { codec: CODEC, source }
}

/// Block-mode context: one compression context per worker.
pub(crate) struct BlockContext {
    cctx: CCtx<'static>,
}

impl BlockContext {
    pub(crate) fn new() -> Result<Self, CodecError> {
        CCtx::try_create()
            .map(|cctx| Self { cctx })
            .ok_or(CodecError::ContextAllocation { codec: CODEC })
    }
}

impl CompressContext for BlockContext {
    fn compress(
        &mut self,
        config: &Configuration,
        dest: &mut [u8],
        src: &[u8],
    ) -> Result<CompressOutcome, CodecError> {
        match self.cctx.compress(dest, src, config.compression_level) {
            Ok(n) => Ok(CompressOutcome::Compressed(n)),
            Err(result) => match error_code(result) {
                // Some libzstd releases report GENERIC for a full destination.
                ERROR_DST_SIZE_TOO_SMALL | ERROR_GENERIC => Ok(CompressOutcome::StoreRaw),
                _ => Err(codec_error(result)),
            },
        }
    }
}

/// Stream-mode context. Holds the frame buffer between blocks so its
/// allocation is reused; the contents never outlive one call.
pub(crate) struct StreamContext {
    frame: Vec<u8>,
}

impl StreamContext {
    pub(crate) fn with_capacity(block_size: usize) -> Self {
        Self {
            frame: Vec::with_capacity(zstd_safe::compress_bound(block_size)),
        }
    }
}

impl CompressContext for StreamContext {
    fn compress(
        &mut self,
        config: &Configuration,
        dest: &mut [u8],
        src: &[u8],
    ) -> Result<CompressOutcome, CodecError> {
        let mut frame = std::mem::take(&mut self.frame);
        frame.clear();
        let frame = encode_frame(frame, config.compression_level, src).map_err(stream_error)?;

        let outcome = if frame.len() > dest.len() {
            CompressOutcome::StoreRaw
        } else {
            dest[..frame.len()].copy_from_slice(&frame);
            CompressOutcome::Compressed(frame.len())
        };
        self.frame = frame;
        Ok(outcome)
    }
}

fn encode_frame(buffer: Vec<u8>, level: i32, src: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = zstd::stream::write::Encoder::new(buffer, level)?;
    encoder.set_pledged_src_size(Some(src.len() as u64))?;
    encoder.write_all(src)?;
    encoder.finish()
}

/// Decompress one frame into `dest`, checking the result against the
/// content size the frame header declares.
///
/// Both modes decode every frame in `src`, so trailing frames show up as a
/// declared-length mismatch rather than being dropped.
pub(crate) fn uncompress(
    mode: ZstdMode,
    dest: &mut [u8],
    src: &[u8],
) -> Result<usize, CodecError> {
    let declared = zstd_safe::get_frame_content_size(src)
        .map_err(|_| CodecError::NotCodecOutput { codec: CODEC })?;

    let actual = match mode {
        ZstdMode::Block => zstd_safe::decompress(dest, src).map_err(codec_error)?,
        ZstdMode::Stream => decompress_stream(dest, src)?,
    };
    check_declared_len(declared, actual)
}

fn decompress_stream(dest: &mut [u8], src: &[u8]) -> Result<usize, CodecError> {
    let mut decoder = zstd::stream::read::Decoder::with_buffer(src).map_err(stream_error)?;

    let mut filled = 0;
    while filled < dest.len() {
        match decoder.read(&mut dest[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(stream_error(e)),
        }
    }

    if filled == dest.len() {
        // Destination is full; the input must be finished too.
        let mut rest = [0u8; 1];
        match decoder.read(&mut rest) {
            Ok(0) => {}
            Ok(_) => {
                return Err(CodecError::OutputOverflow {
                    codec: CODEC,
                    capacity: dest.len(),
                })
            }
            Err(e) => return Err(stream_error(e)),
        }
    }

    let unread = decoder.finish().len();
    if unread > 0 {
        return Err(stream_error(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} bytes after the last frame were not consumed", unread),
        )));
    }
    Ok(filled)
}

pub(crate) fn check_declared_len(
    declared: Option<u64>,
    actual: usize,
) -> Result<usize, CodecError> {
    match declared {
        Some(declared) if declared != actual as u64 => Err(CodecError::DecodeSizeMismatch {
            codec: CODEC,
            declared,
            actual: actual as u64,
        }),
        Some(_) => Ok(actual),
        None => {
            log::debug!(
                "zstd: frame does not declare its content size, decoded {} bytes",
                actual
            );
            Ok(actual)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repetitive(len: usize) -> Vec<u8> {
        let pattern = b"block engines compress blocks, ";
        (0..len).map(|i| pattern[i % pattern.len()]).collect()
    }

    fn noise(len: usize, seed: u64) -> Vec<u8> {
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

    fn contexts() -> Vec<(ZstdMode, Box<dyn CompressContext>)> {
        let block: Box<dyn CompressContext> = Box::new(BlockContext::new().unwrap());
        let stream: Box<dyn CompressContext> = Box::new(StreamContext::with_capacity(65536));
        vec![(ZstdMode::Block, block), (ZstdMode::Stream, stream)]
    }

    #[test]
    fn level_19_on_64k_repetitive() {
        let config = Configuration::with_level(19);
        let src = repetitive(65536);
        for (mode, mut ctx) in contexts() {
            let mut compressed = vec![0u8; 65536];
            let n = match ctx.compress(&config, &mut compressed, &src).unwrap() {
                CompressOutcome::Compressed(n) => n,
                other => panic!("{mode:?}: expected compressed output, got {other:?}"),
            };
            assert!(n < 1024, "{mode:?}: {n} bytes is not much smaller than 65536");

            let mut out = vec![0u8; 65536];
            let len = uncompress(mode, &mut out, &compressed[..n]).unwrap();
            assert_eq!(len, 65536);
            assert_eq!(out, src);
        }
    }

    #[test]
    fn incompressible_into_small_dest_is_store_raw() {
        let config = Configuration::with_level(3);
        let src = noise(4096, 7);
        for (mode, mut ctx) in contexts() {
            let mut dest = vec![0u8; 64];
            let outcome = ctx.compress(&config, &mut dest, &src).unwrap();
            assert_eq!(outcome, CompressOutcome::StoreRaw, "{mode:?}");
        }
    }

    #[test]
    fn context_is_reusable_across_blocks() {
        let config = Configuration::with_level(5);
        for (mode, mut ctx) in contexts() {
            for seed in 0..4u64 {
                let mut src = repetitive(3000);
                src.extend(noise(500, seed));
                let mut dest = vec![0u8; 4096];
                let CompressOutcome::Compressed(n) = ctx.compress(&config, &mut dest, &src).unwrap()
                else {
                    panic!("{mode:?}: block {seed} did not compress");
                };
                let mut out = vec![0u8; 4096];
                let len = uncompress(mode, &mut out, &dest[..n]).unwrap();
                assert_eq!(&out[..len], src.as_slice());
            }
        }
    }

    #[test]
    fn empty_block_round_trips() {
        let config = Configuration::with_level(1);
        for (mode, mut ctx) in contexts() {
            let mut dest = vec![0u8; 128];
            let CompressOutcome::Compressed(n) = ctx.compress(&config, &mut dest, &[]).unwrap()
            else {
                panic!("{mode:?}: empty block did not compress");
            };
            let mut out = vec![0u8; 128];
            assert_eq!(uncompress(mode, &mut out, &dest[..n]).unwrap(), 0);
        }
    }

    #[test]
    fn garbage_is_not_codec_output() {
        let mut out = vec![0u8; 1024];
        for mode in [ZstdMode::Block, ZstdMode::Stream] {
            let err = uncompress(mode, &mut out, b"definitely not a zstd frame").unwrap_err();
            assert!(matches!(err, CodecError::NotCodecOutput { .. }), "{mode:?}: {err}");
        }
    }

    #[test]
    fn output_too_small_is_an_error_not_a_short_read() {
        let config = Configuration::with_level(3);
        let src = repetitive(8192);
        let mut ctx = BlockContext::new().unwrap();
        let mut dest = vec![0u8; 8192];
        let CompressOutcome::Compressed(n) = ctx.compress(&config, &mut dest, &src).unwrap() else {
            panic!("did not compress");
        };
        for mode in [ZstdMode::Block, ZstdMode::Stream] {
            let mut out = vec![0u8; 4096];
            assert!(uncompress(mode, &mut out, &dest[..n]).is_err(), "{mode:?}");
        }
    }

    #[test]
    fn concatenated_frames_fail_the_same_in_both_modes() {
        let config = Configuration::with_level(3);
        let first = repetitive(100);
        let second = repetitive(50);
        let mut ctx = BlockContext::new().unwrap();

        let mut src = Vec::new();
        for block in [&first, &second] {
            let mut dest = vec![0u8; 256];
            let CompressOutcome::Compressed(n) = ctx.compress(&config, &mut dest, block).unwrap()
            else {
                panic!("{}-byte block did not compress", block.len());
            };
            src.extend_from_slice(&dest[..n]);
        }

        for mode in [ZstdMode::Block, ZstdMode::Stream] {
            let mut out = vec![0u8; 1024];
            let err = uncompress(mode, &mut out, &src).unwrap_err();
            assert!(
                matches!(
                    err,
                    CodecError::DecodeSizeMismatch { declared: 100, actual: 150, .. }
                ),
                "{mode:?}: {err}"
            );
        }
    }

    #[test]
    fn declared_length_mismatch_is_distinct() {
        let err = check_declared_len(Some(100), 99).unwrap_err();
        assert!(matches!(
            err,
            CodecError::DecodeSizeMismatch { declared: 100, actual: 99, .. }
        ));
        assert_eq!(check_declared_len(Some(42), 42).unwrap(), 42);
        assert_eq!(check_declared_len(None, 17).unwrap(), 17);
    }

    #[test]
    fn error_code_recovers_zstd_enum_value() {
        assert_eq!(error_code(0usize.wrapping_sub(ERROR_DST_SIZE_TOO_SMALL)), 70);
    }
}
