pub mod codec;
pub mod error;
pub mod format;
pub mod options;
pub mod reader;
pub mod writer;

pub use codec::{CompressContext, CompressOutcome, Compressor, OptionParse};
pub use error::CodecError;
pub use format::{BlockEntry, Superblock, MAGIC, SUPERBLOCK_SIZE};
pub use options::{Configuration, LevelRecord};
pub use reader::Reader;
pub use writer::Writer;
