mod compress;
mod compressors;
mod decompress;

use std::{collections::HashSet, sync::LazyLock};

pub use compressors::Compressor;
pub(crate) use decompress::decompress_message;

pub(crate) const NOOP_COMPRESSOR_ID: u8 = 0;
#[cfg(feature = "snappy-compression")]
pub(crate) const SNAPPY_COMPRESSOR_ID: u8 = 1;
#[cfg(feature = "zlib-compression")]
pub(crate) const ZLIB_COMPRESSOR_ID: u8 = 2;
#[cfg(feature = "zstd-compression")]
pub(crate) const ZSTD_COMPRESSOR_ID: u8 = 3;

/// Commands whose bodies are never compressed.
static UNCOMPRESSIBLE_COMMANDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "isMaster",
        "hello",
        "saslStart",
        "saslContinue",
        "getnonce",
        "authenticate",
        "createUser",
        "updateUser",
        "copydbSaslStart",
        "copydbgetnonce",
        "copydb",
    ]
    .into_iter()
    .collect()
});

/// Whether a command with the given name may be sent inside an OP_COMPRESSED envelope.
pub(crate) fn can_compress(command_name: &str) -> bool {
    !UNCOMPRESSIBLE_COMMANDS.contains(command_name)
}
