use crate::{compression::Compressor, error::Result};

impl Compressor {
    /// Compresses the body of a wire message (everything after the header).
    pub(crate) fn compress(&self, body: &[u8]) -> Result<Vec<u8>> {
        let result = match *self {
            #[cfg(feature = "zstd-compression")]
            Self::Zstd { level } => compress_zstd(level, body),
            #[cfg(feature = "zlib-compression")]
            Self::Zlib { level } => compress_zlib(level, body),
            #[cfg(feature = "snappy-compression")]
            Self::Snappy => compress_snappy(body),
        };

        result.map_err(|error| {
            crate::error::Error::internal(format!(
                "Failed to compress message with {} compression: {}",
                self.name(),
                error
            ))
        })
    }
}

#[cfg(feature = "zstd-compression")]
fn compress_zstd(level: Option<i32>, body: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Write;

    use zstd::{Encoder, DEFAULT_COMPRESSION_LEVEL};

    let level = level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
    let mut encoder = Encoder::new(Vec::new(), level)?;
    encoder.write_all(body)?;
    encoder.finish()
}

#[cfg(feature = "zlib-compression")]
fn compress_zlib(level: Option<u32>, body: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Write;

    use flate2::{write::ZlibEncoder, Compression};

    let level = match level {
        Some(level) => Compression::new(level),
        None => Compression::default(),
    };
    let mut encoder = ZlibEncoder::new(Vec::new(), level);
    encoder.write_all(body)?;
    encoder.finish()
}

#[cfg(feature = "snappy-compression")]
fn compress_snappy(body: &[u8]) -> std::io::Result<Vec<u8>> {
    use snap::raw::Encoder;

    let mut encoder = Encoder::new();
    Ok(encoder.compress_vec(body)?)
}
