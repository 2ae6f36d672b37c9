use crate::error::{Error, Result};

/// Decompresses `body` with the algorithm named by `compressor_id` and checks the result against
/// the size the envelope declared. No decoder produces more than `uncompressed_size` bytes.
pub(crate) fn decompress_message(
    body: &[u8],
    compressor_id: u8,
    uncompressed_size: usize,
) -> Result<Vec<u8>> {
    let decompressed = decompress(body, compressor_id, uncompressed_size)?;
    if decompressed.len() != uncompressed_size {
        return Err(Error::wire_protocol(format!(
            "The message claims that the uncompressed length is {}, but was computed to be {}.",
            uncompressed_size,
            decompressed.len(),
        )));
    }
    Ok(decompressed)
}

fn decompress(body: &[u8], compressor_id: u8, limit: usize) -> Result<Vec<u8>> {
    if compressor_id == super::NOOP_COMPRESSOR_ID {
        return Ok(body.into());
    }

    #[cfg(feature = "zstd-compression")]
    if compressor_id == super::ZSTD_COMPRESSOR_ID {
        return decompress_zstd(body, limit);
    }

    #[cfg(feature = "zlib-compression")]
    if compressor_id == super::ZLIB_COMPRESSOR_ID {
        return decompress_zlib(body, limit);
    }

    #[cfg(feature = "snappy-compression")]
    if compressor_id == super::SNAPPY_COMPRESSOR_ID {
        return decompress_snappy(body, limit);
    }

    Err(Error::wire_protocol(format!(
        "Unsupported compressor ID: {compressor_id}"
    )))
}

#[cfg(feature = "zstd-compression")]
fn decompress_zstd(body: &[u8], limit: usize) -> Result<Vec<u8>> {
    zstd::bulk::decompress(body, limit).map_err(|error| {
        Error::wire_protocol(format!("Could not decompress message with zstd: {error}"))
    })
}

#[cfg(feature = "zlib-compression")]
fn decompress_zlib(body: &[u8], limit: usize) -> Result<Vec<u8>> {
    use std::io::Read;

    use flate2::read::ZlibDecoder;

    // One byte past the limit is enough to tell an oversized message apart.
    let mut decompressed = Vec::new();
    ZlibDecoder::new(body)
        .take(limit as u64 + 1)
        .read_to_end(&mut decompressed)
        .map_err(|error| {
            Error::wire_protocol(format!("Could not decompress message with zlib: {error}"))
        })?;
    Ok(decompressed)
}

#[cfg(feature = "snappy-compression")]
fn decompress_snappy(body: &[u8], limit: usize) -> Result<Vec<u8>> {
    use snap::raw::{decompress_len, Decoder};

    let len = decompress_len(body).map_err(|error| {
        Error::wire_protocol(format!("Could not decompress message with snappy: {error}"))
    })?;
    if len > limit {
        return Err(Error::wire_protocol(format!(
            "The message claims that the uncompressed length is {limit}, but was computed to be \
             {len}."
        )));
    }
    let mut decoder = Decoder::new();
    decoder.decompress_vec(body).map_err(|error| {
        Error::wire_protocol(format!("Could not decompress message with snappy: {error}"))
    })
}
