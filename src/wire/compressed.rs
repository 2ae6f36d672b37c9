use super::{
    header::{Header, OpCode},
    util::{begin_message, finish_message, SliceReader},
};
use crate::{
    compression::{decompress_message, Compressor},
    error::{Error, Result},
};

/// Wraps an already framed message in an OP_COMPRESSED envelope. The envelope keeps the original
/// request id and response-to id.
pub fn compress_message(message: &[u8], compressor: &Compressor) -> Result<Vec<u8>> {
    let mut reader = SliceReader::new(message);
    let header = Header::read_from(&mut reader)?;
    let body = reader.remaining();
    let uncompressed_size = i32::try_from(body.len())
        .map_err(|_| Error::invalid_argument("message too large to compress"))?;
    let compressed = compressor.compress(body)?;

    let mut buf = Vec::with_capacity(Header::LENGTH + 9 + compressed.len());
    let start = begin_message(
        &mut buf,
        header.request_id,
        header.response_to,
        OpCode::Compressed,
    );
    buf.extend_from_slice(&(header.op_code as i32).to_le_bytes());
    buf.extend_from_slice(&uncompressed_size.to_le_bytes());
    buf.push(compressor.id());
    buf.extend_from_slice(&compressed);
    finish_message(&mut buf, start)?;
    Ok(buf)
}

/// Unwraps the body of an OP_COMPRESSED envelope, returning the header the original message
/// would have had and its decompressed body. A declared size that would take the original
/// message past `max_len` is rejected before anything is decompressed.
pub(super) fn decompress_body(
    header: &Header,
    body: &[u8],
    max_len: i32,
) -> Result<(Header, Vec<u8>)> {
    let mut reader = SliceReader::new(body);
    let original_op_code = OpCode::from_i32(reader.read_i32()?)?;
    if original_op_code == OpCode::Compressed {
        return Err(Error::wire_protocol(
            "an OP_COMPRESSED message cannot wrap another OP_COMPRESSED message",
        ));
    }
    let uncompressed_size = reader.read_i32()?;
    let uncompressed_size = usize::try_from(uncompressed_size).map_err(|_| {
        Error::wire_protocol(format!("invalid uncompressed size {uncompressed_size}"))
    })?;
    let declared_len = Header::LENGTH.saturating_add(uncompressed_size);
    if usize::try_from(max_len).map_or(true, |max_len| declared_len > max_len) {
        return Err(Error::wire_protocol(format!(
            "Decompressed message length {declared_len} over maximum {max_len}"
        )));
    }
    let compressor_id = reader.read_u8()?;
    let decompressed = decompress_message(reader.remaining(), compressor_id, uncompressed_size)?;

    let length = i32::try_from(Header::LENGTH + decompressed.len())
        .map_err(|_| Error::wire_protocol("decompressed message too large"))?;
    let original_header = Header {
        length,
        request_id: header.request_id,
        response_to: header.response_to,
        op_code: original_op_code,
    };
    Ok((original_header, decompressed))
}
