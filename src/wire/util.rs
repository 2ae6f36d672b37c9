use std::sync::atomic::{AtomicI32, Ordering};

use bson::Document;

use super::header::{Header, OpCode};
use crate::{
    bson_util,
    error::{Error, Result},
};

static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

/// Obtains a new, unique request ID. The counter wraps on overflow.
pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Appends a header with a placeholder length and returns the offset at which the message
/// started, to be passed to [`finish_message`].
pub(super) fn begin_message(
    buf: &mut Vec<u8>,
    request_id: i32,
    response_to: i32,
    op_code: OpCode,
) -> usize {
    let start = buf.len();
    Header {
        length: 0,
        request_id,
        response_to,
        op_code,
    }
    .write_to(buf);
    start
}

/// Writes the final length of the message beginning at `start` into its header.
pub(super) fn finish_message(buf: &mut [u8], start: usize) -> Result<()> {
    let length = i32::try_from(buf.len() - start)
        .map_err(|_| Error::invalid_argument("wire message exceeds the maximum i32 length"))?;
    buf[start..start + 4].copy_from_slice(&length.to_le_bytes());
    Ok(())
}

/// Serializes `string` to bytes and writes them to `buf` with a null terminator appended.
pub(super) fn write_cstring(buf: &mut Vec<u8>, string: &str) -> Result<()> {
    if string.as_bytes().contains(&0) {
        return Err(Error::invalid_argument(format!(
            "cstring {string:?} contains an interior null byte"
        )));
    }
    buf.extend_from_slice(string.as_bytes());
    buf.push(0);
    Ok(())
}

pub(super) fn write_document(buf: &mut Vec<u8>, document: &Document) -> Result<()> {
    document.to_writer(buf)?;
    Ok(())
}

/// A little-endian reader over an in-memory wire message that tracks how much it has consumed.
pub(super) struct SliceReader<'a> {
    bytes: &'a [u8],
    bytes_read: usize,
}

impl<'a> SliceReader<'a> {
    pub(super) fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            bytes_read: 0,
        }
    }

    /// Gets the number of bytes read so far.
    pub(super) fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    pub(super) fn remaining(&self) -> &'a [u8] {
        self.bytes
    }

    pub(super) fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < len {
            return Err(Error::wire_protocol(format!(
                "expected {} more bytes but only {} remain",
                len,
                self.bytes.len()
            )));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        self.bytes_read += len;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub(super) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub(super) fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub(super) fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub(super) fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub(super) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    pub(super) fn read_cstring(&mut self) -> Result<String> {
        let end = self
            .bytes
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::wire_protocol("unterminated cstring"))?;
        let string = std::str::from_utf8(&self.bytes[..end])
            .map_err(|e| Error::wire_protocol(format!("invalid cstring: {e}")))?
            .to_string();
        self.take(end + 1)?;
        Ok(string)
    }

    pub(super) fn read_document(&mut self) -> Result<Document> {
        let (document, length) = bson_util::read_document(self.bytes)?;
        self.take(length)?;
        Ok(document)
    }
}
