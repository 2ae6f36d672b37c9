use super::{
    header::{Header, OpCode},
    util::{begin_message, finish_message, write_cstring, SliceReader},
};
use crate::error::Result;

/// Represents a legacy OP_GET_MORE.
#[derive(Clone, Debug, PartialEq)]
pub struct GetMore {
    pub request_id: i32,
    pub full_collection_name: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

impl GetMore {
    /// Serializes the request onto the end of `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        let start = begin_message(buf, self.request_id, 0, OpCode::GetMore);
        // ZERO, reserved
        buf.extend_from_slice(&0i32.to_le_bytes());
        write_cstring(buf, &self.full_collection_name)?;
        buf.extend_from_slice(&self.number_to_return.to_le_bytes());
        buf.extend_from_slice(&self.cursor_id.to_le_bytes());
        finish_message(buf, start)
    }

    pub(super) fn read_body(header: &Header, body: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(body);
        let _reserved = reader.read_i32()?;
        Ok(Self {
            request_id: header.request_id,
            full_collection_name: reader.read_cstring()?,
            number_to_return: reader.read_i32()?,
            cursor_id: reader.read_i64()?,
        })
    }
}
