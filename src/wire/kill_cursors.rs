use super::{
    header::{Header, OpCode},
    util::{begin_message, finish_message, SliceReader},
};
use crate::error::{Error, Result};

/// Represents a legacy OP_KILL_CURSORS. The server sends no reply to it.
#[derive(Clone, Debug, PartialEq)]
pub struct KillCursors {
    pub request_id: i32,
    pub cursor_ids: Vec<i64>,
}

impl KillCursors {
    /// Serializes the request onto the end of `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        let count = i32::try_from(self.cursor_ids.len())
            .map_err(|_| Error::invalid_argument("too many cursor ids to kill"))?;
        let start = begin_message(buf, self.request_id, 0, OpCode::KillCursors);
        // ZERO, reserved
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(&count.to_le_bytes());
        for id in &self.cursor_ids {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        finish_message(buf, start)
    }

    pub(super) fn read_body(header: &Header, body: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(body);
        let _reserved = reader.read_i32()?;
        let count = reader.read_i32()?;
        let mut cursor_ids = Vec::new();
        for _ in 0..count {
            cursor_ids.push(reader.read_i64()?);
        }
        if !reader.is_empty() {
            return Err(Error::wire_protocol(format!(
                "OP_KILL_CURSORS declares {count} cursors but carries trailing bytes"
            )));
        }
        Ok(Self {
            request_id: header.request_id,
            cursor_ids,
        })
    }
}
