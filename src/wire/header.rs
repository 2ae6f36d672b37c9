use super::util::SliceReader;
use crate::error::{Error, Result};

/// The wire protocol op codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpCode {
    Reply = 1,
    Query = 2004,
    GetMore = 2005,
    KillCursors = 2007,
    Compressed = 2012,
    Message = 2013,
}

impl OpCode {
    /// Attempt to infer the op code based on the numeric value.
    pub(crate) fn from_i32(i: i32) -> Result<Self> {
        match i {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2007 => Ok(OpCode::KillCursors),
            2012 => Ok(OpCode::Compressed),
            2013 => Ok(OpCode::Message),
            other => Err(Error::wire_protocol(format!(
                "Invalid wire protocol opcode: {other}"
            ))),
        }
    }
}

/// The header for any wire protocol message.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Header {
    pub length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl Header {
    pub(crate) const LENGTH: usize = 4 * std::mem::size_of::<i32>();

    /// Serializes the header onto the end of `buf`.
    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.response_to.to_le_bytes());
        buf.extend_from_slice(&(self.op_code as i32).to_le_bytes());
    }

    /// Deserializes a header from the front of `reader`.
    pub(super) fn read_from(reader: &mut SliceReader<'_>) -> Result<Self> {
        let length = reader.read_i32()?;
        let request_id = reader.read_i32()?;
        let response_to = reader.read_i32()?;
        let op_code = OpCode::from_i32(reader.read_i32()?)?;
        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }
}
