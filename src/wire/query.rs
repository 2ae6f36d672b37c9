use bitflags::bitflags;
use bson::Document;

use super::{
    header::{Header, OpCode},
    util::{begin_message, finish_message, write_cstring, write_document, SliceReader},
};
use crate::error::{Error, Result};

/// Represents a legacy OP_QUERY.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub request_id: i32,
    pub flags: QueryFlags,
    /// `<database>.<collection>`, or `<database>.$cmd` for commands.
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub return_fields_selector: Option<Document>,
}

impl Query {
    /// Serializes the query onto the end of `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        let start = begin_message(buf, self.request_id, 0, OpCode::Query);
        buf.extend_from_slice(&self.flags.bits().to_le_bytes());
        write_cstring(buf, &self.full_collection_name)?;
        buf.extend_from_slice(&self.number_to_skip.to_le_bytes());
        buf.extend_from_slice(&self.number_to_return.to_le_bytes());
        write_document(buf, &self.query)?;
        if let Some(ref selector) = self.return_fields_selector {
            write_document(buf, selector)?;
        }
        finish_message(buf, start)
    }

    pub(super) fn read_body(header: &Header, body: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(body);
        let flags = QueryFlags::from_bits_truncate(reader.read_i32()?);
        let full_collection_name = reader.read_cstring()?;
        let number_to_skip = reader.read_i32()?;
        let number_to_return = reader.read_i32()?;
        let query = reader.read_document()?;
        let return_fields_selector = if reader.is_empty() {
            None
        } else {
            Some(reader.read_document()?)
        };
        if !reader.is_empty() {
            return Err(Error::wire_protocol(format!(
                "OP_QUERY has {} trailing bytes",
                reader.remaining().len()
            )));
        }

        Ok(Self {
            request_id: header.request_id,
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
            return_fields_selector,
        })
    }
}

bitflags! {
    /// The flags of an OP_QUERY.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QueryFlags: i32 {
        const TAILABLE_CURSOR   = 0b0000_0010;
        const SECONDARY_OK      = 0b0000_0100;
        const OPLOG_REPLAY      = 0b0000_1000;
        const NO_CURSOR_TIMEOUT = 0b0001_0000;
        const AWAIT_DATA        = 0b0010_0000;
        const EXHAUST           = 0b0100_0000;
        const PARTIAL           = 0b1000_0000;
    }
}
