use bitflags::bitflags;
use bson::Document;

use super::{
    header::{Header, OpCode},
    util::{begin_message, finish_message, write_document, SliceReader},
};
use crate::error::{Error, Result};

/// Represents a legacy OP_REPLY.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub request_id: i32,
    pub response_to: i32,
    pub flags: ReplyFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Document>,
}

impl Reply {
    /// Builds a reply carrying `documents`, with `number_returned` set to match.
    pub fn new(response_to: i32, flags: ReplyFlags, cursor_id: i64, documents: Vec<Document>) -> Self {
        Self {
            request_id: super::next_request_id(),
            response_to,
            flags,
            cursor_id,
            starting_from: 0,
            number_returned: documents.len() as i32,
            documents,
        }
    }

    /// Serializes the reply onto the end of `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        let start = begin_message(buf, self.request_id, self.response_to, OpCode::Reply);
        buf.extend_from_slice(&self.flags.bits().to_le_bytes());
        buf.extend_from_slice(&self.cursor_id.to_le_bytes());
        buf.extend_from_slice(&self.starting_from.to_le_bytes());
        buf.extend_from_slice(&self.number_returned.to_le_bytes());
        for document in &self.documents {
            write_document(buf, document)?;
        }
        finish_message(buf, start)
    }

    /// Parses the body of an OP_REPLY, checking that `numberReturned` matches the number of
    /// documents actually present.
    pub(super) fn read_body(header: &Header, body: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(body);
        let flags = ReplyFlags::from_bits_truncate(reader.read_i32()?);
        let cursor_id = reader.read_i64()?;
        let starting_from = reader.read_i32()?;
        let number_returned = reader.read_i32()?;

        let mut documents = Vec::new();
        while !reader.is_empty() {
            documents.push(reader.read_document()?);
        }

        if usize::try_from(number_returned).ok() != Some(documents.len()) {
            return Err(Error::wire_protocol(format!(
                "OP_REPLY declares {} documents but contains {}",
                number_returned,
                documents.len()
            )));
        }

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }
}

bitflags! {
    /// The response flags of an OP_REPLY.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ReplyFlags: i32 {
        const CURSOR_NOT_FOUND = 0b0000_0001;
        const QUERY_FAILURE    = 0b0000_0010;
        const AWAIT_CAPABLE    = 0b0000_1000;
    }
}
