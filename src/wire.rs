//! Framing and parsing of MongoDB wire protocol messages.
//!
//! Every function here works on in-memory buffers; reading and writing the bytes is the job of the
//! [`Connection`](crate::sdam::Connection).

mod compressed;
mod get_more;
mod header;
mod kill_cursors;
mod message;
mod query;
mod reply;
mod util;

pub use self::{
    compressed::compress_message,
    get_more::GetMore,
    header::{Header, OpCode},
    kill_cursors::KillCursors,
    message::{DocumentSequence, Message, MessageFlags},
    query::{Query, QueryFlags},
    reply::{Reply, ReplyFlags},
};
pub(crate) use util::next_request_id;

use crate::error::{Error, Result};

/// The largest message accepted when the server has not advertised a limit.
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

/// Any message that can travel over a connection, after decompression.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum WireMessage {
    Message(Message),
    Query(Query),
    GetMore(GetMore),
    KillCursors(KillCursors),
    Reply(Reply),
}

impl WireMessage {
    /// Parses a complete wire message. An OP_COMPRESSED envelope is unwrapped and the message it
    /// carries is returned.
    pub fn read(bytes: &[u8], max_message_size_bytes: Option<i32>) -> Result<Self> {
        let mut reader = util::SliceReader::new(bytes);
        let header = Header::read_from(&mut reader)?;

        let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);
        if header.length > max_len {
            return Err(Error::wire_protocol(format!(
                "Message length {} over maximum {}",
                header.length, max_len
            )));
        }
        if usize::try_from(header.length).ok() != Some(bytes.len()) {
            return Err(Error::wire_protocol(format!(
                "The message header declares {} bytes but {} were received",
                header.length,
                bytes.len()
            )));
        }

        let body = reader.remaining();
        match header.op_code {
            OpCode::Compressed => {
                let (header, body) = compressed::decompress_body(&header, body, max_len)?;
                Self::read_body(&header, &body)
            }
            _ => Self::read_body(&header, body),
        }
    }

    fn read_body(header: &Header, body: &[u8]) -> Result<Self> {
        Ok(match header.op_code {
            OpCode::Message => Self::Message(Message::read_body(header, body)?),
            OpCode::Query => Self::Query(Query::read_body(header, body)?),
            OpCode::GetMore => Self::GetMore(GetMore::read_body(header, body)?),
            OpCode::KillCursors => Self::KillCursors(KillCursors::read_body(header, body)?),
            OpCode::Reply => Self::Reply(Reply::read_body(header, body)?),
            OpCode::Compressed => {
                return Err(Error::wire_protocol(
                    "an OP_COMPRESSED message cannot wrap another OP_COMPRESSED message",
                ))
            }
        })
    }

    /// Serializes the message onto the end of `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Message(message) => message.write_to(buf),
            Self::Query(query) => query.write_to(buf),
            Self::GetMore(get_more) => get_more.write_to(buf),
            Self::KillCursors(kill_cursors) => kill_cursors.write_to(buf),
            Self::Reply(reply) => reply.write_to(buf),
        }
    }

    pub fn request_id(&self) -> i32 {
        match self {
            Self::Message(message) => message.request_id,
            Self::Query(query) => query.request_id,
            Self::GetMore(get_more) => get_more.request_id,
            Self::KillCursors(kill_cursors) => kill_cursors.request_id,
            Self::Reply(reply) => reply.request_id,
        }
    }

    pub fn response_to(&self) -> i32 {
        match self {
            Self::Message(message) => message.response_to,
            Self::Reply(reply) => reply.response_to,
            _ => 0,
        }
    }
}
