use bitflags::bitflags;
use bson::{Array, Document};

use super::{
    header::{Header, OpCode},
    util::{begin_message, finish_message, write_cstring, write_document, SliceReader},
};
use crate::{
    bson_util,
    error::{Error, Result},
};

/// Represents an OP_MSG wire protocol operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// The payload type 0 section.
    pub document_payload: Document,
    /// The payload type 1 sections.
    pub document_sequences: Vec<DocumentSequence>,
    pub response_to: i32,
    pub flags: MessageFlags,
    pub checksum: Option<u32>,
    pub request_id: i32,
}

/// A named sequence of documents streamed outside the body document.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<Document>,
}

impl Message {
    pub(crate) fn new(request_id: i32, flags: MessageFlags, document_payload: Document) -> Self {
        Self {
            document_payload,
            document_sequences: Vec::new(),
            response_to: 0,
            flags,
            checksum: None,
            request_id,
        }
    }

    /// Gets this message's command as a Document, with every document sequence inlined as an
    /// array under its identifier.
    pub fn get_command_document(&self) -> Document {
        let mut command = self.document_payload.clone();
        for document_sequence in &self.document_sequences {
            let documents: Array = document_sequence
                .documents
                .iter()
                .cloned()
                .map(Into::into)
                .collect();
            command.insert(document_sequence.identifier.clone(), documents);
        }
        command
    }

    /// Serializes the message onto the end of `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        let start = begin_message(buf, self.request_id, self.response_to, OpCode::Message);
        buf.extend_from_slice(&self.flags.bits().to_le_bytes());
        self.write_sections(buf)?;
        if let Some(checksum) = self.checksum {
            buf.extend_from_slice(&checksum.to_le_bytes());
        }
        finish_message(buf, start)
    }

    fn write_sections(&self, buf: &mut Vec<u8>) -> Result<()> {
        // Payload type 0
        buf.push(0);
        write_document(buf, &self.document_payload)?;

        for document_sequence in &self.document_sequences {
            // Payload type 1
            buf.push(1);
            let size_offset = buf.len();
            buf.extend_from_slice(&[0; 4]);
            write_cstring(buf, &document_sequence.identifier)?;
            for document in &document_sequence.documents {
                write_document(buf, document)?;
            }
            let size = i32::try_from(buf.len() - size_offset).map_err(|_| {
                Error::invalid_argument("document sequence exceeds the maximum i32 length")
            })?;
            buf[size_offset..size_offset + 4].copy_from_slice(&size.to_le_bytes());
        }

        Ok(())
    }

    /// Parses the body of an OP_MSG whose header has already been read.
    pub(super) fn read_body(header: &Header, body: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(body);
        let flags = MessageFlags::from_bits_truncate(reader.read_u32()?);
        let checksum_len = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            4
        } else {
            0
        };
        let sections_len = body
            .len()
            .checked_sub(4 + checksum_len)
            .ok_or_else(|| Error::wire_protocol("OP_MSG is too short to hold its checksum"))?;

        let mut sections = SliceReader::new(reader.read_bytes(sections_len)?);
        let mut document_payload = None;
        let mut document_sequences = Vec::new();
        while !sections.is_empty() {
            match MessageSection::read(&mut sections)? {
                MessageSection::Document(document) => {
                    if document_payload.is_some() {
                        return Err(Error::wire_protocol(
                            "an OP_MSG must contain exactly one payload type 0 section",
                        ));
                    }
                    document_payload = Some(document);
                }
                MessageSection::Sequence(document_sequence) => {
                    document_sequences.push(document_sequence)
                }
            }
        }

        let checksum = if checksum_len > 0 {
            Some(reader.read_u32()?)
        } else {
            None
        };

        Ok(Self {
            document_payload: document_payload.ok_or_else(|| {
                Error::wire_protocol("an OP_MSG must contain exactly one payload type 0 section")
            })?,
            document_sequences,
            response_to: header.response_to,
            flags,
            checksum,
            request_id: header.request_id,
        })
    }
}

bitflags! {
    /// Represents the bitwise flags for an OP_MSG.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// Represents a section of an OP_MSG.
#[derive(Debug)]
enum MessageSection {
    Document(Document),
    Sequence(DocumentSequence),
}

impl MessageSection {
    fn read(reader: &mut SliceReader<'_>) -> Result<Self> {
        let payload_type = reader.read_u8()?;

        if payload_type == 0 {
            return Ok(MessageSection::Document(reader.read_document()?));
        }
        if payload_type != 1 {
            return Err(Error::wire_protocol(format!(
                "unknown OP_MSG section payload type {payload_type}"
            )));
        }

        let size = reader.read_i32()?;
        let contents_len = usize::try_from(size)
            .ok()
            .and_then(|size| size.checked_sub(4))
            .ok_or_else(|| Error::wire_protocol(format!("invalid section size {size}")))?;
        let mut contents = SliceReader::new(reader.read_bytes(contents_len)?);
        let identifier = contents.read_cstring()?;
        let documents = bson_util::read_documents(contents.remaining())?;

        Ok(MessageSection::Sequence(DocumentSequence {
            identifier,
            documents,
        }))
    }
}
