use std::convert::TryFrom;

use bson::{Bson, Document};

use crate::error::{Error, Result};

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this Bson is not numeric
/// or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

/// Coerce numeric types into an `i32` if it would be lossless to do so.
pub(crate) fn get_i32(val: &Bson) -> Option<i32> {
    get_int(val).and_then(|i| i32::try_from(i).ok())
}

pub(crate) fn to_bson_array(docs: &[Document]) -> Bson {
    Bson::Array(docs.iter().map(|doc| Bson::Document(doc.clone())).collect())
}

pub(crate) fn first_key(document: &Document) -> Option<&str> {
    document.keys().next().map(String::as_str)
}

/// Serializes a document to its BSON bytes.
pub(crate) fn document_bytes(document: &Document) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    document.to_writer(&mut bytes)?;
    Ok(bytes)
}

/// The encoded size of a document in bytes.
pub(crate) fn document_size(document: &Document) -> Result<usize> {
    Ok(document_bytes(document)?.len())
}

/// Reads a single document from the front of `bytes`, returning it and the number of bytes it
/// occupied.
pub(crate) fn read_document(bytes: &[u8]) -> Result<(Document, usize)> {
    let length = read_document_length(bytes)?;
    let document = Document::from_reader(&bytes[..length])?;
    Ok((document, length))
}

/// Reads every document packed back to back in `bytes`.
pub(crate) fn read_documents(mut bytes: &[u8]) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    while !bytes.is_empty() {
        let (document, length) = read_document(bytes)?;
        documents.push(document);
        bytes = &bytes[length..];
    }
    Ok(documents)
}

fn read_document_length(bytes: &[u8]) -> Result<usize> {
    let prefix: [u8; 4] = bytes
        .get(..4)
        .and_then(|prefix| prefix.try_into().ok())
        .ok_or_else(|| Error::wire_protocol("document length prefix is truncated"))?;
    let length = i32::from_le_bytes(prefix);
    let length = usize::try_from(length)
        .ok()
        .filter(|length| *length >= 5)
        .ok_or_else(|| Error::wire_protocol(format!("invalid document length {length}")))?;
    if length > bytes.len() {
        return Err(Error::wire_protocol(format!(
            "document declares {} bytes but only {} remain",
            length,
            bytes.len()
        )));
    }
    Ok(length)
}
