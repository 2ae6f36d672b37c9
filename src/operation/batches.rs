use bson::Document;

use crate::{
    bson_util,
    error::{ErrorKind, Result},
};

/// The documents of a write that may be too large to send in one command. The executor sends
/// them in sub-batches sized to the server's limits.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batches {
    /// The command field the documents are sent under, e.g. `documents` for `insert`.
    pub(crate) identifier: String,

    /// Documents not yet sent.
    pub(crate) documents: Vec<Document>,

    /// The sub-batch being sent.
    pub(crate) current: Vec<Document>,

    /// Whether the write stops at its first failed document. Defaults to true.
    pub(crate) ordered: Option<bool>,
}

impl Batches {
    pub fn new(identifier: impl Into<String>, documents: Vec<Document>) -> Self {
        Self {
            identifier: identifier.into(),
            documents,
            current: Vec::new(),
            ordered: None,
        }
    }

    pub fn ordered(mut self, ordered: impl Into<Option<bool>>) -> Self {
        self.ordered = ordered.into();
        self
    }

    pub(crate) fn is_valid(&self) -> bool {
        !self.identifier.is_empty()
    }

    pub(crate) fn is_ordered(&self) -> bool {
        self.ordered.unwrap_or(true)
    }

    /// Documents that have not been sent yet.
    pub fn remaining(&self) -> &[Document] {
        &self.documents
    }

    pub(crate) fn current(&self) -> &[Document] {
        &self.current
    }

    /// Drops the sub-batch that was just sent.
    pub(crate) fn clear_batch(&mut self) {
        self.current.clear();
    }

    /// Moves the next sub-batch out of the pending documents. Does nothing while a sub-batch is
    /// still current, so calling it before every attempt leaves retries on the same documents.
    ///
    /// A sub-batch holds at most `max_count` documents whose encoded sizes add up to no more
    /// than `target_batch_size`, except that a single document larger than the target is sent
    /// on its own. Any document over `max_document_size` fails the whole write.
    pub(crate) fn advance(
        &mut self,
        max_count: usize,
        target_batch_size: usize,
        max_document_size: usize,
    ) -> Result<()> {
        if !self.current.is_empty() || self.documents.is_empty() {
            return Ok(());
        }

        let max_count = max_count.max(1);
        let mut total = 0;
        let mut split = 0;
        for document in &self.documents {
            if split == max_count {
                break;
            }
            let size = bson_util::document_size(document)?;
            if size > max_document_size {
                return Err(ErrorKind::DocumentTooLarge {
                    size,
                    max: max_document_size,
                }
                .into());
            }
            if total + size > target_batch_size {
                break;
            }
            total += size;
            split += 1;
        }

        // An oversized first document goes out alone.
        let split = split.max(1);
        let rest = self.documents.split_off(split);
        self.current = std::mem::replace(&mut self.documents, rest);
        Ok(())
    }
}
