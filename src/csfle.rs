//! The bridge to client-side field level encryption.
//!
//! The executor does not encrypt anything itself; it hands outgoing commands and incoming replies
//! to a [`Crypt`] implementation supplied by the caller.

use bson::Document;
use futures_core::future::BoxFuture;

use crate::{context::Context, error::Result};

/// The smallest wire version that supports auto encryption.
pub(crate) const MIN_WIRE_VERSION: i32 = 8;

/// Auto encryption of batched writes splits batches at this size rather than at the server's
/// maximum document size, leaving room for the ciphertext.
pub(crate) const MAX_ENCRYPTED_BATCH_BYTES: usize = 2 * 1024 * 1024;

/// Encrypts commands and decrypts replies on behalf of the executor.
pub trait Crypt: Send + Sync {
    /// Encrypts the fields of `command` that the schema for `db` marks as encrypted.
    fn encrypt<'a>(
        &'a self,
        ctx: &'a Context,
        db: &'a str,
        command: Document,
    ) -> BoxFuture<'a, Result<Document>>;

    /// Decrypts every encrypted value in `reply`.
    fn decrypt<'a>(&'a self, ctx: &'a Context, reply: Document) -> BoxFuture<'a, Result<Document>>;

    /// Whether commands should be sent unencrypted while replies are still decrypted.
    fn bypass_auto_encryption(&self) -> bool {
        false
    }
}
