//! Contains the `Error` and `Result` types used by the executor.


use std::{
    collections::HashSet,
    fmt::{self, Debug},
    sync::Arc,
};

use bson::Document;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const RETRYABLE_CODES: [i32; 11] = [11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001];
const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const NOT_MASTER_CODES: [i32; 2] = [10107, 13435];
const SHUTTING_DOWN_CODES: [i32; 2] = [11600, 91];
const ILLEGAL_OPERATION_CODE: i32 = 20;
const MAX_TIME_MS_EXPIRED_CODE: i32 = 50;
pub(crate) const UNKNOWN_REPL_WRITE_CONCERN_CODE: i32 = 79;
pub(crate) const UNSATISFIABLE_WRITE_CONCERN_CODE: i32 = 100;

/// Network error label. Added to every error caused by a failed socket read or write, or by the
/// caller's context ending during I/O.
pub const NETWORK_ERROR: &str = "NetworkError";
/// Transient transaction error label. This label will be added to a network error that occurs
/// during a transaction that is not committing.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
/// Unknown transaction commit result error label. This label will be added to a network error,
/// write-retryable error, MaxTimeMSExpired error, or write concern failure during a
/// commitTransaction.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";
/// Retryable write error label. This label will be added to an error when the error is
/// write-retryable.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
/// Added by the server when a retried write was not applied at all.
pub const NO_WRITES_PERFORMED: &str = "NoWritesPerformed";

/// The result type for all methods that can return an error in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while executing an operation. The inner [`ErrorKind`] is wrapped in a
/// `Box` to keep the size of `Result` small.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}, source: {source:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,

    labels: HashSet<String>,

    pub(crate) wire_version: Option<i32>,

    #[source]
    pub(crate) source: Option<Box<Error>>,

    pub(crate) server_response: Option<Box<Document>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let mut labels: HashSet<String> = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        if let Some(wc) = kind.get_write_concern_error() {
            labels.extend(wc.labels.clone());
        }
        Self {
            kind: Box::new(kind),
            labels,
            wire_version: None,
            source: None,
            server_response: None,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn wire_protocol(message: impl Into<String>) -> Error {
        ErrorKind::WireProtocol {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_operation(message: impl Into<String>) -> Error {
        ErrorKind::InvalidOperation {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn interrupted(reason: Interruption) -> Error {
        ErrorKind::Interrupted { reason }.into()
    }

    /// Wraps a transport failure in a network error. The original error is kept as the source so
    /// its kind (e.g. a context interruption) remains inspectable.
    pub(crate) fn network(cause: Error) -> Error {
        let kind = match *cause.kind {
            ErrorKind::Io(ref io) => ErrorKind::Io(io.clone()),
            ErrorKind::Interrupted { reason } => ErrorKind::Interrupted { reason },
            ref other => ErrorKind::Io(Arc::new(std::io::Error::other(other.to_string()))),
        };
        let mut error = Error::new(kind, Some([NETWORK_ERROR.to_string()]));
        error.labels.extend(cause.labels.iter().cloned());
        error.with_source(cause)
    }

    /// Whether this error was caused by a socket failure or by the context ending during I/O.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::Interrupted { .. }
        ) || self.labels.contains(NETWORK_ERROR)
    }

    /// Whether this error was caused by the caller's context being cancelled or expiring.
    pub fn is_context_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Interrupted { .. })
            || self
                .source
                .as_ref()
                .map(|source| source.is_context_error())
                .unwrap_or(false)
    }

    pub(crate) fn is_max_time_ms_expired(&self) -> bool {
        self.sdam_code() == Some(MAX_TIME_MS_EXPIRED_CODE)
    }

    /// Whether a read operation should be retried if this error occurs.
    pub fn is_read_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => command_error.is_retryable(),
            _ => false,
        }
    }

    /// Whether a write operation should be retried if this error occurs against a server whose
    /// maximum wire version is `max_wire_version`. 4.4+ servers (wire version 9) mark retryable
    /// errors with a label, so only the label is consulted for them.
    pub fn is_write_retryable(&self, max_wire_version: Option<i32>) -> bool {
        let labelled_server = matches!(max_wire_version, Some(v) if v >= 9);
        match self.kind.as_ref() {
            ErrorKind::WriteCommand(failure) => match failure.write_concern_error {
                Some(ref wc_error) => {
                    if labelled_server {
                        self.contains_label(RETRYABLE_WRITE_ERROR)
                    } else {
                        wc_error.is_retryable()
                    }
                }
                None => false,
            },
            _ if self.is_network_error() => true,
            _ if labelled_server => self.contains_label(RETRYABLE_WRITE_ERROR),
            ErrorKind::Command(command_error) => command_error.is_retryable(),
            _ => false,
        }
    }

    /// Whether this is an "IllegalOperation" error reporting that the storage engine does not
    /// support retryable writes.
    pub fn is_unsupported_storage_engine(&self) -> bool {
        fn matches(code: i32, message: &str) -> bool {
            code == ILLEGAL_OPERATION_CODE
                && message.to_lowercase().starts_with("transaction numbers")
        }

        match self.kind.as_ref() {
            ErrorKind::Command(err) => matches(err.code, &err.message),
            ErrorKind::WriteCommand(failure) => failure
                .write_errors
                .iter()
                .any(|we| matches(we.code, &we.message)),
            _ => false,
        }
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        let label = label.as_ref();
        self.labels().contains(label)
            || self
                .source
                .as_ref()
                .map(|source| source.contains_label(label))
                .unwrap_or(false)
    }

    /// Adds the given label to this error.
    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        let label = label.as_ref().to_string();
        self.labels.insert(label);
    }

    pub(crate) fn with_source<E: Into<Option<Error>>>(mut self, source: E) -> Self {
        self.source = source.into().map(Box::new);
        self
    }

    pub(crate) fn with_wire_version(mut self, wire_version: Option<i32>) -> Self {
        if self.wire_version.is_none() {
            self.wire_version = wire_version;
        }
        self
    }

    /// The full response returned from the server, if this error was produced from one.
    pub fn server_response(&self) -> Option<&Document> {
        self.server_response.as_deref()
    }

    pub(crate) fn with_server_response(mut self, response: &Document) -> Self {
        if self.server_response.is_none() {
            self.server_response = Some(Box::new(response.clone()));
        }
        self
    }

    /// Removes the server's response so that a sensitive reply cannot reach monitoring.
    pub(crate) fn redact(&mut self) {
        self.server_response = None;
        if let Some(ref mut source) = self.source {
            source.redact();
        }
    }

    /// Gets the code from this error for performing SDAM updates, if applicable.
    /// Any codes contained in write errors are ignored.
    pub(crate) fn sdam_code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            ErrorKind::WriteCommand(WriteCommandError {
                write_concern_error: Some(wc_error),
                ..
            }) => Some(wc_error.code),
            ErrorKind::QueryFailure { code, .. } => *code,
            _ => None,
        }
        .or_else(|| self.source.as_ref().and_then(|s| s.sdam_code()))
    }

    /// The message reported by the server, if this error came from a server response.
    pub(crate) fn server_message(&self) -> Option<&str> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.message.as_str()),
            ErrorKind::WriteCommand(WriteCommandError {
                write_concern_error: Some(wc_error),
                ..
            }) => Some(wc_error.message.as_str()),
            ErrorKind::QueryFailure { message, .. } => Some(message.as_str()),
            _ => None,
        }
    }

    /// If this error corresponds to a "not master" error.
    pub fn is_not_master(&self) -> bool {
        if self
            .sdam_code()
            .map(|code| NOT_MASTER_CODES.contains(&code))
            .unwrap_or(false)
        {
            return true;
        }
        if self.is_recovering() {
            return false;
        }
        self.server_message()
            .map(|message| message.contains("not master"))
            .unwrap_or(false)
    }

    /// If this error corresponds to a "node is recovering" error.
    pub fn is_recovering(&self) -> bool {
        let code = self.sdam_code();
        if code
            .map(|code| RECOVERING_CODES.contains(&code))
            .unwrap_or(false)
        {
            return true;
        }
        let has_no_code = matches!(code, None | Some(0));
        self.server_message()
            .map(|message| {
                (has_no_code && message.contains("node is recovering"))
                    || message.contains("not master or secondary")
            })
            .unwrap_or(false)
    }

    /// If this error corresponds to a "node is shutting down" error.
    pub fn is_shutting_down(&self) -> bool {
        self.sdam_code()
            .map(|code| SHUTTING_DOWN_CODES.contains(&code))
            .unwrap_or(false)
    }

    pub(crate) fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_not_master()
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::BsonDeserialization(err)
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::BsonSerialization(err)
    }
}

impl From<bson::raw::Error> for ErrorKind {
    fn from(err: bson::raw::Error) -> Self {
        Self::WireProtocol {
            message: err.to_string(),
        }
    }
}

impl From<bson::document::ValueAccessError> for ErrorKind {
    fn from(err: bson::document::ValueAccessError) -> Self {
        Self::WireProtocol {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// Why an operation stopped waiting on a suspension point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
#[non_exhaustive]
pub enum Interruption {
    /// The caller cancelled the operation.
    #[display("operation was cancelled")]
    Cancelled,

    /// The caller's deadline passed, or would pass before a round trip could complete.
    #[display("operation deadline exceeded")]
    DeadlineExceeded,
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The operation was misconfigured and could never be sent.
    #[error("Invalid operation: {message}")]
    #[non_exhaustive]
    InvalidOperation { message: String },

    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(bson::ser::Error),

    /// The server returned an error to an attempted command.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// A write command reported per-document failures, a write concern failure, or both.
    #[error("Write command failed: {0}")]
    WriteCommand(WriteCommandError),

    /// A legacy OP_REPLY came back with the query failure flag set.
    #[error("Query failure: {message}")]
    #[non_exhaustive]
    QueryFailure {
        message: String,
        code: Option<i32>,
        response: Document,
    },

    /// A document in a write batch exceeded the server's maximum document size.
    #[error("Document of {size} bytes exceeds the maximum document size of {max} bytes")]
    #[non_exhaustive]
    DocumentTooLarge { size: usize, max: usize },

    /// The server's storage engine does not support retryable writes.
    #[error(
        "This MongoDB deployment does not support retryable writes. Please add \
         retryWrites=false to your connection string."
    )]
    UnsupportedStorageEngine,

    /// A legacy OP_REPLY reported that the requested cursor does not exist.
    #[error("Cursor not found")]
    CursorNotFound,

    /// An unacknowledged write was sent and no response will be read.
    #[error("Unacknowledged write")]
    UnacknowledgedWrite,

    /// The session attached to the operation was already ended.
    #[error("Attempted to use a session that has already been ended")]
    SessionEnded,

    /// An explicit session was used against a deployment that does not support sessions.
    #[error("Attempted to use a session on a deployment that does not support sessions")]
    SessionsNotSupported,

    /// A read inside a transaction specified a read preference other than primary.
    #[error("Read preference in a transaction must be primary")]
    NonPrimaryReadPref,

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// Wrapper around [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The caller's context ended while the operation was waiting.
    #[error("Operation interrupted: {reason}")]
    #[non_exhaustive]
    Interrupted { reason: Interruption },

    /// A wire message could not be parsed, or a reply did not have the expected shape.
    #[error("Malformed wire message: {message}")]
    #[non_exhaustive]
    WireProtocol { message: String },

    /// No server suitable for the operation could be selected.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// The server does not support the operation.
    #[error("The server does not support a database operation: {message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    /// The encryption bridge rejected the command or the reply.
    #[error("An error occurred during client-side encryption: {message}")]
    #[non_exhaustive]
    Encryption { message: String },
}

impl ErrorKind {
    fn get_write_concern_error(&self) -> Option<&WriteConcernError> {
        match self {
            ErrorKind::WriteCommand(WriteCommandError {
                write_concern_error,
                ..
            }) => write_concern_error.as_ref(),
            _ => None,
        }
    }
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    #[serde(default)]
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// The topology version reported by the server in the error response.
    #[serde(rename = "topologyVersion", default)]
    pub topology_version: Option<Document>,
}

impl CommandError {
    pub(crate) fn new(code: i32, code_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            code_name: code_name.into(),
            message: message.into(),
            topology_version: None,
        }
    }

    fn is_retryable(&self) -> bool {
        RETRYABLE_CODES.contains(&self.code)
            || self.message.contains("not master")
            || self.message.contains("node is recovering")
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Error code {} ({}): {}",
            self.code, self.code_name, self.message
        )
    }
}

/// An error that occurred due to not being able to satisfy a write concern.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    #[serde(default)]
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(alias = "errmsg", default = "String::new")]
    pub message: String,

    /// A document identifying the write concern setting related to the error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,

    /// Labels categorizing the error.
    #[serde(rename = "errorLabels", default)]
    pub(crate) labels: Vec<String>,
}

impl WriteConcernError {
    /// Whether this failure on its own would make a write retryable.
    pub fn is_retryable(&self) -> bool {
        RETRYABLE_CODES.contains(&self.code)
            || self.message.contains("not master")
            || self.message.contains("node is recovering")
    }
}

/// A per-document failure reported by a write command.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct IndexedWriteError {
    /// Index into the full list of documents that this error corresponds to.
    #[serde(default)]
    pub index: usize,

    /// Identifies the type of write error.
    #[serde(default)]
    pub code: i32,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// A document providing more information about the write error (e.g. details
    /// pertaining to document validation).
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,
}

/// The failures reported by a write command: the per-document errors plus any write concern
/// failure.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct WriteCommandError {
    /// The error(s) that occurred on account of a non write concern failure.
    #[serde(default)]
    pub write_errors: Vec<IndexedWriteError>,

    /// The error that occurred on account of write concern failure.
    pub write_concern_error: Option<WriteConcernError>,
}

impl WriteCommandError {
    pub(crate) fn is_empty(&self) -> bool {
        self.write_errors.is_empty() && self.write_concern_error.is_none()
    }
}

impl fmt::Display for WriteCommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{} write error(s)", self.write_errors.len())?;
        if let Some(ref wc_error) = self.write_concern_error {
            write!(
                fmt,
                ", write concern error {} ({}): {}",
                wc_error.code, wc_error.code_name, wc_error.message
            )?;
        }
        Ok(())
    }
}
