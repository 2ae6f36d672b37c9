//! A single logical request: the command to build, where to send it, and the policies that shape
//! how it is assembled and retried.

mod assemble;
mod batches;
pub(crate) mod legacy;
pub(crate) mod response;
#[cfg(test)]
mod test;

use std::{fmt::Debug, sync::Arc, time::Duration};

use bson::Document;

pub use self::{batches::Batches, legacy::LegacyKind};
pub(crate) use self::{assemble::Assembled, legacy::Protocol};
use crate::{
    concern::{ReadConcern, WriteConcern},
    csfle::Crypt,
    error::{Error, ErrorKind, Result},
    event::{command::CommandEvent, EventHandler},
    options::ServerApi,
    sdam::{Deployment, SelectedServer, ServerDescription, ServerSelector},
    selection_criteria::ReadPreference,
    session::{ClusterClock, Session},
};

/// Appends the elements of a command to the document the executor is assembling. The first
/// element appended must be the command name.
pub type CommandFn<'a> =
    Box<dyn Fn(&mut Document, &SelectedServer) -> Result<()> + Send + Sync + 'a>;

/// Receives every response that is not going to be retried.
pub type ProcessResponseFn<'a> = Box<dyn FnMut(ResponseInfo<'_>) -> Result<()> + Send + 'a>;

/// What a [`ProcessResponseFn`] is told about a response.
#[derive(Debug)]
#[non_exhaustive]
pub struct ResponseInfo<'r> {
    /// The decoded response. `None` when the attempt failed before a reply was read.
    pub response: Option<&'r Document>,

    /// The server the command was sent to.
    pub server: &'r ServerDescription,

    /// The index of the first document of the current batch within the whole write.
    pub current_index: usize,
}

/// The kind of an operation, for the purposes of retryability and read preference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OperationType {
    Write,
    Read,
    /// Never retried.
    #[default]
    Unknown,
}

/// How an operation retries after a retryable failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetryMode {
    /// No retries.
    #[default]
    None,
    /// One retry for the whole operation.
    Once,
    /// One retry for each batch of a split write.
    OncePerCommand,
    /// Retry until the context ends.
    Context,
}

impl RetryMode {
    pub fn is_enabled(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// A logical request against a deployment, built with [`Operation::new`] and the chained setters
/// below, then run with [`crate::executor::execute`].
///
/// An operation borrows its session mutably for its whole lifetime, so two operations can never
/// use the same session at once.
pub struct Operation<'a> {
    pub(crate) command: CommandFn<'a>,
    pub(crate) database: String,
    pub(crate) deployment: Arc<dyn Deployment>,
    pub(crate) process_response: Option<ProcessResponseFn<'a>>,
    pub(crate) selector: Option<Box<dyn ServerSelector + 'a>>,
    pub(crate) read_preference: Option<ReadPreference>,
    pub(crate) read_concern: Option<ReadConcern>,
    pub(crate) min_read_concern_wire_version: i32,
    pub(crate) write_concern: Option<WriteConcern>,
    pub(crate) min_write_concern_wire_version: i32,
    pub(crate) session: Option<&'a mut Session>,
    pub(crate) clock: Option<Arc<ClusterClock>>,
    pub(crate) retry: RetryMode,
    pub(crate) op_type: OperationType,
    pub(crate) batches: Option<Batches>,
    pub(crate) legacy: LegacyKind,
    pub(crate) event_handler: Option<EventHandler<CommandEvent>>,
    pub(crate) crypt: Option<Arc<dyn Crypt>>,
    pub(crate) server_api: Option<ServerApi>,
    pub(crate) is_output_aggregate: bool,
    pub(crate) max_time: Option<Duration>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) omit_timeout_max_time: bool,
    pub(crate) name: Option<String>,
    pub(crate) max_document_length_bytes: Option<usize>,
}

impl<'a> Operation<'a> {
    pub fn new(
        database: impl Into<String>,
        deployment: Arc<dyn Deployment>,
        command: impl Fn(&mut Document, &SelectedServer) -> Result<()> + Send + Sync + 'a,
    ) -> Self {
        Self {
            command: Box::new(command),
            database: database.into(),
            deployment,
            process_response: None,
            selector: None,
            read_preference: None,
            read_concern: None,
            min_read_concern_wire_version: 0,
            write_concern: None,
            min_write_concern_wire_version: 0,
            session: None,
            clock: None,
            retry: RetryMode::None,
            op_type: OperationType::Unknown,
            batches: None,
            legacy: LegacyKind::None,
            event_handler: None,
            crypt: None,
            server_api: None,
            is_output_aggregate: false,
            max_time: None,
            timeout: None,
            omit_timeout_max_time: false,
            name: None,
            max_document_length_bytes: None,
        }
    }

    pub fn process_response(
        mut self,
        process_response: impl FnMut(ResponseInfo<'_>) -> Result<()> + Send + 'a,
    ) -> Self {
        self.process_response = Some(Box::new(process_response));
        self
    }

    /// The selector used for the first selection and every reselection. Defaults to the read
    /// preference followed by a 15ms latency window.
    pub fn selector(mut self, selector: impl ServerSelector + 'a) -> Self {
        self.selector = Some(Box::new(selector));
        self
    }

    pub fn read_preference(mut self, read_preference: impl Into<Option<ReadPreference>>) -> Self {
        self.read_preference = read_preference.into();
        self
    }

    pub fn read_concern(mut self, read_concern: impl Into<Option<ReadConcern>>) -> Self {
        self.read_concern = read_concern.into();
        self
    }

    /// Only attach `readConcern` to servers whose maximum wire version is at least `version`.
    pub fn min_read_concern_wire_version(mut self, version: i32) -> Self {
        self.min_read_concern_wire_version = version;
        self
    }

    pub fn write_concern(mut self, write_concern: impl Into<Option<WriteConcern>>) -> Self {
        self.write_concern = write_concern.into();
        self
    }

    /// Only attach `writeConcern` to servers whose maximum wire version is at least `version`.
    pub fn min_write_concern_wire_version(mut self, version: i32) -> Self {
        self.min_write_concern_wire_version = version;
        self
    }

    pub fn session(mut self, session: impl Into<Option<&'a mut Session>>) -> Self {
        self.session = session.into();
        self
    }

    /// The deployment-wide cluster clock to gossip with.
    pub fn clock(mut self, clock: impl Into<Option<Arc<ClusterClock>>>) -> Self {
        self.clock = clock.into();
        self
    }

    pub fn retry(mut self, retry: RetryMode) -> Self {
        self.retry = retry;
        self
    }

    pub fn op_type(mut self, op_type: OperationType) -> Self {
        self.op_type = op_type;
        self
    }

    pub fn batches(mut self, batches: impl Into<Option<Batches>>) -> Self {
        self.batches = batches.into();
        self
    }

    /// Marks the command as one with a translation for servers that predate it.
    pub fn legacy(mut self, legacy: LegacyKind) -> Self {
        self.legacy = legacy;
        self
    }

    pub fn event_handler(mut self, handler: impl Into<Option<EventHandler<CommandEvent>>>) -> Self {
        self.event_handler = handler.into();
        self
    }

    pub fn crypt(mut self, crypt: impl Into<Option<Arc<dyn Crypt>>>) -> Self {
        self.crypt = crypt.into();
        self
    }

    pub fn server_api(mut self, server_api: impl Into<Option<ServerApi>>) -> Self {
        self.server_api = server_api.into();
        self
    }

    /// Whether this is an aggregate with a `$out` or `$merge` stage, which pre-5.0 servers only
    /// run on primaries.
    pub fn is_output_aggregate(mut self, is_output_aggregate: bool) -> Self {
        self.is_output_aggregate = is_output_aggregate;
        self
    }

    /// The server-side time limit, sent as `maxTimeMS`.
    pub fn max_time(mut self, max_time: impl Into<Option<Duration>>) -> Self {
        self.max_time = max_time.into();
        self
    }

    /// A client-side limit on the whole operation, retries included.
    pub fn timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Stops a `timeout` from being turned into `maxTimeMS`. An explicit `max_time` is still
    /// sent.
    pub fn omit_timeout_max_time(mut self, omit: bool) -> Self {
        self.omit_timeout_max_time = omit;
        self
    }

    /// The operation name used in logs. Replaced by the command name once the command is built.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The length logged commands and replies are truncated to. Defaults to 1000 bytes.
    pub fn max_document_length_bytes(mut self, max: usize) -> Self {
        self.max_document_length_bytes = Some(max);
        self
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// The batches of a split write, in their current state.
    pub fn batches_ref(&self) -> Option<&Batches> {
        self.batches.as_ref()
    }

    /// Checks that the operation can be executed at all.
    pub fn validate(&self) -> Result<()> {
        if self.database.is_empty() {
            return Err(Error::invalid_operation("the database name must be set"));
        }
        if let Some(ref session) = self.session {
            if session.is_ended() {
                return Err(ErrorKind::SessionEnded.into());
            }
            if let Some(ref wc) = self.write_concern {
                if !wc.is_acknowledged() {
                    return Err(Error::invalid_operation(
                        "a session cannot be used with an unacknowledged write concern",
                    ));
                }
            }
        }
        if let Some(ref wc) = self.write_concern {
            wc.validate()?;
        }
        if let Some(ref batches) = self.batches {
            if !batches.is_valid() {
                return Err(Error::invalid_operation(
                    "batches must have a non-empty identifier",
                ));
            }
        }
        Ok(())
    }

    /// Whether commands should go through the encryption bridge.
    pub(crate) fn should_encrypt(&self) -> bool {
        self.crypt
            .as_ref()
            .map(|crypt| !crypt.bypass_auto_encryption())
            .unwrap_or(false)
    }

    pub(crate) fn is_batching(&self) -> bool {
        self.batches
            .as_ref()
            .map(Batches::is_valid)
            .unwrap_or(false)
    }

    /// Hands a response to the process-response hook, if there is one.
    pub(crate) fn run_process_response(
        &mut self,
        response: Option<&Document>,
        server: &ServerDescription,
        current_index: usize,
    ) -> Result<()> {
        match self.process_response {
            Some(ref mut process) => process(ResponseInfo {
                response,
                server,
                current_index,
            }),
            None => Ok(()),
        }
    }
}

impl Debug for Operation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("database", &self.database)
            .field("name", &self.name)
            .field("op_type", &self.op_type)
            .field("retry", &self.retry)
            .field("legacy", &self.legacy)
            .field("read_preference", &self.read_preference)
            .field("read_concern", &self.read_concern)
            .field("write_concern", &self.write_concern)
            .field("batches", &self.batches)
            .finish_non_exhaustive()
    }
}
