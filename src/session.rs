//! Logical sessions: the per-caller state that makes retryable writes, transactions and causal
//! consistency possible.

mod cluster_time;

use bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Timestamp};
use typed_builder::TypedBuilder;
use uuid::Uuid;

pub use cluster_time::{ClusterClock, ClusterTime};
pub(crate) use cluster_time::max_cluster_time;
use crate::{
    concern::{ReadConcern, WriteConcern},
    error::{Error, ErrorKind, Result},
    sdam::{Connection, ServerAddress, ServerDescription, ServerType},
    selection_criteria::ReadPreference,
};

/// Options for a [`Session`].
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct SessionOptions {
    /// Whether reads in this session observe the effects of every earlier operation in it.
    /// Defaults to true unless `snapshot` is set.
    pub causal_consistency: Option<bool>,

    /// Whether reads in this session read from a single point in time.
    pub snapshot: Option<bool>,

    /// Defaults for every transaction started on this session.
    pub default_transaction_options: Option<TransactionOptions>,
}

/// Options that apply to every command in a transaction.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct TransactionOptions {
    pub read_concern: Option<ReadConcern>,
    pub write_concern: Option<WriteConcern>,
    pub read_preference: Option<ReadPreference>,
}

/// Where a session is in its transaction lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    None,
    /// `start_transaction` was called but no command has been sent yet.
    Starting,
    InProgress,
    /// `commitTransaction` is being sent, possibly for the second time.
    Committing,
    /// `abortTransaction` is being sent.
    Aborting,
    Committed,
    Aborted,
}

/// What a running transaction is bound to.
pub(crate) enum TransactionPin {
    /// A sharded transaction must keep talking to the mongos that started it.
    Mongos(ServerAddress),
    /// A load balanced transaction must keep using the connection that started it.
    Connection(Box<dyn Connection>),
}

impl std::fmt::Debug for TransactionPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mongos(address) => f.debug_tuple("Mongos").field(address).finish(),
            Self::Connection(conn) => f.debug_tuple("Connection").field(&conn.id()).finish(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) options: TransactionOptions,
    pub(crate) pinned: Option<TransactionPin>,
    pub(crate) recovery_token: Option<Document>,
}

/// A logical session. Operations borrow it mutably for their whole execution, so a session can
/// never be used by two operations at once.
#[derive(Debug)]
pub struct Session {
    id: Document,
    explicit: bool,
    options: SessionOptions,
    txn_number: i64,
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    snapshot_time: Option<Timestamp>,
    pub(crate) transaction: Transaction,
    pub(crate) retry_write: bool,
    dirty: bool,
    ended: bool,
}

impl Session {
    /// Starts a session on behalf of a caller.
    pub fn new(options: impl Into<Option<SessionOptions>>) -> Self {
        Self::with_explicit(options.into().unwrap_or_default(), true)
    }

    /// Starts a session the executor may silently drop when the server doesn't support sessions.
    pub fn implicit() -> Self {
        Self::with_explicit(SessionOptions::default(), false)
    }

    fn with_explicit(options: SessionOptions, explicit: bool) -> Self {
        let id = doc! {
            "id": Binary {
                subtype: BinarySubtype::Uuid,
                bytes: Uuid::new_v4().as_bytes().to_vec(),
            }
        };
        Self {
            id,
            explicit,
            options,
            txn_number: 0,
            cluster_time: None,
            operation_time: None,
            snapshot_time: None,
            transaction: Transaction::default(),
            retry_write: false,
            dirty: false,
            ended: false,
        }
    }

    /// The `lsid` document sent with every command in this session.
    pub fn id(&self) -> &Document {
        &self.id
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    pub fn txn_number(&self) -> i64 {
        self.txn_number
    }

    pub(crate) fn increment_txn_number(&mut self) {
        self.txn_number += 1;
    }

    /// The latest cluster time this session has observed.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// Moves this session's cluster time forward to `to`. Earlier times are ignored.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time.as_ref().map(|ct| ct < to).unwrap_or(true) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// The operation time of the latest response in this session.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Moves this session's operation time forward to `ts`. Earlier times are ignored.
    pub fn advance_operation_time(&mut self, ts: Timestamp) {
        let later = match self.operation_time {
            Some(current) => (ts.time, ts.increment) > (current.time, current.increment),
            None => true,
        };
        if later {
            self.operation_time = Some(ts);
        }
    }

    pub fn causal_consistency(&self) -> bool {
        self.options
            .causal_consistency
            .unwrap_or(!self.is_snapshot())
    }

    pub fn is_snapshot(&self) -> bool {
        self.options.snapshot.unwrap_or(false)
    }

    /// The time all snapshot reads in this session read at, once the first one has fixed it.
    pub fn snapshot_time(&self) -> Option<Timestamp> {
        self.snapshot_time
    }

    /// Whether a network error has occurred while using this session.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Ends the session. Any later operation using it fails.
    pub fn end(&mut self) {
        self.unpin();
        self.ended = true;
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.transaction.state
    }

    /// The recovery token of the current sharded transaction.
    pub fn recovery_token(&self) -> Option<&Document> {
        self.transaction.recovery_token.as_ref()
    }

    /// Starts a transaction. The next command sent in this session carries `startTransaction`.
    pub fn start_transaction(&mut self, options: impl Into<Option<TransactionOptions>>) -> Result<()> {
        if self.ended {
            return Err(ErrorKind::SessionEnded.into());
        }
        if self.is_snapshot() {
            return Err(Error::invalid_operation(
                "Transactions are not supported in snapshot sessions",
            ));
        }
        if self.dirty {
            return Err(Error::invalid_operation(
                "cannot start a transaction on a session that saw a network error",
            ));
        }
        match self.transaction.state {
            TransactionState::Starting
            | TransactionState::InProgress
            | TransactionState::Committing
            | TransactionState::Aborting => {
                return Err(Error::invalid_operation("transaction already in progress"));
            }
            TransactionState::None | TransactionState::Committed | TransactionState::Aborted => {}
        }

        let defaults = self
            .options
            .default_transaction_options
            .clone()
            .unwrap_or_default();
        let options = options.into().unwrap_or_default();
        let options = TransactionOptions {
            read_concern: options.read_concern.or(defaults.read_concern),
            write_concern: options.write_concern.or(defaults.write_concern),
            read_preference: options.read_preference.or(defaults.read_preference),
        };
        if let Some(ref wc) = options.write_concern {
            if !wc.is_acknowledged() {
                return Err(Error::invalid_operation(
                    "transactions do not support unacknowledged write concerns",
                ));
            }
        }

        self.unpin();
        self.increment_txn_number();
        self.transaction = Transaction {
            state: TransactionState::Starting,
            options,
            pinned: None,
            recovery_token: None,
        };
        Ok(())
    }

    /// Marks the transaction as committing. Call before executing `commitTransaction`.
    pub fn begin_commit(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::Starting
            | TransactionState::InProgress
            | TransactionState::Committing
            | TransactionState::Committed => {
                self.transaction.state = TransactionState::Committing;
                Ok(())
            }
            _ => Err(Error::invalid_operation("no transaction started")),
        }
    }

    /// Marks the transaction as aborting. Call before executing `abortTransaction`.
    pub fn begin_abort(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::Starting | TransactionState::InProgress => {
                self.transaction.state = TransactionState::Aborting;
                Ok(())
            }
            _ => Err(Error::invalid_operation("no transaction in progress")),
        }
    }

    /// Records the outcome of a commit or abort.
    pub fn complete_transaction(&mut self) {
        self.transaction.state = match self.transaction.state {
            TransactionState::Committing => TransactionState::Committed,
            TransactionState::Aborting => {
                self.unpin();
                TransactionState::Aborted
            }
            other => other,
        };
    }

    pub(crate) fn transaction_starting(&self) -> bool {
        self.transaction.state == TransactionState::Starting
    }

    /// Whether a transaction is active: starting, in progress, committing or aborting.
    pub(crate) fn transaction_running(&self) -> bool {
        matches!(
            self.transaction.state,
            TransactionState::Starting
                | TransactionState::InProgress
                | TransactionState::Committing
                | TransactionState::Aborting
        )
    }

    pub(crate) fn committing(&self) -> bool {
        self.transaction.state == TransactionState::Committing
    }

    pub(crate) fn aborting(&self) -> bool {
        self.transaction.state == TransactionState::Aborting
    }

    /// Advances the transaction state as a command is sent to `server`. The first command of a
    /// sharded transaction pins the session to the mongos it went to; the first command after a
    /// finished transaction clears it.
    pub(crate) fn apply_command(&mut self, server: &ServerDescription) {
        match self.transaction.state {
            TransactionState::Starting => {
                self.transaction.state = TransactionState::InProgress;
                if server.server_type == ServerType::Mongos {
                    self.pin_mongos(server.address.clone());
                }
            }
            TransactionState::Committed | TransactionState::Aborted => {
                self.unpin();
                self.transaction = Transaction::default();
            }
            _ => {}
        }
    }

    pub(crate) fn pinned_mongos(&self) -> Option<&ServerAddress> {
        match self.transaction.pinned {
            Some(TransactionPin::Mongos(ref address)) => Some(address),
            _ => None,
        }
    }

    pub(crate) fn pin_mongos(&mut self, address: ServerAddress) {
        self.transaction.pinned = Some(TransactionPin::Mongos(address));
    }

    pub(crate) fn take_pinned_connection(&mut self) -> Option<Box<dyn Connection>> {
        match self.transaction.pinned.take() {
            Some(TransactionPin::Connection(conn)) => Some(conn),
            other => {
                self.transaction.pinned = other;
                None
            }
        }
    }

    pub(crate) fn pin_connection(&mut self, conn: Box<dyn Connection>) {
        self.transaction.pinned = Some(TransactionPin::Connection(conn));
    }

    /// Releases whatever the transaction was pinned to.
    pub fn unpin(&mut self) {
        if let Some(TransactionPin::Connection(mut conn)) = self.transaction.pinned.take() {
            if let Err(error) = conn.close() {
                tracing::debug!(
                    target: crate::trace::COMMAND_TRACING_EVENT_TARGET,
                    driverConnectionId = conn.id(),
                    error = %error,
                    "failed to close unpinned connection"
                );
            }
        }
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.transaction.pinned.is_some()
    }

    /// Lifts the gossiped fields out of a response: the cluster time, the operation time, the
    /// recovery token, and for snapshot reads the snapshot time.
    pub(crate) fn update_from_response(&mut self, response: &Document, command_name: &str) {
        if let Some(cluster_time) = ClusterTime::from_response(response) {
            self.advance_cluster_time(&cluster_time);
        }
        if let Ok(operation_time) = response.get_timestamp("operationTime") {
            self.advance_operation_time(operation_time);
        }
        if let Ok(recovery_token) = response.get_document("recoveryToken") {
            self.transaction.recovery_token = Some(recovery_token.clone());
        }
        if self.is_snapshot()
            && self.snapshot_time.is_none()
            && matches!(command_name, "find" | "aggregate" | "distinct")
        {
            let at_cluster_time = response
                .get_document("cursor")
                .ok()
                .and_then(|cursor| cursor.get("atClusterTime"))
                .or_else(|| response.get("atClusterTime"));
            if let Some(Bson::Timestamp(ts)) = at_cluster_time {
                self.snapshot_time = Some(*ts);
            }
        }
    }

    /// The effective transaction options for the running transaction.
    pub(crate) fn transaction_options(&self) -> &TransactionOptions {
        &self.transaction.options
    }

    pub(crate) fn set_transaction_write_concern(&mut self, write_concern: WriteConcern) {
        self.transaction.options.write_concern = Some(write_concern);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.unpin();
    }
}
