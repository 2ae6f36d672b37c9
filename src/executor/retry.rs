use std::sync::Arc;

use crate::{
    error::{Error, NO_WRITES_PERFORMED, RETRYABLE_WRITE_ERROR},
    sdam::{Connection, Server, ServerAddress, TopologyType},
    session::{Session, TransactionState},
    trace::COMMAND_TRACING_EVENT_TARGET,
};

/// How many more attempts an operation may make after the current one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RetryBudget {
    None,
    Limited(u32),
    /// Retries continue until the context ends.
    Unbounded,
}

impl RetryBudget {
    pub(crate) fn has_remaining(self) -> bool {
        match self {
            Self::None | Self::Limited(0) => false,
            Self::Limited(_) | Self::Unbounded => true,
        }
    }

    fn consume(&mut self) {
        if let Self::Limited(n) = self {
            *n = n.saturating_sub(1);
        }
    }
}

/// Everything the executor carries from one attempt to the next.
#[derive(Debug)]
pub(crate) struct ExecutionRetry {
    pub(crate) attempts_remaining: RetryBudget,

    /// The error of the first failed attempt, surfaced if a later server selection fails.
    pub(crate) first_error: Option<Error>,

    /// The last retried error that may have been applied by the server. A later error labelled
    /// `NoWritesPerformed` is replaced by it.
    pub(crate) previous_indefinite_error: Option<Error>,

    pub(crate) last_server_address: Option<ServerAddress>,

    /// Servers to avoid on the next selection.
    pub(crate) deprioritized: Vec<ServerAddress>,
}

impl ExecutionRetry {
    pub(crate) fn new(attempts_remaining: RetryBudget) -> Self {
        Self {
            attempts_remaining,
            first_error: None,
            previous_indefinite_error: None,
            last_server_address: None,
            deprioritized: Vec::new(),
        }
    }

    pub(crate) fn can_retry(&self) -> bool {
        self.attempts_remaining.has_remaining()
    }

    /// Records a failed attempt that is about to be retried.
    pub(crate) fn record_failure(&mut self, error: &Error, topology: TopologyType) {
        self.attempts_remaining.consume();
        if self.first_error.is_none() {
            self.first_error = Some(error.clone());
        }
        let indefinite = !error.contains_label(NO_WRITES_PERFORMED)
            && error.contains_label(RETRYABLE_WRITE_ERROR);
        if self.previous_indefinite_error.is_none() || indefinite {
            self.previous_indefinite_error = Some(error.clone());
        }
        self.deprioritized.clear();
        if let Some(ref address) = self.last_server_address {
            if topology == TopologyType::Sharded {
                self.deprioritized.push(address.clone());
            }
        }
    }

    /// The error to surface once no more attempts will be made. A failure to find a server for
    /// a retry reports the error that caused the retry instead.
    pub(crate) fn surface(&mut self, error: Error) -> Error {
        self.first_error.take().unwrap_or(error)
    }
}

/// A connection checked out for one attempt, and the server it came from.
pub(crate) struct Lease {
    pub(crate) server: Arc<dyn Server>,
    pub(crate) connection: Box<dyn Connection>,

    /// Whether the connection belongs to the session's load balanced transaction.
    pub(crate) pinned: bool,
}

impl Lease {
    /// Gives the connection back: to the session if it still belongs to the session's
    /// transaction, otherwise to its pool.
    pub(crate) fn release(self, session: Option<&mut Session>) {
        let Lease {
            mut connection,
            pinned,
            ..
        } = self;
        if pinned {
            if let Some(session) = session {
                if session.transaction_state() != TransactionState::None {
                    session.pin_connection(connection);
                    return;
                }
            }
        }
        if let Err(error) = connection.close() {
            tracing::debug!(
                target: COMMAND_TRACING_EVENT_TARGET,
                driverConnectionId = connection.id(),
                error = %error,
                "failed to return connection"
            );
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("server", self.server.address())
            .field("connection", &self.connection.id())
            .field("pinned", &self.pinned)
            .finish()
    }
}
