//! Iteration over the batches of a cursor-returning command.


use std::{sync::Arc, time::Duration};

use bson::{Bson, Document};
use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::{
    context::Context,
    csfle::Crypt,
    error::{Error, ErrorKind, Result},
    event::{command::CommandEvent, EventHandler},
    executor,
    operation::{LegacyKind, Operation, OperationType, Protocol},
    options::ServerApi,
    sdam::{AddressSelector, Deployment, SelectedServer, ServerDescription},
    session::{ClusterClock, Session},
    trace::CURSOR_TRACING_EVENT_TARGET,
};

/// The server codes reporting that a cursor no longer exists.
const CURSOR_NOT_FOUND_CODES: [i32; 2] = [43, 237];

/// The first wire version that accepts `comment` on `getMore`.
const GET_MORE_COMMENT_WIRE_VERSION: i32 = 9;

/// Options that shape how a [`BatchCursor`] fetches its batches.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct CursorOptions {
    /// The number of documents to ask for in each `getMore`.
    pub batch_size: Option<u32>,

    /// The total number of documents the cursor may return. Once reached the cursor is killed.
    pub limit: Option<i64>,

    /// Sent as `maxTimeMS` on each `getMore`. Only meaningful for tailable awaitData cursors.
    pub max_await_time: Option<Duration>,

    /// Attached to each `getMore` on servers that accept it.
    pub comment: Option<Bson>,
}

/// Where a [`BatchCursor`] is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CursorState {
    /// The first batch has not been handed out yet.
    Fresh,

    /// The server holds more results.
    Streaming,

    /// The server has no more results.
    Exhausted,

    /// A `getMore` failed. The cursor may still be open on the server.
    Failed,

    Closed,
}

/// A database and collection pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    /// Splits a full namespace at its first dot.
    fn parse(ns: &str) -> Result<Self> {
        match ns.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self {
                db: db.to_string(),
                coll: coll.to_string(),
            }),
            _ => Err(Error::wire_protocol(format!(
                "invalid cursor namespace {ns:?}"
            ))),
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

#[derive(Debug, Deserialize)]
struct CursorResponse {
    cursor: CursorBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorBody {
    id: i64,
    ns: String,
    #[serde(default)]
    first_batch: Vec<Document>,
    #[serde(default)]
    next_batch: Vec<Document>,
    post_batch_resume_token: Option<Document>,
}

impl CursorBody {
    fn parse(response: Document) -> Result<Self> {
        let response: CursorResponse = bson::from_document(response)?;
        Ok(response.cursor)
    }

    fn into_batch(self) -> Vec<Document> {
        if self.first_batch.is_empty() {
            self.next_batch
        } else {
            self.first_batch
        }
    }
}

/// A server-side cursor, fetched one batch at a time.
///
/// Every `getMore` and the final `killCursors` go through the executor as ordinary operations
/// pinned to the server that created the cursor. The cursor never holds a session; callers pass
/// the one the cursor was created with to [`next`](BatchCursor::next) and
/// [`close`](BatchCursor::close).
pub struct BatchCursor {
    id: i64,
    ns: Namespace,
    server: ServerDescription,
    state: CursorState,
    batch: Vec<Document>,
    post_batch_resume_token: Option<Document>,
    options: CursorOptions,

    /// Documents received so far, counted against the limit.
    returned: i64,

    /// Legacy `system.namespaces` listings report collection names prefixed with the database.
    strip_name_prefix: bool,

    deployment: Arc<dyn Deployment>,
    clock: Option<Arc<ClusterClock>>,
    event_handler: Option<EventHandler<CommandEvent>>,
    crypt: Option<Arc<dyn Crypt>>,
    server_api: Option<ServerApi>,
    max_document_length_bytes: Option<usize>,
}

impl BatchCursor {
    /// Builds a cursor from a reply carrying a `cursor` document, inheriting what later
    /// operations need from `op`.
    pub(crate) fn new(
        response: Document,
        server: ServerDescription,
        op: &Operation<'_>,
        options: CursorOptions,
    ) -> Result<Self> {
        let body = CursorBody::parse(response)?;
        let ns = Namespace::parse(&body.ns)?;
        let strip_name_prefix = op.legacy == LegacyKind::ListCollections
            && Protocol::select(op.legacy, &server) == Protocol::LegacyListCollections;

        let mut cursor = Self {
            id: body.id,
            ns,
            server,
            state: CursorState::Fresh,
            batch: Vec::new(),
            post_batch_resume_token: None,
            options,
            returned: 0,
            strip_name_prefix,
            deployment: op.deployment.clone(),
            clock: op.clock.clone(),
            event_handler: op.event_handler.clone(),
            crypt: op.crypt.clone(),
            server_api: op.server_api.clone(),
            max_document_length_bytes: op.max_document_length_bytes,
        };
        cursor.accept_batch(body);
        Ok(cursor)
    }

    /// The cursor id. Zero once the server has no more results.
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// The server the cursor lives on.
    pub fn server(&self) -> &ServerDescription {
        &self.server
    }

    /// The documents of the current batch.
    pub fn batch(&self) -> &[Document] {
        &self.batch
    }

    /// Takes the documents of the current batch, leaving it empty.
    pub fn take_batch(&mut self) -> Vec<Document> {
        std::mem::take(&mut self.batch)
    }

    /// The latest `postBatchResumeToken` the server reported. Batches without one leave it
    /// unchanged.
    pub fn post_batch_resume_token(&self) -> Option<&Document> {
        self.post_batch_resume_token.as_ref()
    }

    pub fn set_batch_size(&mut self, batch_size: impl Into<Option<u32>>) {
        self.options.batch_size = batch_size.into();
    }

    /// Sets the `maxTimeMS` sent with each `getMore`.
    pub fn set_max_time(&mut self, max_time: impl Into<Option<Duration>>) {
        self.options.max_await_time = max_time.into();
    }

    /// Moves to the next batch, fetching it from the server if needed. Returns whether a
    /// non-empty batch is available.
    pub async fn next(&mut self, ctx: &Context, session: Option<&mut Session>) -> Result<bool> {
        match self.state {
            CursorState::Fresh => {
                self.state = if self.id == 0 {
                    CursorState::Exhausted
                } else {
                    CursorState::Streaming
                };
                if !self.batch.is_empty() {
                    return Ok(true);
                }
            }
            CursorState::Streaming => {}
            CursorState::Exhausted | CursorState::Failed | CursorState::Closed => {
                self.batch.clear();
                return Ok(false);
            }
        }

        self.batch.clear();
        if self.state == CursorState::Exhausted {
            return Ok(false);
        }

        let remaining = self.remaining_limit();
        if remaining.is_some_and(|remaining| remaining <= 0) {
            let result = self.kill_cursors(ctx, session).await;
            self.id = 0;
            self.state = CursorState::Exhausted;
            return result.map(|_| false);
        }

        match self.get_more(ctx, session, remaining).await {
            Ok(body) => {
                self.accept_batch(body);
                if self.id == 0 {
                    self.state = CursorState::Exhausted;
                }
                Ok(!self.batch.is_empty())
            }
            Err(error) => {
                if is_cursor_not_found(&error) {
                    self.id = 0;
                }
                self.state = CursorState::Failed;
                Err(error)
            }
        }
    }

    /// Kills the cursor on the server if it is still open there.
    ///
    /// Closing an exhausted or already closed cursor does nothing. When the cursor already
    /// surfaced a `getMore` failure, a failed `killCursors` is only logged.
    pub async fn close(&mut self, ctx: &Context, session: Option<&mut Session>) -> Result<()> {
        let failed = self.state == CursorState::Failed;
        if matches!(self.state, CursorState::Exhausted | CursorState::Closed) || self.id == 0 {
            self.state = CursorState::Closed;
            self.batch.clear();
            return Ok(());
        }

        self.state = CursorState::Closed;
        self.batch.clear();
        let result = self.kill_cursors(ctx, session).await;
        self.id = 0;
        match result {
            Err(error) => {
                tracing::debug!(
                    target: CURSOR_TRACING_EVENT_TARGET,
                    namespace = %self.ns,
                    error = %error,
                    "failed to kill cursor"
                );
                if failed {
                    Ok(())
                } else {
                    Err(error)
                }
            }
            Ok(()) => Ok(()),
        }
    }

    fn accept_batch(&mut self, body: CursorBody) {
        self.id = body.id;
        if let Some(token) = body.post_batch_resume_token.clone() {
            self.post_batch_resume_token = Some(token);
        }
        let mut batch = body.into_batch();
        if self.strip_name_prefix {
            let prefix = format!("{}.", self.ns.db);
            for document in &mut batch {
                let stripped = document
                    .get_str("name")
                    .ok()
                    .and_then(|name| name.strip_prefix(prefix.as_str()))
                    .map(String::from);
                if let Some(name) = stripped {
                    document.insert("name", name);
                }
            }
        }
        self.returned += batch.len() as i64;
        self.batch = batch;
    }

    fn remaining_limit(&self) -> Option<i64> {
        self.options
            .limit
            .filter(|limit| *limit > 0)
            .map(|limit| limit - self.returned)
    }

    /// The operation shared by `getMore` and `killCursors`: pinned to the cursor's server and
    /// carrying the cursor creator's monitoring, encryption and API settings.
    fn operation<'a>(
        &self,
        session: Option<&'a mut Session>,
        command: impl Fn(&mut Document, &SelectedServer) -> Result<()> + Send + Sync + 'a,
    ) -> Operation<'a> {
        let mut op = Operation::new(self.ns.db.clone(), self.deployment.clone(), command)
            .selector(AddressSelector::new(self.server.address.clone()))
            .session(session)
            .clock(self.clock.clone())
            .event_handler(self.event_handler.clone())
            .crypt(self.crypt.clone())
            .server_api(self.server_api.clone());
        if let Some(max) = self.max_document_length_bytes {
            op = op.max_document_length_bytes(max);
        }
        op
    }

    async fn get_more(
        &mut self,
        ctx: &Context,
        session: Option<&mut Session>,
        remaining: Option<i64>,
    ) -> Result<CursorBody> {
        let batch_size = match (self.options.batch_size.map(i64::from), remaining) {
            (Some(batch_size), Some(remaining)) => Some(batch_size.min(remaining)),
            (batch_size, remaining) => batch_size.or(remaining),
        }
        .filter(|batch_size| *batch_size > 0);
        let batch_size = batch_size
            .map(|batch_size| {
                i32::try_from(batch_size).map_err(|_| {
                    Error::invalid_argument("the batch size must fit into a signed 32-bit integer")
                })
            })
            .transpose()?;

        let id = self.id;
        let coll = self.ns.coll.clone();
        let max_time_ms = self
            .options
            .max_await_time
            .map(|max_time| i64::try_from(max_time.as_millis()).unwrap_or(i64::MAX));
        let comment = self.options.comment.clone();
        let command = move |command: &mut Document, selected: &SelectedServer| {
            command.insert("getMore", id);
            command.insert("collection", coll.as_str());
            if let Some(batch_size) = batch_size {
                command.insert("batchSize", batch_size);
            }
            if let Some(max_time_ms) = max_time_ms {
                command.insert("maxTimeMS", max_time_ms);
            }
            if let Some(ref comment) = comment {
                if selected
                    .server
                    .wire_version_at_least(GET_MORE_COMMENT_WIRE_VERSION)
                {
                    command.insert("comment", comment.clone());
                }
            }
            Ok(())
        };

        let mut op = self
            .operation(session, command)
            .op_type(OperationType::Read)
            .legacy(LegacyKind::GetMore)
            .name("getMore");
        let response = executor::execute(ctx, &mut op).await?;
        CursorBody::parse(response)
    }

    async fn kill_cursors(&self, ctx: &Context, session: Option<&mut Session>) -> Result<()> {
        let id = self.id;
        let coll = self.ns.coll.clone();
        let command = move |command: &mut Document, _: &SelectedServer| {
            command.insert("killCursors", coll.as_str());
            command.insert("cursors", vec![id]);
            Ok(())
        };
        let mut op = self
            .operation(session, command)
            .legacy(LegacyKind::KillCursors)
            .name("killCursors");
        executor::execute(ctx, &mut op).await.map(|_| ())
    }
}

fn is_cursor_not_found(error: &Error) -> bool {
    match *error.kind {
        ErrorKind::CursorNotFound => true,
        ErrorKind::Command(ref command_error) => {
            CURSOR_NOT_FOUND_CODES.contains(&command_error.code)
        }
        _ => false,
    }
}

impl std::fmt::Debug for BatchCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCursor")
            .field("id", &self.id)
            .field("ns", &self.ns)
            .field("server", &self.server.address)
            .field("state", &self.state)
            .field("batch", &self.batch.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Drop for BatchCursor {
    fn drop(&mut self) {
        if self.id != 0 && self.state != CursorState::Closed {
            tracing::debug!(
                target: CURSOR_TRACING_EVENT_TARGET,
                namespace = %self.ns,
                cursorId = self.id,
                "cursor dropped while still open on the server"
            );
        }
    }
}
