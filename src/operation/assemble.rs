//! Turns an [`Operation`] into the wire message for one attempt. The steps always run in the
//! same order: command, batch, encryption, read concern, write concern, session, cluster time,
//! server API, `maxTimeMS`, `$db`, read preference.

use bson::{doc, Document};

use super::{
    legacy::{self, LegacyRequest, Protocol, ReplyShape, OP_MSG_WIRE_VERSION},
    Operation,
    OperationType,
};
use crate::{
    bson_util,
    concern::{ReadConcern, ReadConcernInternal},
    context::Context,
    csfle,
    error::{Error, ErrorKind, Result},
    sdam::{SelectedServer, ServerType, TopologyType},
    selection_criteria::ReadPreference,
    session::max_cluster_time,
    wire::{next_request_id, DocumentSequence, Message, MessageFlags, Query, QueryFlags, WireMessage},
};

/// The first wire version that supports snapshot reads, and secondary reads of aggregates that
/// write their output.
const SERVER_5_0_WIRE_VERSION: i32 = 13;

/// A message ready to be written, with what monitoring needs to know about it.
#[derive(Debug)]
pub(crate) struct Assembled {
    pub(crate) message: WireMessage,

    /// The command as observers see it, with document sequences inlined.
    pub(crate) command: Document,

    pub(crate) command_name: String,

    pub(crate) reply: ReplyShape,
}

impl Assembled {
    pub(crate) fn request_id(&self) -> i32 {
        self.message.request_id()
    }

    /// Whether this is a fire-and-forget OP_MSG the server will not answer.
    pub(crate) fn more_to_come(&self) -> bool {
        matches!(
            self.message,
            WireMessage::Message(ref message) if message.flags.contains(MessageFlags::MORE_TO_COME)
        )
    }
}

impl Operation<'_> {
    /// Builds the message for the next attempt against `selected`.
    pub(crate) async fn assemble(
        &mut self,
        ctx: &Context,
        selected: &SelectedServer,
        protocol: Protocol,
        supports_streaming: bool,
        max_time_ms: Option<i64>,
    ) -> Result<Assembled> {
        match protocol {
            Protocol::Msg => {
                self.assemble_msg(ctx, selected, supports_streaming, max_time_ms)
                    .await
            }
            Protocol::Query => self.assemble_query(ctx, selected, max_time_ms).await,
            translated => self.assemble_legacy(selected, translated),
        }
    }

    async fn assemble_msg(
        &mut self,
        ctx: &Context,
        selected: &SelectedServer,
        supports_streaming: bool,
        max_time_ms: Option<i64>,
    ) -> Result<Assembled> {
        let encrypting = self.should_encrypt();
        let mut body = self.build_body(ctx, selected, encrypting, max_time_ms).await?;
        body.insert("$db", self.database.as_str());
        if let Some(read_preference) = self.create_read_pref(selected, false)? {
            body.insert("$readPreference", read_preference);
        }

        let mut flags = MessageFlags::empty();
        let unacknowledged = self
            .write_concern
            .as_ref()
            .map(|wc| !wc.is_acknowledged())
            .unwrap_or(false);
        let last_batch = self
            .batches
            .as_ref()
            .map(|batches| batches.documents.is_empty())
            .unwrap_or(true);
        if unacknowledged && last_batch {
            flags |= MessageFlags::MORE_TO_COME;
        }
        if supports_streaming {
            flags |= MessageFlags::EXHAUST_ALLOWED;
        }

        let mut message = Message::new(next_request_id(), flags, body);
        if !encrypting {
            if let Some(batches) = self.batches.as_ref().filter(|b| b.is_valid()) {
                if !batches.current.is_empty() {
                    message.document_sequences.push(DocumentSequence {
                        identifier: batches.identifier.clone(),
                        documents: batches.current.clone(),
                    });
                }
            }
        }

        let command = message.get_command_document();
        Ok(Assembled {
            command_name: command_name(&command)?,
            message: WireMessage::Message(message),
            command,
            reply: ReplyShape::Command,
        })
    }

    async fn assemble_query(
        &mut self,
        ctx: &Context,
        selected: &SelectedServer,
        max_time_ms: Option<i64>,
    ) -> Result<Assembled> {
        let body = self.build_body(ctx, selected, true, max_time_ms).await?;
        let query = match self.create_read_pref(selected, true)? {
            Some(read_preference) => doc! {
                "$query": body.clone(),
                "$readPreference": read_preference,
            },
            None => body.clone(),
        };

        let message = Query {
            request_id: next_request_id(),
            flags: self.secondary_ok(selected),
            full_collection_name: format!("{}.$cmd", self.database),
            number_to_skip: 0,
            number_to_return: -1,
            query,
            return_fields_selector: None,
        };
        Ok(Assembled {
            command_name: command_name(&body)?,
            message: WireMessage::Query(message),
            command: body,
            reply: ReplyShape::Command,
        })
    }

    /// Legacy translations carry only the command and the read preference.
    fn assemble_legacy(&mut self, selected: &SelectedServer, protocol: Protocol) -> Result<Assembled> {
        let mut command = Document::new();
        (self.command)(&mut command, selected)?;
        let read_preference = self.create_read_pref(selected, true)?;
        let LegacyRequest { message, reply } = legacy::translate(
            protocol,
            &self.database,
            &command,
            read_preference,
            self.secondary_ok(selected),
        )?;
        Ok(Assembled {
            command_name: command_name(&command)?,
            message,
            command,
            reply,
        })
    }

    /// Runs every step that is shared between OP_MSG and OP_QUERY commands.
    async fn build_body(
        &mut self,
        ctx: &Context,
        selected: &SelectedServer,
        inline_batch: bool,
        max_time_ms: Option<i64>,
    ) -> Result<Document> {
        let mut body = Document::new();
        (self.command)(&mut body, selected)?;

        if inline_batch {
            if let Some(batches) = self.batches.as_ref().filter(|b| b.is_valid()) {
                if !batches.current.is_empty() {
                    body.insert(
                        batches.identifier.clone(),
                        bson_util::to_bson_array(&batches.current),
                    );
                }
            }
        }

        if let Some(crypt) = self.crypt.clone().filter(|_| self.should_encrypt()) {
            if !selected.server.wire_version_at_least(csfle::MIN_WIRE_VERSION) {
                return Err(ErrorKind::Encryption {
                    message: "auto-encryption requires a minimum MongoDB version of 4.2".into(),
                }
                .into());
            }
            body = ctx.run(crypt.encrypt(ctx, &self.database, body)).await?;
        }

        self.add_read_concern(&mut body, selected)?;
        self.add_write_concern(&mut body, selected)?;
        self.add_session(&mut body, selected)?;
        self.add_cluster_time(&mut body, selected);
        if let Some(ref server_api) = self.server_api {
            server_api.append_to(&mut body);
        }
        if let Some(max_time_ms) = max_time_ms {
            body.insert("maxTimeMS", max_time_ms);
        }
        Ok(body)
    }

    fn add_read_concern(&self, body: &mut Document, selected: &SelectedServer) -> Result<()> {
        if self.min_read_concern_wire_version > 0
            && !selected
                .server
                .wire_version_at_least(self.min_read_concern_wire_version)
        {
            return Ok(());
        }
        let session = self.session.as_deref();
        if let Some(session) = session {
            // Only the first command of a transaction carries its read concern.
            if session.transaction_running() && !session.transaction_starting() {
                return Ok(());
            }
        }

        let mut read_concern = self.read_concern.as_ref().map(ReadConcernInternal::from);
        if let Some(session) = session {
            if session.transaction_starting() {
                if let Some(ref rc) = session.transaction_options().read_concern {
                    read_concern = Some(rc.into());
                }
            }
            if read_concern.is_none()
                && session.causal_consistency()
                && session.operation_time().is_some()
                && (session.transaction_starting() || self.op_type == OperationType::Read)
            {
                read_concern = Some(ReadConcernInternal::default());
            }
            if session.is_snapshot() {
                if !selected.server.wire_version_at_least(SERVER_5_0_WIRE_VERSION) {
                    return Err(ErrorKind::IncompatibleServer {
                        message: "snapshot reads require MongoDB 5.0 or later".into(),
                    }
                    .into());
                }
                read_concern = Some((&ReadConcern::snapshot()).into());
            }
        }
        let Some(mut read_concern) = read_concern else {
            return Ok(());
        };

        if let Some(session) = session {
            if selected.server.wire_version_at_least(OP_MSG_WIRE_VERSION) {
                if session.causal_consistency() {
                    read_concern.after_cluster_time = session.operation_time();
                }
                if session.is_snapshot() {
                    read_concern.at_cluster_time = session.snapshot_time();
                }
            }
        }

        if !read_concern.is_empty() {
            body.insert("readConcern", read_concern.to_document()?);
        }
        Ok(())
    }

    fn add_write_concern(&self, body: &mut Document, selected: &SelectedServer) -> Result<()> {
        if self.min_write_concern_wire_version > 0
            && !selected
                .server
                .wire_version_at_least(self.min_write_concern_wire_version)
        {
            return Ok(());
        }
        match self.write_concern {
            Some(ref wc) if !wc.is_empty() => {
                body.insert("writeConcern", wc.to_document()?);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn add_session(&mut self, body: &mut Document, selected: &SelectedServer) -> Result<()> {
        let op_type = self.op_type;
        let Some(session) = self.session.as_deref_mut() else {
            return Ok(());
        };
        if session.is_explicit() && !selected.server.supports_sessions() {
            return Err(ErrorKind::SessionsNotSupported.into());
        }
        if !selected.server.wire_version_at_least(OP_MSG_WIRE_VERSION)
            || !selected.server.supports_sessions()
        {
            return Ok(());
        }

        body.insert("lsid", session.id().clone());
        let mut added_txn_number = false;
        if op_type == OperationType::Write && session.retry_write {
            body.insert("txnNumber", session.txn_number());
            added_txn_number = true;
        }
        if session.transaction_running() {
            if !added_txn_number {
                body.insert("txnNumber", session.txn_number());
            }
            if session.transaction_starting() {
                body.insert("startTransaction", true);
            }
            body.insert("autocommit", false);
        }
        if (session.committing() || session.aborting()) && selected.kind == TopologyType::Sharded {
            if let Some(token) = session.recovery_token() {
                body.insert("recoveryToken", token.clone());
            }
        }

        session.apply_command(&selected.server);
        Ok(())
    }

    fn add_cluster_time(&self, body: &mut Document, selected: &SelectedServer) {
        if !selected.server.wire_version_at_least(OP_MSG_WIRE_VERSION) {
            return;
        }
        let clock_time = self.clock.as_ref().and_then(|clock| clock.get());
        let session_time = self
            .session
            .as_deref()
            .and_then(|session| session.cluster_time().cloned());
        if let Some(cluster_time) = max_cluster_time(clock_time, session_time) {
            body.insert("$clusterTime", cluster_time.to_document());
        }
    }

    /// The `$readPreference` document to send, if any.
    pub(crate) fn create_read_pref(
        &self,
        selected: &SelectedServer,
        is_op_query: bool,
    ) -> Result<Option<Document>> {
        if selected.server.server_type == ServerType::Standalone
            || (is_op_query && !selected.is_mongos())
            || self.op_type == OperationType::Write
            || (self.is_output_aggregate
                && !selected.server.wire_version_at_least(SERVER_5_0_WIRE_VERSION))
        {
            return Ok(None);
        }

        let mut read_preference = self.read_preference.as_ref();
        if let Some(session) = self.session.as_deref() {
            if session.transaction_running() {
                read_preference = session
                    .transaction_options()
                    .read_preference
                    .as_ref()
                    .or(read_preference);
                // Reads in a transaction must go to the primary. startTransaction is exempt.
                if let Some(rp) = read_preference {
                    if !session.transaction_starting() && !rp.is_primary() {
                        return Err(ErrorKind::NonPrimaryReadPref.into());
                    }
                }
            }
        }

        let single_non_mongos = selected.kind == TopologyType::Single && !selected.is_mongos();
        let primary_preferred = || {
            ReadPreference::PrimaryPreferred { options: None }.to_document()
        };
        let Some(read_preference) = read_preference else {
            return Ok(single_non_mongos.then(primary_preferred));
        };
        match read_preference {
            ReadPreference::Primary if selected.is_mongos() => Ok(None),
            ReadPreference::Primary if selected.kind == TopologyType::Single => {
                Ok(Some(primary_preferred()))
            }
            ReadPreference::SecondaryPreferred { .. }
                if selected.is_mongos() && is_op_query && !read_preference.has_options() =>
            {
                Ok(None)
            }
            other => Ok(Some(other.to_document())),
        }
    }

    /// The OP_QUERY flags the read preference calls for.
    pub(crate) fn secondary_ok(&self, selected: &SelectedServer) -> QueryFlags {
        let single_non_mongos = selected.kind == TopologyType::Single && !selected.is_mongos();
        let non_primary = self
            .read_preference
            .as_ref()
            .map(|rp| !rp.is_primary())
            .unwrap_or(false);
        if single_non_mongos || non_primary {
            QueryFlags::SECONDARY_OK
        } else {
            QueryFlags::empty()
        }
    }
}

fn command_name(command: &Document) -> Result<String> {
    bson_util::first_key(command)
        .map(String::from)
        .ok_or_else(|| Error::invalid_argument("the command callback appended no elements"))
}
