//! Runs an [`Operation`] against a deployment: server selection, connection checkout, the round
//! trip, and the retry loop around all of them.

mod retry;
#[cfg(test)]
mod test;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bson::{doc, Document};

use self::retry::{ExecutionRetry, Lease, RetryBudget};
use crate::{
    compression::{can_compress, Compressor},
    context::Context,
    csfle::{self, Crypt},
    cursor::{BatchCursor, CursorOptions},
    error::{
        CommandError,
        Error,
        ErrorKind,
        Interruption,
        Result,
        WriteCommandError,
        NETWORK_ERROR,
        NO_WRITES_PERFORMED,
        RETRYABLE_WRITE_ERROR,
        TRANSIENT_TRANSACTION_ERROR,
        UNKNOWN_REPL_WRITE_CONCERN_CODE,
        UNKNOWN_TRANSACTION_COMMIT_RESULT,
        UNSATISFIABLE_WRITE_CONCERN_CODE,
    },
    event::{
        command::{
            should_redact,
            CommandFailedEvent,
            CommandStartedEvent,
            CommandSucceededEvent,
            ConnectionInfo,
        },
        CommandMonitor,
    },
    operation::{response::extract_error, Assembled, Operation, OperationType, Protocol, RetryMode},
    sdam::{
        AddressSelector,
        CompositeSelector,
        Connection,
        SelectedServer,
        Server,
        ServerAddress,
        ServerDescription,
        ServerSelector,
        ServerType,
        TopologyType,
    },
    session::{ClusterClock, ClusterTime, Session},
    trace::server_selection::ServerSelectionEventEmitter,
    wire::{compress_message, MessageFlags, WireMessage},
};

/// The first wire version whose servers label retryable write errors themselves.
const RETRYABLE_WRITE_ERROR_LABEL_WIRE_VERSION: i32 = 9;

/// The outcome of a successful run: the last response and the server that sent it.
#[derive(Debug)]
pub(crate) struct Executed {
    pub(crate) response: Document,
    pub(crate) server: ServerDescription,
}

/// Executes `op` and returns the server's final response.
///
/// Writes split into batches are sent one batch at a time on the same connection; the returned
/// document is the response to the last batch. Per-document write errors from every batch are
/// collected into a single [`ErrorKind::WriteCommand`] error.
pub async fn execute(ctx: &Context, op: &mut Operation<'_>) -> Result<Document> {
    run(ctx, op).await.map(|executed| executed.response)
}

/// Executes a cursor-returning `op` and wraps its reply in a [`BatchCursor`] bound to the server
/// that produced it.
pub async fn execute_cursor(
    ctx: &Context,
    op: &mut Operation<'_>,
    options: CursorOptions,
) -> Result<BatchCursor> {
    let executed = run(ctx, op).await?;
    BatchCursor::new(executed.response, executed.server, op, options)
}

pub(crate) async fn run(ctx: &Context, op: &mut Operation<'_>) -> Result<Executed> {
    op.validate()?;

    let timeout_ctx;
    let (ctx, has_timeout) = match op.timeout {
        Some(timeout) => {
            timeout_ctx = ctx.clone().with_timeout(timeout);
            (&timeout_ctx, true)
        }
        None => (ctx, false),
    };

    let topology = op.deployment.kind();
    let batching = op.is_batching();
    let monitor = CommandMonitor::new(op.event_handler.clone(), op.max_document_length_bytes);

    let mut retry = ExecutionRetry::new(initial_budget(op, has_timeout));
    let mut previous_error: Option<Error> = None;
    let mut retry_supported = false;
    let mut first_attempt = true;
    let mut current_index = 0;
    let mut write_failure = WriteCommandError::default();
    let mut write_failure_labels: Vec<String> = Vec::new();
    let mut kept_lease: Option<Lease> = None;

    'attempts: loop {
        if let Some(ref error) = previous_error {
            if error.is_context_error() {
                return Err(error.clone());
            }
        }

        let reselected = kept_lease.is_none();
        let mut lease = match kept_lease.take() {
            Some(lease) => lease,
            None => match acquire(ctx, op, &retry.deprioritized).await {
                Ok(lease) => lease,
                Err(error) => {
                    if error.is_network_error() && !error.is_context_error() && retry.can_retry() {
                        retry.record_failure(&error, topology);
                        previous_error = Some(error);
                        continue;
                    }
                    return Err(retry.surface(error));
                }
            },
        };
        retry.last_server_address = Some(lease.connection.address().clone());
        let description = lease.connection.description().clone();
        let selected = SelectedServer {
            server: description.clone(),
            kind: topology,
        };

        if first_attempt {
            retry_supported = retryable(op, &description);
            if retry_supported && op.op_type == OperationType::Write {
                arm_retry_write(op);
            }
            first_attempt = false;
        } else if reselected && retry_supported && !retryable(op, &description) {
            // The retry landed on a server that cannot take it, so nothing is sent.
            lease.release(op.session.as_deref_mut());
            let error = previous_error
                .take()
                .unwrap_or_else(|| Error::internal("retry attempted without a prior error"));
            return Err(retry.surface(error));
        }

        let supports_streaming = lease.connection.supports_streaming();
        let prepared = prepare_attempt(ctx, op, &selected, has_timeout, supports_streaming)
            .await
            .and_then(|assembled| {
                let wire = frame(&assembled, lease.connection.compressor())?;
                Ok((assembled, wire))
            });
        let (assembled, wire) = match prepared {
            Ok(prepared) => prepared,
            Err(error) => {
                lease.release(op.session.as_deref_mut());
                return Err(error);
            }
        };

        let command_name = assembled.command_name.clone();
        op.name = Some(command_name.clone());
        let redact = should_redact(&command_name, &assembled.command);
        let request_id = assembled.request_id();
        let connection_info = ConnectionInfo {
            id: lease.connection.id().to_string(),
            address: lease.connection.address().clone(),
        };
        monitor.emit(CommandStartedEvent {
            command: if redact {
                Document::new()
            } else {
                assembled.command.clone()
            },
            db: op.database.clone(),
            command_name: command_name.clone(),
            request_id,
            connection: connection_info.clone(),
        });

        let start_time = Instant::now();
        let result = match check_round_trip_deadline(ctx, &description) {
            Ok(()) => {
                round_trip(
                    ctx,
                    &mut *lease.connection,
                    &wire,
                    &assembled,
                    op.session.as_deref_mut(),
                    op.clock.as_deref(),
                    op.crypt.as_deref(),
                )
                .await
            }
            Err(error) => Err(error),
        };
        let duration = start_time.elapsed();

        match result {
            Ok(ref response) => monitor.emit(CommandSucceededEvent {
                duration,
                reply: if redact {
                    Document::new()
                } else {
                    response.clone()
                },
                command_name: command_name.clone(),
                request_id,
                connection: connection_info,
            }),
            Err(ref error) => {
                lease.server.process_error(error, &description);
                let mut failure = error.clone();
                if redact {
                    failure.redact();
                }
                monitor.emit(CommandFailedEvent {
                    duration,
                    command_name: command_name.clone(),
                    failure,
                    request_id,
                    connection: connection_info,
                });
            }
        }

        let response = match result {
            Ok(response) => {
                if assembled.more_to_come() {
                    lease.release(op.session.as_deref_mut());
                    return Err(ErrorKind::UnacknowledgedWrite.into());
                }
                if let Err(error) =
                    op.run_process_response(Some(&response), &description, current_index)
                {
                    lease.release(op.session.as_deref_mut());
                    return Err(error);
                }
                Some(response)
            }
            Err(mut error) => {
                let max_wire_version = description.max_wire_version;
                let unlabelled_server = matches!(
                    max_wire_version,
                    Some(v) if v < RETRYABLE_WRITE_ERROR_LABEL_WIRE_VERSION
                );
                let retry_enabled = op.retry.is_enabled();
                let is_write = op.op_type == OperationType::Write;
                let committing = op.session.as_deref().is_some_and(Session::committing);
                let in_transaction = op.session.as_deref().is_some_and(|session| {
                    session.transaction_running() && !session.committing() && !session.aborting()
                });
                let mut previous_indefinite_used = false;

                loop {
                    if retry_supported && is_write && error.is_unsupported_storage_engine() {
                        lease.release(op.session.as_deref_mut());
                        return Err(ErrorKind::UnsupportedStorageEngine.into());
                    }

                    let is_write_command = matches!(*error.kind, ErrorKind::WriteCommand(_));
                    let is_command = matches!(*error.kind, ErrorKind::Command(_));
                    if !is_write_command && !is_command && !error.is_network_error() {
                        let _ = op.run_process_response(
                            error.server_response(),
                            &description,
                            current_index,
                        );
                        lease.release(op.session.as_deref_mut());
                        return Err(error);
                    }

                    if !is_write_command
                        && (error.contains_label(TRANSIENT_TRANSACTION_ERROR)
                            || error.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT))
                    {
                        if let Some(session) = op.session.as_deref_mut() {
                            session.unpin();
                        }
                        lease.pinned = false;
                    }

                    let retryable = if is_write_command || is_write {
                        let retryable = error.is_write_retryable(max_wire_version);
                        let needs_label = if is_write_command {
                            retryable && unlabelled_server
                        } else {
                            error.contains_label(NETWORK_ERROR) || (retryable && unlabelled_server)
                        };
                        if needs_label && retry_enabled && !in_transaction {
                            error.add_label(RETRYABLE_WRITE_ERROR);
                        }
                        retryable
                    } else {
                        error.is_read_retryable()
                    };

                    if retry_supported && retryable && retry.can_retry() {
                        upgrade_commit_write_concern(op);
                        retry.record_failure(&error, topology);
                        previous_error = Some(error);
                        lease.release(op.session.as_deref_mut());
                        continue 'attempts;
                    }

                    if error.contains_label(NO_WRITES_PERFORMED) && !previous_indefinite_used {
                        if let Some(previous) = retry.previous_indefinite_error.clone() {
                            error = previous;
                            previous_indefinite_used = true;
                            continue;
                        }
                    }

                    let _ =
                        op.run_process_response(error.server_response(), &description, current_index);

                    if !is_write_command {
                        if committing && (retryable || error.is_max_time_ms_expired()) {
                            error.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
                        }
                        lease.release(op.session.as_deref_mut());
                        return Err(error);
                    }

                    if let ErrorKind::WriteCommand(ref mut failure) = *error.kind {
                        if batching {
                            for write_error in &mut failure.write_errors {
                                write_error.index += current_index;
                            }
                        }
                    }

                    let ordered = op.batches.as_ref().is_some_and(|b| b.is_ordered());
                    let (has_write_errors, write_concern_error) = match *error.kind {
                        ErrorKind::WriteCommand(ref failure) => (
                            !failure.write_errors.is_empty(),
                            failure.write_concern_error.clone(),
                        ),
                        _ => (false, None),
                    };
                    if batching && ordered && has_write_errors {
                        lease.release(op.session.as_deref_mut());
                        return Err(error);
                    }

                    if committing {
                        if let Some(wc_error) = write_concern_error {
                            let mut commit_error = Error::new(
                                ErrorKind::Command(CommandError::new(
                                    wc_error.code,
                                    wc_error.code_name,
                                    wc_error.message,
                                )),
                                Some(error.labels().iter().cloned()),
                            );
                            if wc_error.code != UNKNOWN_REPL_WRITE_CONCERN_CODE
                                && wc_error.code != UNSATISFIABLE_WRITE_CONCERN_CODE
                            {
                                commit_error.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
                            }
                            if retryable && retry_enabled {
                                commit_error.add_label(RETRYABLE_WRITE_ERROR);
                            }
                            if let Some(response) = error.server_response() {
                                commit_error = commit_error.with_server_response(response);
                            }
                            lease.release(op.session.as_deref_mut());
                            return Err(commit_error.with_wire_version(max_wire_version));
                        }
                    }

                    write_failure_labels = error.labels().iter().cloned().collect();
                    if let ErrorKind::WriteCommand(failure) = *error.kind {
                        write_failure.write_concern_error = failure.write_concern_error;
                        write_failure.write_errors.extend(failure.write_errors);
                    }
                    break None;
                }
            }
        };

        let batches_remaining = op
            .batches
            .as_ref()
            .is_some_and(|batches| !batches.remaining().is_empty());
        if batching && batches_remaining {
            if retry_supported && op.op_type == OperationType::Write {
                arm_retry_write(op);
                if op.retry == RetryMode::OncePerCommand && !has_timeout {
                    retry.attempts_remaining = RetryBudget::Limited(1);
                }
            }
            if let Some(batches) = op.batches.as_mut() {
                current_index += batches.current().len();
                batches.clear_batch();
            }
            kept_lease = Some(lease);
            continue;
        }

        lease.release(op.session.as_deref_mut());

        if !write_failure.is_empty() {
            return Err(Error::new(
                ErrorKind::WriteCommand(write_failure),
                Some(write_failure_labels),
            ));
        }
        let response =
            response.ok_or_else(|| Error::internal("operation finished without a response"))?;
        return Ok(Executed {
            response,
            server: description,
        });
    }
}

/// How many retries the retry mode allows, before anything is known about the server.
fn initial_budget(op: &Operation<'_>, has_timeout: bool) -> RetryBudget {
    let budget = match (op.op_type, op.retry) {
        (OperationType::Unknown, _) | (_, RetryMode::None) => RetryBudget::None,
        (OperationType::Write, _) if op.session.is_none() => RetryBudget::None,
        (_, RetryMode::Once | RetryMode::OncePerCommand) => RetryBudget::Limited(1),
        (_, RetryMode::Context) => RetryBudget::Unbounded,
    };
    if has_timeout && op.retry.is_enabled() {
        return RetryBudget::Unbounded;
    }
    budget
}

/// Whether the operation may be retried against the server an attempt was routed to.
fn retryable(op: &Operation<'_>, description: &ServerDescription) -> bool {
    let session = op.session.as_deref();
    let finishing_transaction =
        session.is_some_and(|session| session.committing() || session.aborting());
    match op.op_type {
        OperationType::Write => {
            if finishing_transaction {
                return true;
            }
            let Some(session) = session else {
                return false;
            };
            description.session_timeout_minutes.is_some()
                && description.server_type != ServerType::Standalone
                && op.deployment.supports_retryable_writes()
                && !session.transaction_running()
                && op
                    .write_concern
                    .as_ref()
                    .map(|wc| wc.is_acknowledged())
                    .unwrap_or(true)
        }
        OperationType::Read => {
            finishing_transaction || session.map(|s| !s.transaction_running()).unwrap_or(true)
        }
        OperationType::Unknown => false,
    }
}

/// Marks the session's next write as retryable and gives it a fresh transaction number, unless
/// it is finishing a transaction whose number must not change.
fn arm_retry_write(op: &mut Operation<'_>) {
    let enabled = op.retry.is_enabled();
    if let Some(session) = op.session.as_deref_mut() {
        session.retry_write = enabled;
        if enabled && !session.committing() && !session.aborting() {
            session.increment_txn_number();
        }
    }
}

/// A retried commit must be applied by a majority.
fn upgrade_commit_write_concern(op: &mut Operation<'_>) {
    let Some(session) = op.session.as_deref_mut() else {
        return;
    };
    if !session.committing() {
        return;
    }
    let upgraded = session
        .transaction_options()
        .write_concern
        .clone()
        .or_else(|| op.write_concern.clone())
        .unwrap_or_default()
        .upgraded_for_commit_retry();
    session.set_transaction_write_concern(upgraded.clone());
    op.write_concern = Some(upgraded);
}

async fn acquire(
    ctx: &Context,
    op: &mut Operation<'_>,
    deprioritized: &[ServerAddress],
) -> Result<Lease> {
    let server = select_server(ctx, op, deprioritized)
        .await
        .map_err(|mut error| {
            let in_transaction = op.session.as_deref().is_some_and(|session| {
                session.transaction_running() && !session.committing() && !session.aborting()
            });
            if in_transaction {
                error.add_label(TRANSIENT_TRANSACTION_ERROR);
            }
            error
        })?;

    if let Some(connection) = op
        .session
        .as_deref_mut()
        .and_then(Session::take_pinned_connection)
    {
        return Ok(Lease {
            server,
            connection,
            pinned: true,
        });
    }

    let connection = ctx.run(server.connection(ctx)).await?;
    let pinned = op.deployment.kind() == TopologyType::LoadBalanced
        && op
            .session
            .as_deref()
            .is_some_and(Session::transaction_starting);
    Ok(Lease {
        server,
        connection,
        pinned,
    })
}

async fn select_server(
    ctx: &Context,
    op: &Operation<'_>,
    deprioritized: &[ServerAddress],
) -> Result<Arc<dyn Server>> {
    let pinned_selector;
    let default_selector;
    let selector: &dyn ServerSelector = match op.session.as_deref().and_then(Session::pinned_mongos)
    {
        Some(address) => {
            pinned_selector = AddressSelector::new(address.clone());
            &pinned_selector
        }
        None => match op.selector.as_deref() {
            Some(selector) => selector,
            None => {
                default_selector =
                    CompositeSelector::for_read_preference(op.read_preference.as_ref());
                &default_selector
            }
        },
    };

    let operation_name = op.name.as_deref().unwrap_or("command");
    let emitter = ServerSelectionEventEmitter::new(operation_name, selector, op.deployment.kind());
    emitter.emit_started_event();
    match ctx
        .run(op.deployment.select_server(ctx, selector, deprioritized))
        .await
    {
        Ok(server) => {
            emitter.emit_succeeded_event(server.address());
            Ok(server)
        }
        Err(error) => {
            emitter.emit_failed_event(&error);
            Err(error)
        }
    }
}

/// Computes `maxTimeMS`, moves the next batch into place and assembles the message.
async fn prepare_attempt(
    ctx: &Context,
    op: &mut Operation<'_>,
    selected: &SelectedServer,
    has_timeout: bool,
    supports_streaming: bool,
) -> Result<Assembled> {
    let max_time_ms = max_time_ms(ctx, op, has_timeout, &selected.server)?;

    let encrypting = op.should_encrypt();
    if let Some(batches) = op.batches.as_mut().filter(|batches| batches.is_valid()) {
        let max_document_size = usize::try_from(selected.server.max_document_size).unwrap_or(0);
        let target_batch_size = if encrypting {
            csfle::MAX_ENCRYPTED_BATCH_BYTES
        } else {
            max_document_size
        };
        batches.advance(
            usize::try_from(selected.server.max_batch_count).unwrap_or(1),
            target_batch_size,
            max_document_size,
        )?;
    }

    let protocol = Protocol::select(op.legacy, &selected.server);
    op.assemble(ctx, selected, protocol, supports_streaming, max_time_ms)
        .await
}

fn max_time_ms(
    ctx: &Context,
    op: &Operation<'_>,
    has_timeout: bool,
    description: &ServerDescription,
) -> Result<Option<i64>> {
    if description.is_cryptd {
        return Ok(None);
    }
    if has_timeout && !op.omit_timeout_max_time {
        if let Some(remaining) = ctx.remaining() {
            let round_trip_time = description.average_round_trip_time.unwrap_or_default();
            let budget = remaining
                .checked_sub(round_trip_time)
                .filter(|budget| !budget.is_zero())
                .ok_or_else(|| Error::interrupted(Interruption::DeadlineExceeded))?;
            let ms = ceil_millis(budget);
            if ms > i32::MAX as u128 {
                return Ok(None);
            }
            return Ok(Some(ms as i64));
        }
    }
    Ok(op
        .max_time
        .map(ceil_millis)
        .filter(|ms| *ms > 0)
        .map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)))
}

fn ceil_millis(duration: Duration) -> u128 {
    let millis = duration.as_millis();
    if duration.subsec_nanos() % 1_000_000 == 0 {
        millis
    } else {
        millis + 1
    }
}

/// Serializes the message, wrapping it in OP_COMPRESSED when the connection negotiated a
/// compressor and the command may be compressed.
fn frame(assembled: &Assembled, compressor: Option<&Compressor>) -> Result<Vec<u8>> {
    let mut wire = Vec::new();
    assembled.message.write_to(&mut wire)?;
    match compressor {
        Some(compressor) if can_compress(&assembled.command_name) => {
            compress_message(&wire, compressor)
        }
        _ => Ok(wire),
    }
}

/// Fails without sending when the context has ended, or when it would end before a reply could
/// arrive.
fn check_round_trip_deadline(ctx: &Context, description: &ServerDescription) -> Result<()> {
    ctx.check()?;
    if let (Some(remaining), Some(round_trip_time)) =
        (ctx.remaining(), description.average_round_trip_time)
    {
        if round_trip_time > remaining {
            return Err(Error::interrupted(Interruption::DeadlineExceeded));
        }
    }
    Ok(())
}

/// Writes the message and reads the reply, leaving the session and clock updated with whatever
/// the server reported, even when the reply is a failure.
async fn round_trip(
    ctx: &Context,
    connection: &mut dyn Connection,
    wire: &[u8],
    assembled: &Assembled,
    session: Option<&mut Session>,
    clock: Option<&ClusterClock>,
    crypt: Option<&dyn Crypt>,
) -> Result<Document> {
    if assembled.more_to_come() {
        if let Err(error) = ctx.run(connection.write_wire_message(ctx, wire)).await {
            let mut error = Error::network(error);
            error.add_label(TRANSIENT_TRANSACTION_ERROR);
            if let Some(session) = session {
                session.mark_dirty();
            }
            return Err(error);
        }
        return Ok(doc! { "ok": 1 });
    }

    if !connection.currently_streaming() {
        if let Err(error) = ctx.run(connection.write_wire_message(ctx, wire)).await {
            return Err(network_error(error, session));
        }
    }
    if !assembled.reply.reads_reply() {
        return assembled.reply.decode(assembled.message.clone());
    }
    let bytes = match ctx.run(connection.read_wire_message(ctx)).await {
        Ok(bytes) => bytes,
        Err(error) => return Err(network_error(error, session)),
    };

    let max_wire_version = connection.description().max_wire_version;
    let message = WireMessage::read(&bytes, Some(connection.description().max_message_size))?;
    if connection.supports_streaming() {
        let more_to_come = matches!(
            message,
            WireMessage::Message(ref message) if message.flags.contains(MessageFlags::MORE_TO_COME)
        );
        connection.set_streaming(more_to_come);
    }
    let response = assembled.reply.decode(message)?;

    if let Some(session) = session {
        session.update_from_response(&response, &assembled.command_name);
    }
    if let (Some(clock), Some(cluster_time)) = (clock, ClusterTime::from_response(&response)) {
        clock.advance(&cluster_time);
    }
    if let Some(error) = extract_error(&response) {
        return Err(error
            .with_server_response(&response)
            .with_wire_version(max_wire_version));
    }

    match crypt {
        Some(crypt) => ctx.run(crypt.decrypt(ctx, response)).await,
        None => Ok(response),
    }
}

/// Wraps a transport failure, marking the session dirty and labelling the error for the
/// transaction it interrupted.
fn network_error(cause: Error, session: Option<&mut Session>) -> Error {
    let mut error = Error::network(cause);
    if let Some(session) = session {
        session.mark_dirty();
        if session.transaction_running() && !session.committing() {
            error.add_label(TRANSIENT_TRANSACTION_ERROR);
        }
        if session.committing() {
            error.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
        }
    }
    error
}
