use crate::{
    event::command::{CommandEvent, ConnectionInfo},
    trace::{serialize_command_or_reply, TracingRepresentation, COMMAND_TRACING_EVENT_TARGET},
};

use super::DEFAULT_MAX_DOCUMENT_LENGTH_BYTES;

/// Mirrors command monitoring events as `tracing` events at the debug level. Commands and replies
/// are logged as relaxed extended JSON, truncated to `max_document_length_bytes`.
#[derive(Clone, Debug)]
pub(crate) struct CommandTracingEventEmitter {
    max_document_length_bytes: usize,
}

impl CommandTracingEventEmitter {
    pub(crate) fn new(max_document_length_bytes: Option<usize>) -> CommandTracingEventEmitter {
        CommandTracingEventEmitter {
            max_document_length_bytes: max_document_length_bytes
                .unwrap_or(DEFAULT_MAX_DOCUMENT_LENGTH_BYTES),
        }
    }

    fn truncated(&self, mut text: String) -> String {
        super::truncate_on_char_boundary(&mut text, self.max_document_length_bytes);
        text
    }

    pub(crate) fn handle(&self, event: CommandEvent) {
        if !tracing::enabled!(target: COMMAND_TRACING_EVENT_TARGET, tracing::Level::DEBUG) {
            return;
        }
        match event {
            CommandEvent::Started(event) => {
                let ConnectionInfo { id, address } = event.connection;
                tracing::debug!(
                    target: COMMAND_TRACING_EVENT_TARGET,
                    command = serialize_command_or_reply(event.command, self.max_document_length_bytes),
                    databaseName = event.db,
                    commandName = event.command_name,
                    requestId = event.request_id,
                    driverConnectionId = id,
                    serverHost = address.host,
                    serverPort = address.port_tracing_representation(),
                    "Command started"
                );
            }
            CommandEvent::Succeeded(event) => {
                let ConnectionInfo { id, address } = event.connection;
                tracing::debug!(
                    target: COMMAND_TRACING_EVENT_TARGET,
                    reply = serialize_command_or_reply(event.reply, self.max_document_length_bytes),
                    commandName = event.command_name,
                    requestId = event.request_id,
                    driverConnectionId = id,
                    serverHost = address.host,
                    serverPort = address.port_tracing_representation(),
                    durationMS = event.duration.as_millis(),
                    "Command succeeded"
                );
            }
            CommandEvent::Failed(event) => {
                let ConnectionInfo { id, address } = event.connection;
                let mut labels: Vec<&str> =
                    event.failure.labels().iter().map(String::as_str).collect();
                labels.sort_unstable();
                tracing::debug!(
                    target: COMMAND_TRACING_EVENT_TARGET,
                    failure = self.truncated(event.failure.tracing_representation()),
                    failureCode = event.failure.sdam_code(),
                    errorLabels = labels.join(","),
                    commandName = event.command_name,
                    requestId = event.request_id,
                    driverConnectionId = id,
                    serverHost = address.host,
                    serverPort = address.port_tracing_representation(),
                    durationMS = event.duration.as_millis(),
                    "Command failed"
                );
            }
        }
    }
}
