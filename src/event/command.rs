//! Contains the events and functionality for monitoring command execution.

use std::{collections::HashSet, sync::LazyLock, time::Duration};

use bson::Document;
use derive_more::From;

use crate::{error::Error, sdam::ServerAddress};

static REDACTED_COMMANDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "authenticate",
        "saslstart",
        "saslcontinue",
        "getnonce",
        "createuser",
        "updateuser",
        "copydbgetnonce",
        "copydbsaslstart",
        "copydb",
    ]
    .into_iter()
    .collect()
});

static HELLO_COMMAND_NAMES: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| ["hello", "ismaster"].into_iter().collect());

/// Whether the bodies of a command and of its reply must be hidden from monitoring. Handshakes
/// are only sensitive when they carry speculative authentication.
pub(crate) fn should_redact(command_name: &str, command: &Document) -> bool {
    let name = command_name.to_lowercase();
    REDACTED_COMMANDS.contains(name.as_str())
        || (HELLO_COMMAND_NAMES.contains(name.as_str())
            && command.contains_key("speculativeAuthenticate"))
}

/// Identifies the connection a command was sent on.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// The identifier the connection reported for itself.
    pub id: String,

    /// The address of the server the connection is to.
    pub address: ServerAddress,
}

/// An event that triggers when a database command is initiated.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandStartedEvent {
    /// The command being run. Empty when the command is sensitive.
    pub command: Document,

    /// The name of the database the command is being run against.
    pub db: String,

    /// The type of command being run, e.g. "find" or "hello".
    pub command_name: String,

    /// The executor-generated identifier for the request. Applications can use this to identify
    /// the corresponding event triggered by the completion of this command (i.e. either
    /// `CommandSucceededEvent` or `CommandFailedEvent`).
    pub request_id: i32,

    /// Information about the connection the command will be run on.
    pub connection: ConnectionInfo,
}

/// An event that triggers when a database command completes without an error.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandSucceededEvent {
    /// The total execution time of the command (including the network round-trip).
    pub duration: Duration,

    /// The server's reply to the command. Empty when the command is sensitive.
    pub reply: Document,

    /// The type of command that was run, e.g. "find" or "hello".
    pub command_name: String,

    /// The executor-generated identifier for the request. Applications can use this to identify
    /// the corresponding `CommandStartedEvent` that triggered earlier.
    pub request_id: i32,

    /// Information about the connection the command was run on.
    pub connection: ConnectionInfo,
}

/// An event that triggers when a command failed to complete successfully.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandFailedEvent {
    /// The total execution time of the command (including the network round-trip).
    pub duration: Duration,

    /// The type of command that was run, e.g. "find" or "hello".
    pub command_name: String,

    /// The error the command failed with. Its server response is stripped when the command is
    /// sensitive.
    pub failure: Error,

    /// The executor-generated identifier for the request. Applications can use this to identify
    /// the corresponding `CommandStartedEvent` that triggered earlier.
    pub request_id: i32,

    /// Information about the connection the command was run on.
    pub connection: ConnectionInfo,
}

/// Applications can implement this trait to specify custom logic to run on each command event
/// sent by the executor.
///
/// ```rust
/// # use std::sync::Arc;
/// # use mongodb_executor::event::{command::{CommandEvent, CommandEventHandler, CommandFailedEvent}, EventHandler};
/// struct FailedCommandLogger;
///
/// impl CommandEventHandler for FailedCommandLogger {
///     fn handle_command_failed_event(&self, event: CommandFailedEvent) {
///         eprintln!("Failed command: {:?}", event);
///     }
/// }
///
/// let handler: EventHandler<CommandEvent> = Arc::new(FailedCommandLogger).into();
/// ```
#[allow(unused_variables)]
pub trait CommandEventHandler: Send + Sync {
    /// Called whenever a database command is initiated.
    fn handle_command_started_event(&self, event: CommandStartedEvent) {}

    /// Called whenever a database command successfully completes.
    fn handle_command_succeeded_event(&self, event: CommandSucceededEvent) {}

    /// Called whenever a database command fails to complete successfully.
    fn handle_command_failed_event(&self, event: CommandFailedEvent) {}
}

#[derive(Clone, Debug, From)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum CommandEvent {
    Started(CommandStartedEvent),
    Succeeded(CommandSucceededEvent),
    Failed(CommandFailedEvent),
}

impl CommandEvent {
    pub fn request_id(&self) -> i32 {
        match self {
            Self::Started(event) => event.request_id,
            Self::Succeeded(event) => event.request_id,
            Self::Failed(event) => event.request_id,
        }
    }

    pub fn command_name(&self) -> &str {
        match self {
            Self::Started(event) => event.command_name.as_str(),
            Self::Succeeded(event) => event.command_name.as_str(),
            Self::Failed(event) => event.command_name.as_str(),
        }
    }
}
