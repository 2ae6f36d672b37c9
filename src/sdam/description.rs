use std::{fmt, time::Duration};

use typed_builder::TypedBuilder;

use crate::selection_criteria::TagSet;

pub(crate) const DEFAULT_MAX_DOCUMENT_SIZE: i32 = 16 * 1024 * 1024;
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE: i32 = 48_000_000;
pub(crate) const DEFAULT_MAX_BATCH_COUNT: i32 = 100_000;
const DEFAULT_PORT: u16 = 27017;

/// The address of a server.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub struct ServerAddress {
    /// The hostname or IP address where the server can be found.
    pub host: String,

    /// The TCP port that the server is listening on. The default is 27017.
    pub port: Option<u16>,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: impl Into<Option<u16>>) -> Self {
        Self {
            host: host.into().to_lowercase(),
            port: port.into(),
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host, self.port())
    }
}

/// The possible types for a server.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    RsPrimary,

    /// A secondary node in a replica set.
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the replica
    /// set config.
    RsGhost,

    /// A load-balancing proxy between the driver and the MongoDB deployment.
    LoadBalancer,

    /// A server that the driver hasn't yet communicated with or can't connect to.
    #[default]
    Unknown,
}

/// The possible types for a topology.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A load balanced topology.
    LoadBalanced,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

impl fmt::Display for TopologyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the executor knows about a server: the facts it learned from the handshake, as reported
/// by the connection.
#[derive(Clone, Debug, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ServerDescription {
    #[builder(!default)]
    pub address: ServerAddress,

    pub server_type: ServerType,

    /// The lowest wire version the server speaks. `None` before the handshake completes.
    pub min_wire_version: Option<i32>,

    /// The highest wire version the server speaks. `None` before the handshake completes.
    pub max_wire_version: Option<i32>,

    #[builder(default = DEFAULT_MAX_DOCUMENT_SIZE)]
    pub max_document_size: i32,

    #[builder(default = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: i32,

    #[builder(default = DEFAULT_MAX_BATCH_COUNT)]
    pub max_batch_count: i32,

    /// `logicalSessionTimeoutMinutes` from the handshake. Absent when the server does not
    /// support sessions.
    pub session_timeout_minutes: Option<i64>,

    /// Compressors the server agreed to during the handshake.
    pub compressors: Vec<String>,

    pub average_round_trip_time: Option<Duration>,

    pub tags: TagSet,

    /// Whether this server is a `mongocryptd` process.
    pub is_cryptd: bool,
}

impl ServerDescription {
    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        tag_set
            .iter()
            .all(|(key, val)| self.tags.get(key) == Some(val))
    }

    pub(crate) fn supports_sessions(&self) -> bool {
        self.session_timeout_minutes.is_some()
    }

    /// Whether the server's maximum wire version is at least `version`. An unknown version never
    /// is.
    pub(crate) fn wire_version_at_least(&self, version: i32) -> bool {
        matches!(self.max_wire_version, Some(max) if max >= version)
    }

    pub(crate) fn is_available(&self) -> bool {
        !matches!(self.server_type, ServerType::Unknown)
    }
}

/// A server description paired with the kind of topology it was selected from. Command callbacks
/// receive this so they can adapt the command to the server.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectedServer {
    pub server: ServerDescription,
    pub kind: TopologyType,
}

impl SelectedServer {
    pub(crate) fn is_mongos(&self) -> bool {
        self.server.server_type == ServerType::Mongos
    }
}
