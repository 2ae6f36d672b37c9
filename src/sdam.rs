//! The deployment, server and connection contracts the executor consumes. Topology discovery,
//! monitoring and connection pooling live behind these traits.

mod description;
mod selection;

use std::sync::Arc;

use futures_core::future::BoxFuture;

pub use self::{
    description::{
        SelectedServer,
        ServerAddress,
        ServerDescription,
        ServerType,
        TopologyType,
    },
    selection::{
        filter_deprioritized,
        suitable_servers,
        AddressSelector,
        CompositeSelector,
        LatencySelector,
        ReadPreferenceSelector,
        ServerSelector,
    },
};
pub(crate) use description::DEFAULT_MAX_DOCUMENT_SIZE;
use crate::{compression::Compressor, context::Context, error::Result};

/// A view of a MongoDB deployment that can hand out servers.
pub trait Deployment: Send + Sync {
    /// Selects a server suitable for `selector`. Servers listed in `deprioritized` should only be
    /// chosen when nothing else qualifies; [`suitable_servers`] implements this.
    fn select_server<'a>(
        &'a self,
        ctx: &'a Context,
        selector: &'a dyn ServerSelector,
        deprioritized: &'a [ServerAddress],
    ) -> BoxFuture<'a, Result<Arc<dyn Server>>>;

    /// The kind of topology this deployment currently is.
    fn kind(&self) -> TopologyType;

    /// Whether every data-bearing member of the deployment supports retryable writes.
    fn supports_retryable_writes(&self) -> bool {
        true
    }
}

/// A single server that can lend out connections.
pub trait Server: Send + Sync {
    /// Checks out a connection to this server. The caller owns it until it calls
    /// [`Connection::close`].
    fn connection<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Box<dyn Connection>>>;

    /// Called after every response that produced an error, so the topology layer can mark the
    /// server unknown or clear its pool.
    fn process_error(&self, _error: &crate::error::Error, _description: &ServerDescription) {}

    fn address(&self) -> &ServerAddress;
}

/// A single physical link to a server.
pub trait Connection: Send {
    fn write_wire_message<'a>(
        &'a mut self,
        ctx: &'a Context,
        message: &'a [u8],
    ) -> BoxFuture<'a, Result<()>>;

    /// Reads one complete wire message, header included.
    fn read_wire_message<'a>(&'a mut self, ctx: &'a Context) -> BoxFuture<'a, Result<Vec<u8>>>;

    fn description(&self) -> &ServerDescription;

    /// An identifier for this connection, unique within the process.
    fn id(&self) -> &str;

    fn address(&self) -> &ServerAddress;

    /// Returns the connection to its pool, or discards it if it was marked broken.
    fn close(&mut self) -> Result<()>;

    /// The compressor negotiated for this connection, if any.
    fn compressor(&self) -> Option<&Compressor> {
        None
    }

    /// Whether the connection may receive exhaust (streamed) replies.
    fn supports_streaming(&self) -> bool {
        false
    }

    fn set_streaming(&mut self, _streaming: bool) {}

    /// Whether the server has announced more replies to the last request.
    fn currently_streaming(&self) -> bool {
        false
    }
}
