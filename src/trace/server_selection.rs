use std::time::Instant;

use super::{TracingRepresentation, SERVER_SELECTION_TRACING_EVENT_TARGET};
use crate::{
    error::Error,
    sdam::{ServerAddress, ServerSelector, TopologyType},
};

/// Type responsible for emitting server selection tracing events.
pub(crate) struct ServerSelectionEventEmitter<'a> {
    operation_name: &'a str,
    selector: &'a dyn ServerSelector,
    topology: TopologyType,
    start_time: Instant,
}

impl ServerSelectionEventEmitter<'_> {
    pub(crate) fn new<'a>(
        operation_name: &'a str,
        selector: &'a dyn ServerSelector,
        topology: TopologyType,
    ) -> ServerSelectionEventEmitter<'a> {
        ServerSelectionEventEmitter::<'a> {
            operation_name,
            selector,
            topology,
            start_time: Instant::now(),
        }
    }

    pub(crate) fn emit_started_event(&self) {
        tracing::debug!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            operation = self.operation_name,
            selector = format!("{:?}", self.selector),
            topologyType = %self.topology,
            "Server selection started"
        );
    }

    pub(crate) fn emit_failed_event(&self, error: &Error) {
        tracing::debug!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            operation = self.operation_name,
            selector = format!("{:?}", self.selector),
            topologyType = %self.topology,
            failure = error.tracing_representation(),
            durationMS = self.start_time.elapsed().as_millis(),
            "Server selection failed"
        );
    }

    pub(crate) fn emit_succeeded_event(&self, address: &ServerAddress) {
        tracing::debug!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            operation = self.operation_name,
            selector = format!("{:?}", self.selector),
            topologyType = %self.topology,
            serverHost = address.host,
            serverPort = address.port_tracing_representation(),
            durationMS = self.start_time.elapsed().as_millis(),
            "Server selection succeeded"
        );
    }
}
