//! Command monitoring: the events the executor publishes for every round trip, and where they go.

pub mod command;

use std::sync::Arc;

use futures_core::future::BoxFuture;

use crate::{
    event::command::{CommandEvent, CommandEventHandler},
    trace::command::CommandTracingEventEmitter,
};

/// A destination for events. A `tokio` channel sender converts into one:
///
/// ```rust
/// # use mongodb_executor::event::{command::CommandEvent, EventHandler};
/// # async fn example() {
/// let (tx, mut rx) = tokio::sync::mpsc::channel::<CommandEvent>(100);
/// tokio::spawn(async move {
///     while let Some(ev) = rx.recv().await {
///         println!("{:?}", ev);
///     }
/// });
/// let handler: EventHandler<CommandEvent> = tx.into();
/// # }
/// ```
///
/// and so does any `Fn`:
///
/// ```rust
/// # use mongodb_executor::event::{command::CommandEvent, EventHandler};
/// let handler = EventHandler::<CommandEvent>::callback(|ev| println!("{:?}", ev));
/// ```
#[derive(Clone)]
#[non_exhaustive]
pub enum EventHandler<T> {
    /// Called inline, on the task running the operation.
    Callback(Arc<dyn Fn(T) + Sync + Send>),
    /// Spawned onto the current `tokio` runtime.
    AsyncCallback(Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Sync + Send>),
    /// Sent from a spawned task, so a full channel never blocks the operation.
    TokioMpsc(tokio::sync::mpsc::Sender<T>),
}

impl<T> std::fmt::Debug for EventHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Callback(_) => "Callback",
            Self::AsyncCallback(_) => "AsyncCallback",
            Self::TokioMpsc(_) => "TokioMpsc",
        };
        f.debug_tuple("EventHandler").field(&kind).finish()
    }
}

impl<T> From<tokio::sync::mpsc::Sender<T>> for EventHandler<T> {
    fn from(value: tokio::sync::mpsc::Sender<T>) -> Self {
        Self::TokioMpsc(value)
    }
}

impl<T: CommandEventHandler + 'static> From<Arc<T>> for EventHandler<CommandEvent> {
    fn from(value: Arc<T>) -> Self {
        Self::callback(move |ev| match ev {
            CommandEvent::Started(e) => value.handle_command_started_event(e),
            CommandEvent::Succeeded(e) => value.handle_command_succeeded_event(e),
            CommandEvent::Failed(e) => value.handle_command_failed_event(e),
        })
    }
}

impl<T: Send + Sync + 'static> EventHandler<T> {
    pub fn callback(f: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::Callback(Arc::new(f))
    }

    pub fn async_callback(f: impl Fn(T) -> BoxFuture<'static, ()> + Send + Sync + 'static) -> Self {
        Self::AsyncCallback(Arc::new(f))
    }

    pub(crate) fn handle(&self, event: T) {
        match self {
            Self::Callback(cb) => (cb)(event),
            Self::AsyncCallback(cb) => {
                tokio::spawn((cb)(event));
            }
            Self::TokioMpsc(sender) => {
                let sender = sender.clone();
                tokio::spawn(async move {
                    let _ = sender.send(event).await;
                });
            }
        }
    }
}

/// Publishes the command events of one operation: to the operation's handler, if it has one, and
/// as `tracing` events.
#[derive(Clone, Debug)]
pub(crate) struct CommandMonitor {
    handler: Option<EventHandler<CommandEvent>>,
    tracing: CommandTracingEventEmitter,
}

impl CommandMonitor {
    pub(crate) fn new(
        handler: Option<EventHandler<CommandEvent>>,
        max_document_length_bytes: Option<usize>,
    ) -> Self {
        Self {
            handler,
            tracing: CommandTracingEventEmitter::new(max_document_length_bytes),
        }
    }

    pub(crate) fn emit(&self, event: impl Into<CommandEvent>) {
        let event = event.into();
        if let Some(ref handler) = self.handler {
            handler.handle(event.clone());
        }
        self.tracing.handle(event);
    }
}
