//! Provider lifecycle events and their delivery.
//!
//! Producers (the state machine and the change stream task) hand events to an [`EventEmitter`],
//! which never blocks them. A dedicated dispatch task drains the bounded queue and delivers every
//! event to the registered [`EventHandler`]s and to all [subscribers](EventEmitter::subscribe).
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderEventKind {
    /// The client connected (or reconnected) and is serving fresh values.
    Ready,
    /// The connection was lost. Cached values may be outdated.
    Stale,
    /// Reconnect attempts were exhausted. Terminal.
    Error,
    /// Flag configuration changed on the backend.
    ConfigurationChanged,
}

/// A lifecycle event emitted by [`ResolutionClient`](crate::ResolutionClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEvent {
    /// What happened.
    pub kind: ProviderEventKind,
    /// Details about the cause, such as the last connection error.
    pub message: Option<String>,
    /// Keys reported as changed. Empty when the backend did not say which flags changed.
    pub flags_changed: Vec<String>,
}

impl ProviderEvent {
    /// An event of `kind` with no message and no changed flags.
    pub fn new(kind: ProviderEventKind) -> ProviderEvent {
        ProviderEvent {
            kind,
            message: None,
            flags_changed: Vec::new(),
        }
    }

    /// Attach a message to the event.
    pub fn with_message(mut self, message: impl Into<String>) -> ProviderEvent {
        self.message = Some(message.into());
        self
    }

    /// A [`ProviderEventKind::ConfigurationChanged`] event listing the changed flags.
    pub fn configuration_changed(flags_changed: Vec<String>) -> ProviderEvent {
        ProviderEvent {
            kind: ProviderEventKind::ConfigurationChanged,
            message: None,
            flags_changed,
        }
    }
}

/// Receives lifecycle events on the dispatch task.
///
/// Handlers should return quickly: events are delivered to handlers one at a time.
pub trait EventHandler {
    /// Called once for every emitted event, in emission order.
    fn on_event(&self, event: &ProviderEvent);
}

impl<T: Fn(&ProviderEvent)> EventHandler for T {
    fn on_event(&self, event: &ProviderEvent) {
        self(event);
    }
}

/// Events a slow subscriber may fall behind by before it starts missing them.
const SUBSCRIBER_BUFFER: usize = 64;

type Handlers = Vec<Arc<dyn EventHandler + Send + Sync>>;

/// Events that did not fit in the queue, in emission order.
#[derive(Default)]
struct Overflow {
    pending: VecDeque<ProviderEvent>,
    /// A forwarder task is draining `pending`. New events must queue behind it.
    forwarding: bool,
}

/// Fire-and-forget event queue with a single dispatch task.
pub struct EventEmitter {
    sender: mpsc::Sender<ProviderEvent>,
    overflow: Arc<Mutex<Overflow>>,
    /// Taken by [`EventEmitter::spawn_dispatch`].
    receiver: Mutex<Option<mpsc::Receiver<ProviderEvent>>>,
    broadcast: broadcast::Sender<ProviderEvent>,
    handlers: Arc<Handlers>,
}

impl EventEmitter {
    pub fn new(capacity: usize, handlers: Handlers) -> EventEmitter {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let (broadcast, _) = broadcast::channel(capacity.max(SUBSCRIBER_BUFFER));
        EventEmitter {
            sender,
            overflow: Arc::default(),
            receiver: Mutex::new(Some(receiver)),
            broadcast,
            handlers: Arc::new(handlers),
        }
    }

    /// Subscribe to all events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.broadcast.subscribe()
    }

    /// Queue `event` for delivery without waiting.
    ///
    /// When the queue is full, the event is parked in an overflow buffer that a single forwarder
    /// task drains into the queue. Events are delivered in the order they were emitted.
    pub fn emit(&self, event: ProviderEvent) {
        log::debug!(target: "flagd", kind:? = event.kind, flags_changed:serde = event.flags_changed; "emitting provider event");
        let mut overflow = self
            .overflow
            .lock()
            .expect("thread holding event overflow lock should not panic");
        if overflow.forwarding {
            overflow.pending.push_back(event);
            return;
        }
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    log::warn!(target: "flagd", kind:? = event.kind; "event queue is full and no runtime is available, dropping event");
                    return;
                };
                overflow.pending.push_back(event);
                overflow.forwarding = true;
                runtime.spawn(forward_overflow(
                    self.sender.clone(),
                    Arc::clone(&self.overflow),
                ));
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                log::debug!(target: "flagd", kind:? = event.kind; "event dispatcher stopped, dropping event");
            }
        }
    }

    /// Start the dispatch task. Only the first call has an effect.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_dispatch(&self) {
        let Some(mut receiver) = self
            .receiver
            .lock()
            .expect("thread holding event receiver lock should not panic")
            .take()
        else {
            return;
        };
        let handlers = Arc::clone(&self.handlers);
        let broadcast = self.broadcast.clone();

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                for handler in handlers.iter() {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        handler.on_event(&event)
                    }));
                    if result.is_err() {
                        log::warn!(target: "flagd", kind:? = event.kind; "event handler panicked");
                    }
                }
                // No subscribers is not an error.
                let _ = broadcast.send(event);
            }
            log::debug!(target: "flagd", "event dispatcher stopped");
        });
    }
}

/// Moves overflowed events into the queue one at a time until none are left.
async fn forward_overflow(sender: mpsc::Sender<ProviderEvent>, overflow: Arc<Mutex<Overflow>>) {
    loop {
        let permit = sender.reserve().await;
        let mut state = overflow
            .lock()
            .expect("thread holding event overflow lock should not panic");
        let Ok(permit) = permit else {
            log::debug!(target: "flagd", dropped = state.pending.len(); "event dispatcher stopped, dropping overflowed events");
            state.pending.clear();
            state.forwarding = false;
            return;
        };
        match state.pending.pop_front() {
            Some(event) => permit.send(event),
            None => {
                state.forwarding = false;
                return;
            }
        }
    }
}
