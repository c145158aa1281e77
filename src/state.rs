//! Connection readiness tracking.
//!
//! [`ConnectionStateMachine`] is the only writer of [`ConnectionState`]. It keeps the
//! [`RetryCounter`] under the same lock so that readers never observe a state that disagrees with
//! the retry bookkeeping, and it emits exactly one [`ProviderEvent`] per state change.
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Serialize;
use tokio::sync::watch;

use crate::{
    events::{EventEmitter, ProviderEvent, ProviderEventKind},
    retry::RetryCounter,
};

/// Readiness of the connection to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Not connected yet, or shut down.
    NotReady,
    /// Connected and receiving change notifications.
    Ready,
    /// Connection lost after having been ready. Reconnecting.
    Stale,
    /// Reconnect attempts exhausted.
    Error,
}

/// What the change stream should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Wait for the given delay, then reconnect.
    Retry(Duration),
    /// Give up. The client is now in [`ConnectionState::Error`].
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed,
}

/// One-shot notification of the first successful connect.
///
/// Firing is idempotent: only the first call has an observable effect.
pub struct ReadySignal {
    readiness: watch::Sender<Readiness>,
}

impl ReadySignal {
    pub fn new() -> ReadySignal {
        let (readiness, _) = watch::channel(Readiness::Pending);
        ReadySignal { readiness }
    }

    /// Mark the client ready. Returns `true` only for the call that actually fired the signal.
    pub fn fire(&self) -> bool {
        self.readiness.send_if_modified(|readiness| {
            if *readiness == Readiness::Pending {
                *readiness = Readiness::Ready;
                true
            } else {
                false
            }
        })
    }

    /// Release waiters with a failure. Has no effect once the signal has fired.
    pub fn fail(&self) -> bool {
        self.readiness.send_if_modified(|readiness| {
            if *readiness == Readiness::Pending {
                *readiness = Readiness::Failed;
                true
            } else {
                false
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.readiness.borrow() == Readiness::Ready
    }

    /// Wait until the signal fires or fails. Returns `true` if the client became ready.
    pub async fn wait(&self) -> bool {
        let mut receiver = self.readiness.subscribe();
        let result = receiver
            .wait_for(|readiness| *readiness != Readiness::Pending)
            .await
            .map(|readiness| *readiness == Readiness::Ready);
        // The sender lives as long as `self`, so the channel cannot close while we wait.
        result.unwrap_or(false)
    }
}

impl Default for ReadySignal {
    fn default() -> Self {
        ReadySignal::new()
    }
}

struct Inner {
    state: ConnectionState,
    retry: RetryCounter,
}

/// Tracks [`ConnectionState`] and reports transitions as lifecycle events.
pub struct ConnectionStateMachine {
    inner: Mutex<Inner>,
    ready: ReadySignal,
    events: Arc<EventEmitter>,
}

impl ConnectionStateMachine {
    pub fn new(retry: RetryCounter, events: Arc<EventEmitter>) -> ConnectionStateMachine {
        ConnectionStateMachine {
            inner: Mutex::new(Inner {
                state: ConnectionState::NotReady,
                retry,
            }),
            ready: ReadySignal::new(),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .expect("thread holding connection state lock should not panic")
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Returns `true` once the first connect has completed and the client has not been shut down.
    pub fn is_connected(&self) -> bool {
        let inner = self.lock();
        self.ready.is_fired() && inner.state != ConnectionState::NotReady
    }

    pub fn ready_signal(&self) -> &ReadySignal {
        &self.ready
    }

    /// Any healthy message from the stream resets the backoff.
    pub fn on_message(&self) {
        self.lock().retry.reset();
    }

    /// The backend reported readiness. Returns `true` if this caused a transition.
    pub fn on_ready(&self) -> bool {
        let mut inner = self.lock();
        inner.retry.reset();
        if inner.state == ConnectionState::Ready {
            return false;
        }

        let previous = std::mem::replace(&mut inner.state, ConnectionState::Ready);
        log::info!(target: "flagd", previous:? = previous; "connection ready");
        self.events.emit(ProviderEvent::new(ProviderEventKind::Ready));
        if self.ready.fire() {
            log::debug!(target: "flagd", "first connect completed");
        }
        true
    }

    /// The stream or the connect attempt failed.
    ///
    /// Moves a ready connection to [`ConnectionState::Stale`], then consults the retry counter.
    /// On exhaustion the state becomes [`ConnectionState::Error`] and a single error event is
    /// emitted.
    pub fn on_failure(&self, message: &str) -> FailureOutcome {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Ready {
            inner.state = ConnectionState::Stale;
            log::warn!(target: "flagd", error = message; "connection lost, cached values may be stale");
            self.events
                .emit(ProviderEvent::new(ProviderEventKind::Stale).with_message(message));
        }

        if inner.retry.retry() {
            let delay = inner.retry.sleep();
            log::debug!(target: "flagd", attempt = inner.retry.attempt(), delay:? = delay; "scheduling reconnect");
            return FailureOutcome::Retry(delay);
        }

        inner.state = ConnectionState::Error;
        log::error!(target: "flagd", attempts = inner.retry.attempt() - 1, error = message; "giving up on the change stream");
        self.events.emit(
            ProviderEvent::new(ProviderEventKind::Error)
                .with_message(format!("retries exhausted: {message}")),
        );
        self.ready.fail();
        FailureOutcome::Exhausted
    }

    /// Force [`ConnectionState::NotReady`]. Emits nothing.
    pub fn on_shutdown(&self) {
        let mut inner = self.lock();
        inner.state = ConnectionState::NotReady;
        inner.retry.reset();
        self.ready.fail();
    }
}
