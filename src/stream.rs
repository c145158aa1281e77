//! The change stream task.
//!
//! [`ChangeStreamConsumer`] keeps one subscription to the backend open for the client's whole
//! life. Notifications invalidate the evaluation cache and drive the connection state; failures
//! purge the cache and reconnect with exponential backoff until the retry budget runs out.
use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::ResolutionCache,
    events::{EventEmitter, ProviderEvent},
    state::{ConnectionStateMachine, FailureOutcome},
    transport::{ChangeNotification, FlagService, NotificationKind},
};

/// Why a single stream session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEnd {
    /// Shutdown was requested.
    Cancelled,
    /// The backend announced a clean close.
    Shutdown,
    /// The configured stream deadline elapsed.
    DeadlineReached,
    /// The stream could not be opened or broke.
    Failed(String),
}

pub(crate) struct ChangeStreamConsumer {
    pub service: Arc<dyn FlagService>,
    pub state: Arc<ConnectionStateMachine>,
    pub cache: Arc<ResolutionCache>,
    pub events: Arc<EventEmitter>,
    pub stream_deadline: Option<Duration>,
    pub cancel: CancellationToken,
}

impl ChangeStreamConsumer {
    /// Consume the change stream until shutdown or until retries are exhausted.
    pub async fn run(self) {
        log::debug!(target: "flagd", "change stream task started");
        loop {
            match self.session().await {
                SessionEnd::Cancelled => {
                    log::debug!(target: "flagd", "change stream task received stop command");
                    return;
                }
                SessionEnd::Shutdown => {
                    log::info!(target: "flagd", "backend closed the change stream, reconnecting");
                }
                SessionEnd::DeadlineReached => {
                    log::debug!(target: "flagd", "change stream deadline reached, reconnecting");
                }
                SessionEnd::Failed(message) => {
                    log::warn!(target: "flagd", error = message.as_str(); "change stream failed");
                    // Without a live stream nothing would invalidate cached values.
                    self.cache.purge();

                    match self.state.on_failure(&message) {
                        FailureOutcome::Retry(delay) => {
                            tokio::select! {
                                _ = self.cancel.cancelled() => {
                                    log::debug!(target: "flagd", "change stream task received stop command during backoff");
                                    return;
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        FailureOutcome::Exhausted => {
                            self.cache.disable();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Open the stream and read it until it ends.
    async fn session(&self) -> SessionEnd {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
            opened = self.service.event_stream() => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => return SessionEnd::Failed(err.to_string()),
        };

        let deadline = self.stream_deadline.map(|d| Instant::now() + d);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                _ = deadline_elapsed(deadline) => return SessionEnd::DeadlineReached,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(notification)) => {
                    if let Some(end) = self.handle(notification) {
                        return end;
                    }
                }
                Some(Err(err)) => return SessionEnd::Failed(err.to_string()),
                None => return SessionEnd::Failed("change stream closed by backend".to_owned()),
            }
        }
    }

    fn handle(&self, notification: ChangeNotification) -> Option<SessionEnd> {
        self.state.on_message();

        match notification.kind {
            NotificationKind::Ready => {
                self.state.on_ready();
                None
            }
            NotificationKind::ConfigChange => {
                self.invalidate(notification.affected_keys);
                None
            }
            NotificationKind::Shutdown => Some(SessionEnd::Shutdown),
            NotificationKind::KeepAlive => None,
        }
    }

    fn invalidate(&self, affected_keys: Option<Vec<String>>) {
        let flags_changed = match affected_keys {
            Some(keys) => {
                for key in &keys {
                    self.cache.remove(key);
                }
                keys
            }
            None => {
                self.cache.purge();
                Vec::new()
            }
        };
        log::debug!(target: "flagd", flags_changed:serde = flags_changed; "flag configuration changed");
        self.events
            .emit(ProviderEvent::configuration_changed(flags_changed));
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
