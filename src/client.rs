use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::ResolutionCache,
    events::{EventEmitter, ProviderEvent},
    retry::RetryCounter,
    state::{ConnectionState, ConnectionStateMachine},
    stream::ChangeStreamConsumer,
    transport::{ConnectTransport, FlagService},
    ClientConfig, Error, ErrorKind, EvaluationContext, FlagType, FlagValue, ObjectValue, Reason,
    ResolutionDetail, Result,
};

/// A client resolving flags against a remote evaluation backend.
///
/// Static results are cached locally and invalidated by a change stream the client keeps open
/// in the background. Call [`ResolutionClient::start`] to open it.
///
/// # Examples
/// ```no_run
/// # use flagd_rpc::{ClientConfig, EvaluationContext, ResolutionClient};
/// # use std::time::Duration;
/// # async fn run() -> flagd_rpc::Result<()> {
/// let client = ResolutionClient::new(ClientConfig::builder().host("localhost").build()?)?;
/// client.start()?;
/// client.wait_for_ready(Duration::from_secs(5)).await?;
///
/// let detail = client
///     .resolve_boolean("new-checkout", false, &EvaluationContext::new())
///     .await;
/// println!("{} ({:?})", detail.value, detail.reason);
///
/// client.shutdown().await
/// # }
/// ```
pub struct ResolutionClient {
    service: Arc<dyn FlagService>,
    cache: Arc<ResolutionCache>,
    state: Arc<ConnectionStateMachine>,
    events: Arc<EventEmitter>,
    stream_deadline: Option<Duration>,
    started: AtomicBool,
    /// Used to send a stop command to the change stream task.
    cancel: CancellationToken,
    stream_task: Mutex<Option<JoinHandle<()>>>,
}

impl ResolutionClient {
    /// Create a client talking to the backend over [`ConnectTransport`].
    ///
    /// # Errors
    ///
    /// Fails if the transport cannot be built from `config`. See [`ConnectTransport::new`].
    pub fn new(config: ClientConfig) -> Result<ResolutionClient> {
        let transport = ConnectTransport::new(&config)?;
        Ok(ResolutionClient::with_service(config, Arc::new(transport)))
    }

    /// Create a client using a custom [`FlagService`] implementation.
    pub fn with_service(config: ClientConfig, service: Arc<dyn FlagService>) -> ResolutionClient {
        let events = Arc::new(EventEmitter::new(
            config.event_queue_capacity.get(),
            config.event_handlers.clone(),
        ));
        let retry = RetryCounter::new(
            config.max_retry_attempts,
            config.retry_base_delay,
            config.retry_max_delay,
        );
        ResolutionClient {
            service,
            cache: Arc::new(ResolutionCache::new(config.cache, config.max_cache_size)),
            state: Arc::new(ConnectionStateMachine::new(retry, events.clone())),
            events,
            stream_deadline: config.stream_deadline,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            stream_task: Mutex::new(None),
        }
    }

    /// Spawn the change stream task and the event dispatcher onto the current tokio runtime.
    ///
    /// Calling `start` more than once has no effect.
    ///
    /// # Errors
    ///
    /// - [`Error::ShutDown`] if the client has been shut down.
    /// - [`Error::NoRuntime`] if called outside of a tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShutDown);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.events.spawn_dispatch();
        let consumer = ChangeStreamConsumer {
            service: self.service.clone(),
            state: self.state.clone(),
            cache: self.cache.clone(),
            events: self.events.clone(),
            stream_deadline: self.stream_deadline,
            cancel: self.cancel.clone(),
        };
        let task = runtime.spawn(consumer.run());
        *self
            .stream_task
            .lock()
            .expect("thread holding stream task lock should not panic") = Some(task);
        log::debug!(target: "flagd", "resolution client started");
        Ok(())
    }

    /// Wait until the first successful connect.
    ///
    /// Returns immediately if the client is already connected.
    ///
    /// # Errors
    ///
    /// - [`Error::ReadyTimeout`] if `timeout` elapses first.
    /// - [`Error::RetriesExhausted`] if the client gave up connecting.
    /// - [`Error::ShutDown`] if the client was shut down.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let ready = tokio::time::timeout(timeout, self.state.ready_signal().wait()).await;
        if self.cancel.is_cancelled() {
            return Err(Error::ShutDown);
        }
        match ready {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::RetriesExhausted),
            Err(_) => Err(Error::ReadyTimeout),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    /// Subscribe to lifecycle events emitted after this call.
    ///
    /// A subscriber that falls too far behind skips the oldest events and receives
    /// [`RecvError::Lagged`](broadcast::error::RecvError::Lagged).
    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    /// Resolve a boolean flag.
    ///
    /// Static results are served from the cache when possible. Never fails: on error, the
    /// returned detail carries `default` and an [`ErrorKind`]. The same holds for the other
    /// `resolve_*` methods.
    pub async fn resolve_boolean(
        &self,
        flag_key: &str,
        default: bool,
        context: &EvaluationContext,
    ) -> ResolutionDetail<bool> {
        self.resolve(flag_key, default, context).await
    }

    /// Resolve a string flag.
    pub async fn resolve_string(
        &self,
        flag_key: &str,
        default: impl Into<String>,
        context: &EvaluationContext,
    ) -> ResolutionDetail<String> {
        self.resolve(flag_key, default.into(), context).await
    }

    /// Resolve an integer flag.
    pub async fn resolve_int(
        &self,
        flag_key: &str,
        default: i64,
        context: &EvaluationContext,
    ) -> ResolutionDetail<i64> {
        self.resolve(flag_key, default, context).await
    }

    /// Resolve a floating point flag.
    pub async fn resolve_float(
        &self,
        flag_key: &str,
        default: f64,
        context: &EvaluationContext,
    ) -> ResolutionDetail<f64> {
        self.resolve(flag_key, default, context).await
    }

    /// Resolve a JSON object flag.
    pub async fn resolve_object(
        &self,
        flag_key: &str,
        default: ObjectValue,
        context: &EvaluationContext,
    ) -> ResolutionDetail<ObjectValue> {
        self.resolve(flag_key, default, context).await
    }

    async fn resolve<T: FlagType>(
        &self,
        flag_key: &str,
        default: T,
        context: &EvaluationContext,
    ) -> ResolutionDetail<T> {
        if let Some(hit) = self.cache.get(flag_key) {
            let cached_kind = hit.value.kind();
            let hit = hit.map(T::from_flag_value);
            if let Some(value) = hit.value {
                log::trace!(target: "flagd", flag_key, variant:? = hit.variant; "served a flag from cache");
                return ResolutionDetail {
                    value,
                    variant: hit.variant,
                    reason: Reason::Cached,
                    error_kind: None,
                    error_message: None,
                    metadata: hit.metadata,
                };
            }
            log::debug!(target: "flagd", flag_key, cached_kind:? = cached_kind, requested_kind:? = T::KIND; "cached flag has another type, resolving remotely");
        }

        // Read before the remote call: an invalidation arriving while the call is in flight
        // makes the response uncacheable.
        let generation = self.cache.generation();

        if !self.state.is_connected() {
            log::warn!(target: "flagd", flag_key; "resolving a flag before the client has connected");
            return ResolutionDetail::error(
                default,
                ErrorKind::ProviderNotReady,
                "client has not connected to the backend",
            );
        }

        let response = match self.service.resolve(T::KIND, flag_key, context).await {
            Ok(response) => response,
            Err(err) => {
                log::warn!(target: "flagd", flag_key, code:? = err.code; "error occurred while resolving a flag: {}", err.message);
                return ResolutionDetail::error(default, ErrorKind::from(err.code), err.message);
            }
        };

        let Some(value) = FlagValue::from_json(T::KIND, response.value).and_then(T::from_flag_value)
        else {
            log::warn!(target: "flagd", flag_key, requested_kind:? = T::KIND; "backend returned a value of another type");
            return ResolutionDetail::error(
                default,
                ErrorKind::TypeMismatch,
                format!("flag {flag_key:?} is not of type {}", T::KIND.as_str()),
            );
        };

        let detail = ResolutionDetail {
            value,
            variant: response.variant,
            reason: Reason::from_wire(&response.reason),
            error_kind: None,
            error_message: None,
            metadata: response.metadata,
        };
        log::trace!(target: "flagd", flag_key, reason:? = detail.reason, variant:? = detail.variant; "resolved a flag");

        if detail.reason == Reason::Static
            && self
                .cache
                .add(flag_key, detail.clone().map(T::into_flag_value), generation)
        {
            log::debug!(target: "flagd", flag_key; "evaluation cache is full, evicted least recently used flag");
        }
        detail
    }

    /// Stop the change stream task and wait for it to finish.
    ///
    /// The cache is dropped. The client stays usable: resolves return the caller's default with
    /// [`ErrorKind::ProviderNotReady`]. Calling `shutdown` more than once is safe.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamTaskPanicked`] if the task panicked.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();

        let task = self
            .stream_task
            .lock()
            .expect("thread holding stream task lock should not panic")
            .take();
        let result = match task {
            Some(task) => match task.await {
                Ok(()) => Ok(()),
                Err(err) if err.is_panic() => Err(Error::StreamTaskPanicked),
                // Cancelled by the runtime shutting down.
                Err(_) => Ok(()),
            },
            None => Ok(()),
        };

        // After the join, so a late READY from the task cannot override it.
        self.state.on_shutdown();
        // Nothing invalidates cached values once the stream is gone.
        self.cache.disable();
        log::debug!(target: "flagd", "resolution client shut down");
        result
    }
}

impl Drop for ResolutionClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
