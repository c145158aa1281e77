use std::{fmt, num::NonZeroUsize, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{events::EventHandler, Error, Result};

/// Which store backs the evaluation cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    /// Bounded least-recently-used cache.
    #[default]
    Lru,
    /// Unbounded in-memory map.
    #[serde(rename = "mem")]
    InMemory,
    /// No caching.
    Disabled,
}

impl FromStr for CacheKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<CacheKind> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(CacheKind::Lru),
            "mem" | "memory" | "in-memory" => Ok(CacheKind::InMemory),
            "disabled" | "none" => Ok(CacheKind::Disabled),
            _ => Err(Error::InvalidConfiguration("unknown cache kind")),
        }
    }
}

/// Configuration for [`ResolutionClient`](crate::ResolutionClient).
///
/// The configuration is immutable once built. Use [`ClientConfig::builder()`] to create one.
///
/// ```
/// # use flagd_rpc::{CacheKind, ClientConfig};
/// # use std::time::Duration;
/// let config = ClientConfig::builder()
///     .host("flagd.internal")
///     .port(8013)
///     .cache(CacheKind::Lru)
///     .max_retry_attempts(10)
///     .retry_backoff(Duration::from_millis(500), Duration::from_secs(30))
///     .build()
///     .unwrap();
/// assert_eq!(config.port(), 8013);
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) socket_path: Option<String>,
    pub(crate) tls: bool,
    pub(crate) cert_path: Option<PathBuf>,
    pub(crate) deadline: Duration,
    pub(crate) stream_deadline: Option<Duration>,
    pub(crate) max_retry_attempts: u32,
    pub(crate) retry_base_delay: Duration,
    pub(crate) retry_max_delay: Duration,
    pub(crate) cache: CacheKind,
    pub(crate) max_cache_size: NonZeroUsize,
    pub(crate) event_queue_capacity: NonZeroUsize,
    pub(crate) event_handlers: Vec<Arc<dyn EventHandler + Send + Sync>>,
}

impl ClientConfig {
    /// Default backend host.
    pub const DEFAULT_HOST: &'static str = "localhost";
    /// Default backend port.
    pub const DEFAULT_PORT: u16 = 8013;
    /// Default deadline of a single resolve call.
    pub const DEFAULT_DEADLINE: Duration = Duration::from_millis(500);
    /// Default number of consecutive stream failures tolerated before giving up.
    pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;
    /// Default delay before the first reconnect.
    pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
    /// Default upper bound of the reconnect delay.
    pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(120);
    /// Default capacity of the LRU cache.
    pub const DEFAULT_MAX_CACHE_SIZE: usize = 1000;
    /// Default capacity of the lifecycle event queue.
    pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 16;

    /// Create a builder pre-populated with default values.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Backend host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Backend port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Unix socket the backend listens on. Takes precedence over host and port.
    pub fn socket_path(&self) -> Option<&str> {
        self.socket_path.as_deref()
    }

    /// Whether the TCP connection uses TLS.
    pub fn tls(&self) -> bool {
        self.tls
    }

    /// Store backing the evaluation cache.
    pub fn cache(&self) -> CacheKind {
        self.cache
    }

    /// Consecutive stream failures tolerated before the client gives up.
    pub fn max_retry_attempts(&self) -> u32 {
        self.max_retry_attempts
    }

    /// Base URL of the backend, derived from host, port and TLS settings.
    pub fn endpoint(&self) -> Result<Url> {
        let scheme = if self.tls { "https" } else { "http" };
        Url::parse(&format!("{}://{}:{}/", scheme, self.host, self.port))
            .map_err(Error::InvalidEndpoint)
    }
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfigBuilder::new().into_config()
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("socket_path", &self.socket_path)
            .field("tls", &self.tls)
            .field("cert_path", &self.cert_path)
            .field("deadline", &self.deadline)
            .field("stream_deadline", &self.stream_deadline)
            .field("max_retry_attempts", &self.max_retry_attempts)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("retry_max_delay", &self.retry_max_delay)
            .field("cache", &self.cache)
            .field("max_cache_size", &self.max_cache_size)
            .field("event_queue_capacity", &self.event_queue_capacity)
            .field("event_handlers", &self.event_handlers.len())
            .finish()
    }
}

/// Builder for [`ClientConfig`].
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    fn new() -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: ClientConfig {
                host: ClientConfig::DEFAULT_HOST.to_owned(),
                port: ClientConfig::DEFAULT_PORT,
                socket_path: None,
                tls: false,
                cert_path: None,
                deadline: ClientConfig::DEFAULT_DEADLINE,
                stream_deadline: None,
                max_retry_attempts: ClientConfig::DEFAULT_MAX_RETRY_ATTEMPTS,
                retry_base_delay: ClientConfig::DEFAULT_RETRY_BASE_DELAY,
                retry_max_delay: ClientConfig::DEFAULT_RETRY_MAX_DELAY,
                cache: CacheKind::default(),
                max_cache_size: NonZeroUsize::new(ClientConfig::DEFAULT_MAX_CACHE_SIZE)
                    .unwrap_or(NonZeroUsize::MIN),
                event_queue_capacity: NonZeroUsize::new(ClientConfig::DEFAULT_EVENT_QUEUE_CAPACITY)
                    .unwrap_or(NonZeroUsize::MIN),
                event_handlers: Vec::new(),
            },
        }
    }

    /// Backend host name or address. Defaults to [`ClientConfig::DEFAULT_HOST`].
    pub fn host(&mut self, host: impl Into<String>) -> &mut Self {
        self.config.host = host.into();
        self
    }

    /// Backend port. Defaults to [`ClientConfig::DEFAULT_PORT`].
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.config.port = port;
        self
    }

    /// Connect through a unix socket instead of host/port. Only available on unix platforms.
    pub fn socket_path(&mut self, socket_path: impl Into<String>) -> &mut Self {
        self.config.socket_path = Some(socket_path.into());
        self
    }

    /// Use TLS with the system trust roots. Disabled by default.
    pub fn tls(&mut self, tls: bool) -> &mut Self {
        self.config.tls = tls;
        self
    }

    /// Trust the PEM certificate at `cert_path` in addition to the system roots. Implies TLS.
    pub fn cert_path(&mut self, cert_path: impl Into<PathBuf>) -> &mut Self {
        self.config.cert_path = Some(cert_path.into());
        self.config.tls = true;
        self
    }

    /// Deadline of each resolve call, enforced by the transport.
    pub fn deadline(&mut self, deadline: Duration) -> &mut Self {
        self.config.deadline = deadline;
        self
    }

    /// Reopen the change stream after `deadline` even if it is healthy.
    pub fn stream_deadline(&mut self, deadline: Duration) -> &mut Self {
        self.config.stream_deadline = Some(deadline);
        self
    }

    /// Consecutive stream failures tolerated before the client moves to the error state.
    pub fn max_retry_attempts(&mut self, attempts: u32) -> &mut Self {
        self.config.max_retry_attempts = attempts;
        self
    }

    /// Reconnect delays start at `base` and double up to `max`.
    pub fn retry_backoff(&mut self, base: Duration, max: Duration) -> &mut Self {
        self.config.retry_base_delay = base;
        self.config.retry_max_delay = max;
        self
    }

    /// Store backing the evaluation cache. Defaults to [`CacheKind::Lru`].
    pub fn cache(&mut self, cache: CacheKind) -> &mut Self {
        self.config.cache = cache;
        self
    }

    /// Capacity of the [`CacheKind::Lru`] cache.
    pub fn max_cache_size(&mut self, size: NonZeroUsize) -> &mut Self {
        self.config.max_cache_size = size;
        self
    }

    /// Events queued for handlers before further events wait in an overflow buffer.
    pub fn event_queue_capacity(&mut self, capacity: NonZeroUsize) -> &mut Self {
        self.config.event_queue_capacity = capacity;
        self
    }

    /// Register a handler that receives every lifecycle event.
    ///
    /// ```
    /// # use flagd_rpc::ClientConfig;
    /// let config = ClientConfig::builder()
    ///     .event_handler(|event: &flagd_rpc::ProviderEvent| println!("{:?}", event))
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn event_handler(&mut self, handler: impl EventHandler + Send + Sync + 'static) -> &mut Self {
        self.config.event_handlers.push(Arc::new(handler));
        self
    }

    /// Validate and build the configuration.
    pub fn build(&self) -> Result<ClientConfig> {
        let config = &self.config;
        if config.retry_base_delay > config.retry_max_delay {
            return Err(Error::InvalidConfiguration(
                "retry base delay exceeds retry max delay",
            ));
        }
        if config.deadline.is_zero() {
            return Err(Error::InvalidConfiguration("deadline must be positive"));
        }
        if config.stream_deadline.is_some_and(|d| d.is_zero()) {
            return Err(Error::InvalidConfiguration("stream deadline must be positive"));
        }
        if config.host.is_empty() && config.socket_path.is_none() {
            return Err(Error::InvalidConfiguration("host must not be empty"));
        }
        Ok(config.clone())
    }

    fn into_config(self) -> ClientConfig {
        self.config
    }
}
