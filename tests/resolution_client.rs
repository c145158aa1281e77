use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{channel::mpsc, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, Notify};

use flagd_rpc::{
    transport::{
        ChangeNotification, Code, EventStream, FlagService, NotificationKind, ResolveResponse,
        TransportError,
    },
    ClientConfig, ConnectionState, ErrorKind, EvaluationContext, FlagKind, FlagMetadata,
    ProviderEvent, ProviderEventKind, Reason, ResolutionClient,
};

type Notifications = mpsc::UnboundedSender<Result<ChangeNotification, TransportError>>;

/// In-memory backend. Each change stream is fed by a channel the test holds; once the scripted
/// streams run out, connect attempts are refused.
struct ScriptedBackend {
    flags: HashMap<String, ResolveResponse>,
    streams: Mutex<VecDeque<EventStream>>,
    resolves: AtomicUsize,
    /// When set, the next resolve parks until `release` is notified.
    hold_next: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl ScriptedBackend {
    fn new() -> ScriptedBackend {
        ScriptedBackend {
            flags: HashMap::new(),
            streams: Mutex::new(VecDeque::new()),
            resolves: AtomicUsize::new(0),
            hold_next: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    fn static_flag(mut self, key: &str, value: serde_json::Value, variant: &str) -> Self {
        self.flags.insert(
            key.to_owned(),
            ResolveResponse {
                value,
                variant: Some(variant.to_owned()),
                reason: "STATIC".to_owned(),
                metadata: FlagMetadata::new(),
            },
        );
        self
    }

    /// Script one more change stream and return the handle that feeds it.
    fn open_stream(&self) -> Notifications {
        let (sender, receiver) = mpsc::unbounded();
        self.streams.lock().unwrap().push_back(receiver.boxed());
        sender
    }

    fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FlagService for ScriptedBackend {
    async fn resolve(
        &self,
        _kind: FlagKind,
        flag_key: &str,
        _context: &EvaluationContext,
    ) -> Result<ResolveResponse, TransportError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        if self.hold_next.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.flags.get(flag_key).cloned().ok_or_else(|| {
            TransportError::new(Code::NotFound, format!("flag '{flag_key}' not found"))
        })
    }

    async fn event_stream(&self) -> Result<EventStream, TransportError> {
        self.streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TransportError::new(Code::Unavailable, "connection refused"))
    }
}

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn client_for(backend: &Arc<ScriptedBackend>) -> ResolutionClient {
    ResolutionClient::with_service(ClientConfig::builder().build().unwrap(), backend.clone())
}

fn ready() -> Result<ChangeNotification, TransportError> {
    Ok(ChangeNotification::new(NotificationKind::Ready))
}

async fn next_event(events: &mut broadcast::Receiver<ProviderEvent>) -> ProviderEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event should arrive")
        .expect("subscriber should not lag")
}

#[tokio::test]
async fn resolving_before_first_connect_returns_default() {
    init();
    let backend = Arc::new(ScriptedBackend::new().static_flag("f", json!(true), "on"));
    let client = client_for(&backend);

    let detail = client
        .resolve_boolean("f", false, &EvaluationContext::new())
        .await;

    assert!(!detail.value);
    assert_eq!(detail.reason, Reason::Error);
    assert_eq!(detail.error_kind, Some(ErrorKind::ProviderNotReady));
    assert_eq!(backend.resolves(), 0);
}

#[tokio::test]
async fn config_change_evicts_cached_flag() {
    init();
    let backend = Arc::new(
        ScriptedBackend::new()
            .static_flag("f", json!(true), "on")
            .static_flag("g", json!("blue"), "blue"),
    );
    let stream = backend.open_stream();
    let client = client_for(&backend);
    let mut events = client.subscribe();
    let context = EvaluationContext::new();

    client.start().unwrap();
    stream.unbounded_send(ready()).unwrap();
    client.wait_for_ready(Duration::from_secs(5)).await.unwrap();
    assert_eq!(next_event(&mut events).await.kind, ProviderEventKind::Ready);

    let f = client.resolve_boolean("f", false, &context).await;
    let g = client.resolve_string("g", "red", &context).await;
    assert_eq!((f.reason, g.reason), (Reason::Static, Reason::Static));
    let f = client.resolve_boolean("f", false, &context).await;
    assert_eq!(f.reason, Reason::Cached);
    assert_eq!(backend.resolves(), 2);

    stream
        .unbounded_send(Ok(ChangeNotification::config_change(Some(vec![
            "f".to_owned()
        ]))))
        .unwrap();
    let change = next_event(&mut events).await;
    assert_eq!(change.kind, ProviderEventKind::ConfigurationChanged);
    assert_eq!(change.flags_changed, vec!["f".to_owned()]);

    let f = client.resolve_boolean("f", false, &context).await;
    assert_eq!(f.reason, Reason::Static);
    assert!(f.value);
    let g = client.resolve_string("g", "red", &context).await;
    assert_eq!(g.reason, Reason::Cached);
    assert_eq!(backend.resolves(), 3);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn static_value_is_served_from_cache_on_second_call() {
    init();
    let backend = Arc::new(ScriptedBackend::new().static_flag("f", json!(true), "on"));
    let stream = backend.open_stream();
    let client = client_for(&backend);

    client.start().unwrap();
    stream.unbounded_send(ready()).unwrap();
    client.wait_for_ready(Duration::from_secs(5)).await.unwrap();

    let first = client
        .resolve_boolean("f", false, &EvaluationContext::new())
        .await;
    let second = client
        .resolve_boolean("f", false, &EvaluationContext::new())
        .await;

    assert_eq!((first.value, first.reason), (true, Reason::Static));
    assert_eq!((second.value, second.reason), (true, Reason::Cached));
    assert_eq!(first.variant, second.variant);
    assert_eq!(backend.resolves(), 1);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_emit_one_error_and_disable_cache() {
    init();
    let backend = Arc::new(ScriptedBackend::new().static_flag("f", json!(true), "on"));
    let stream = backend.open_stream();
    let handled = Arc::new(Mutex::new(Vec::new()));
    let config = {
        let handled = handled.clone();
        ClientConfig::builder()
            .max_retry_attempts(2)
            .retry_backoff(Duration::from_millis(10), Duration::from_millis(40))
            .event_handler(move |event: &ProviderEvent| handled.lock().unwrap().push(event.kind))
            .build()
            .unwrap()
    };
    let client = ResolutionClient::with_service(config, backend.clone());
    let mut events = client.subscribe();
    let context = EvaluationContext::new();

    client.start().unwrap();
    stream.unbounded_send(ready()).unwrap();
    client.wait_for_ready(Duration::from_secs(5)).await.unwrap();
    assert_eq!(next_event(&mut events).await.kind, ProviderEventKind::Ready);
    client.resolve_boolean("f", false, &context).await;
    let cached = client.resolve_boolean("f", false, &context).await;
    assert_eq!(cached.reason, Reason::Cached);

    // Ending the stream without a shutdown notice is a failure. Every reconnect is refused.
    drop(stream);

    assert_eq!(next_event(&mut events).await.kind, ProviderEventKind::Stale);
    let error = next_event(&mut events).await;
    assert_eq!(error.kind, ProviderEventKind::Error);
    assert!(error.message.unwrap().contains("connection refused"));
    assert_eq!(client.state(), ConnectionState::Error);

    // Defaults and remote values are still served, but nothing is cached anymore.
    let resolves = backend.resolves();
    for _ in 0..2 {
        let detail = client.resolve_boolean("f", false, &context).await;
        assert_eq!(detail.reason, Reason::Static);
    }
    assert_eq!(backend.resolves(), resolves + 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(
        *handled.lock().unwrap(),
        vec![
            ProviderEventKind::Ready,
            ProviderEventKind::Stale,
            ProviderEventKind::Error
        ]
    );

    client.shutdown().await.unwrap();
    assert_eq!(client.state(), ConnectionState::NotReady);
}

#[tokio::test]
async fn unknown_flag_returns_default_with_flag_not_found() {
    init();
    let backend = Arc::new(ScriptedBackend::new());
    let stream = backend.open_stream();
    let client = client_for(&backend);

    client.start().unwrap();
    stream.unbounded_send(ready()).unwrap();
    client.wait_for_ready(Duration::from_secs(5)).await.unwrap();

    let detail = client
        .resolve_string("missing", "default", &EvaluationContext::new())
        .await;

    assert_eq!(detail.value, "default");
    assert_eq!(detail.reason, Reason::Error);
    assert_eq!(detail.error_kind, Some(ErrorKind::FlagNotFound));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn backend_shutdown_notice_reconnects_without_stale() {
    init();
    let backend = Arc::new(ScriptedBackend::new());
    let first = backend.open_stream();
    let second = backend.open_stream();
    let client = client_for(&backend);
    let mut events = client.subscribe();

    client.start().unwrap();
    first.unbounded_send(ready()).unwrap();
    assert_eq!(next_event(&mut events).await.kind, ProviderEventKind::Ready);

    first
        .unbounded_send(Ok(ChangeNotification::new(NotificationKind::Shutdown)))
        .unwrap();
    second.unbounded_send(ready()).unwrap();
    second
        .unbounded_send(Ok(ChangeNotification::config_change(None)))
        .unwrap();

    // The reconnect is silent: the next event comes from the second stream.
    let change = next_event(&mut events).await;
    assert_eq!(change.kind, ProviderEventKind::ConfigurationChanged);
    assert!(change.flags_changed.is_empty());
    assert_eq!(client.state(), ConnectionState::Ready);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn response_racing_with_config_change_is_not_cached() {
    init();
    let backend = Arc::new(ScriptedBackend::new().static_flag("f", json!(true), "on"));
    let stream = backend.open_stream();
    let client = Arc::new(client_for(&backend));
    let mut events = client.subscribe();

    client.start().unwrap();
    stream.unbounded_send(ready()).unwrap();
    client.wait_for_ready(Duration::from_secs(5)).await.unwrap();
    assert_eq!(next_event(&mut events).await.kind, ProviderEventKind::Ready);

    backend.hold_next.store(true, Ordering::SeqCst);
    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .resolve_boolean("f", false, &EvaluationContext::new())
                .await
        })
    };
    backend.entered.notified().await;

    stream
        .unbounded_send(Ok(ChangeNotification::config_change(Some(vec![
            "f".to_owned()
        ]))))
        .unwrap();
    assert_eq!(
        next_event(&mut events).await.kind,
        ProviderEventKind::ConfigurationChanged
    );
    backend.release.notify_one();

    // The response fetched before the change is still returned to its caller...
    assert_eq!(in_flight.await.unwrap().reason, Reason::Static);
    // ...but it must not be served from cache afterwards.
    let next = client
        .resolve_boolean("f", false, &EvaluationContext::new())
        .await;
    assert_eq!(next.reason, Reason::Static);
    assert_eq!(backend.resolves(), 2);

    client.shutdown().await.unwrap();
}
