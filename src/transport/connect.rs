//! Connect protocol client for the `flagd.evaluation.v1.Service` API.
//!
//! Unary calls are plain JSON POST requests. The change stream is a server-streaming call whose
//! request and response bodies are sequences of [envelopes](super::frame). Requests go over TCP
//! (optionally TLS) or, on unix platforms, over a unix domain socket.
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, StreamExt};
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{
    frame::{self, Frame, FrameDecoder},
    ChangeNotification, Code, EventStream, FlagService, NotificationKind, ResolveResponse,
    TransportError,
};
use crate::{ClientConfig, Error, EvaluationContext, FlagKind, FlagMetadata, Result};

const SERVICE: &str = "flagd.evaluation.v1.Service";

const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_STREAM_JSON: &str = "application/connect+json";
const PROTOCOL_VERSION_HEADER: &str = "connect-protocol-version";
const TIMEOUT_HEADER: &str = "connect-timeout-ms";

/// HTTP client speaking the Connect protocol with a JSON codec.
pub struct ConnectTransport {
    channel: Channel,
    deadline: Duration,
}

enum Channel {
    Tcp {
        // Client holds a connection pool internally, so we're reusing it between requests.
        client: reqwest::Client,
        base_url: Url,
    },
    #[cfg(unix)]
    Unix { socket_path: PathBuf },
}

/// Status and body of a response, independent of the channel it came from.
struct Reply {
    status: StatusCode,
    body: BoxStream<'static, std::result::Result<Bytes, TransportError>>,
}

impl Reply {
    async fn into_bytes(mut self) -> std::result::Result<Bytes, TransportError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

impl ConnectTransport {
    /// Create a transport for the endpoint described by `config`.
    ///
    /// A configured socket path takes precedence over host and port.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedSocket`] if a socket path is configured on a platform without unix
    ///   sockets.
    /// - [`Error::InvalidEndpoint`] if host and port do not form a valid URL.
    /// - [`Error::Io`] or [`Error::InvalidCertificate`] if the TLS trust root cannot be loaded.
    pub fn new(config: &ClientConfig) -> Result<ConnectTransport> {
        let channel = match &config.socket_path {
            Some(socket_path) => unix_channel(socket_path)?,
            None => tcp_channel(config)?,
        };
        Ok(ConnectTransport {
            channel,
            deadline: config.deadline,
        })
    }

    /// POST `body` to `method`. `timeout` is only advertised to the server; callers enforce it.
    async fn post(
        &self,
        method: &str,
        content_type: &'static str,
        timeout: Option<Duration>,
        body: Bytes,
    ) -> std::result::Result<Reply, TransportError> {
        match &self.channel {
            Channel::Tcp { client, base_url } => {
                let url = base_url
                    .join(&format!("{SERVICE}/{method}"))
                    .map_err(|err| TransportError::new(Code::Internal, err.to_string()))?;
                let mut request = client
                    .post(url)
                    .header(header::CONTENT_TYPE, content_type)
                    .header(PROTOCOL_VERSION_HEADER, "1")
                    .body(body);
                if let Some(timeout) = timeout {
                    request = request.header(TIMEOUT_HEADER, timeout.as_millis().to_string());
                }
                let response = request.send().await?;
                Ok(Reply {
                    status: response.status(),
                    body: response
                        .bytes_stream()
                        .map(|chunk| chunk.map_err(TransportError::from))
                        .boxed(),
                })
            }
            #[cfg(unix)]
            Channel::Unix { socket_path } => {
                post_unix(socket_path, method, content_type, timeout, body).await
            }
        }
    }
}

fn tcp_channel(config: &ClientConfig) -> Result<Channel> {
    let base_url = config.endpoint()?;

    // No client-wide timeout: it would cut the long-lived change stream. Unary calls set
    // their own deadline per request.
    let mut builder = reqwest::Client::builder();
    if let Some(cert_path) = &config.cert_path {
        let pem = std::fs::read(cert_path)?;
        let certificate = reqwest::Certificate::from_pem(&pem)
            .map_err(|err| Error::InvalidCertificate(err.to_string()))?;
        builder = builder.add_root_certificate(certificate);
    }
    let client = builder.build()?;

    log::debug!(target: "flagd", endpoint:display = base_url, tls = config.tls; "created connect transport");
    Ok(Channel::Tcp { client, base_url })
}

#[cfg(unix)]
fn unix_channel(socket_path: &str) -> Result<Channel> {
    log::debug!(target: "flagd", socket_path; "created connect transport over unix socket");
    Ok(Channel::Unix {
        socket_path: PathBuf::from(socket_path),
    })
}

#[cfg(not(unix))]
fn unix_channel(socket_path: &str) -> Result<Channel> {
    Err(Error::UnsupportedSocket(socket_path.to_owned()))
}

#[cfg(unix)]
fn unavailable(err: impl std::fmt::Display) -> TransportError {
    TransportError::new(Code::Unavailable, err.to_string())
}

/// One HTTP/1.1 request on a fresh unix socket connection.
#[cfg(unix)]
async fn post_unix(
    socket_path: &Path,
    method: &str,
    content_type: &'static str,
    timeout: Option<Duration>,
    body: Bytes,
) -> std::result::Result<Reply, TransportError> {
    use http_body_util::{BodyExt, Full};
    use hyper_util::rt::TokioIo;

    let stream = tokio::net::UnixStream::connect(socket_path)
        .await
        .map_err(unavailable)?;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(unavailable)?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            log::debug!(target: "flagd", error:display = err; "unix socket connection failed");
        }
    });

    let mut request = hyper::Request::post(format!("/{SERVICE}/{method}"))
        .header(header::HOST, "localhost")
        .header(header::CONTENT_TYPE, content_type)
        .header(PROTOCOL_VERSION_HEADER, "1");
    if let Some(timeout) = timeout {
        request = request.header(TIMEOUT_HEADER, timeout.as_millis().to_string());
    }
    let request = request
        .body(Full::new(body))
        .map_err(|err| TransportError::new(Code::Internal, err.to_string()))?;

    let response = sender.send_request(request).await.map_err(unavailable)?;
    Ok(Reply {
        status: response.status(),
        body: response
            .into_body()
            .into_data_stream()
            .map(|chunk| chunk.map_err(unavailable))
            .boxed(),
    })
}

fn method_name(kind: FlagKind) -> &'static str {
    match kind {
        FlagKind::Boolean => "ResolveBoolean",
        FlagKind::String => "ResolveString",
        FlagKind::Int => "ResolveInt",
        FlagKind::Float => "ResolveFloat",
        FlagKind::Object => "ResolveObject",
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResolveRequestWire<'a> {
    flag_key: &'a str,
    context: &'a EvaluationContext,
}

// Proto3 JSON omits fields holding default values, so every field is optional.
#[derive(Debug, Deserialize)]
struct ResolveResponseWire {
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    variant: Option<String>,
    #[serde(default)]
    metadata: Option<FlagMetadata>,
}

#[derive(Debug, Deserialize)]
struct ErrorWire {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndStreamWire {
    #[serde(default)]
    error: Option<ErrorWire>,
}

#[derive(Debug, Deserialize)]
struct EventWire {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<serde_json::Map<String, serde_json::Value>>,
}

/// The value proto3 JSON leaves out for each flag type.
fn omitted_value(kind: FlagKind) -> serde_json::Value {
    match kind {
        FlagKind::Boolean => serde_json::Value::Bool(false),
        FlagKind::String => serde_json::Value::String(String::new()),
        FlagKind::Int | FlagKind::Float => serde_json::Value::from(0),
        FlagKind::Object => serde_json::Value::Object(serde_json::Map::new()),
    }
}

fn error_from_wire(wire: ErrorWire, fallback: Code) -> TransportError {
    let code = wire.code.as_deref().map_or(fallback, Code::from_wire);
    TransportError::new(code, wire.message.unwrap_or_default())
}

/// Turn a non-success response into an error, preferring the Connect error body.
async fn error_from_response(reply: Reply) -> TransportError {
    let status = reply.status;
    let fallback = Code::from_http_status(status.as_u16());
    let wire = reply
        .into_bytes()
        .await
        .ok()
        .and_then(|body| serde_json::from_slice::<ErrorWire>(&body).ok());
    match wire {
        Some(wire) => error_from_wire(wire, fallback),
        None => TransportError::new(fallback, format!("unexpected HTTP status {status}")),
    }
}

/// Interpret one message of the change stream. Unknown message types yield `None`.
fn parse_event(payload: &[u8]) -> std::result::Result<Option<ChangeNotification>, TransportError> {
    let event: EventWire = serde_json::from_slice(payload)
        .map_err(|err| TransportError::new(Code::DataLoss, err.to_string()))?;

    let notification = match event.kind.as_str() {
        "provider_ready" => ChangeNotification::new(NotificationKind::Ready),
        "configuration_change" => {
            let affected_keys = event
                .data
                .as_ref()
                .and_then(|data| data.get("flags"))
                .and_then(|flags| flags.as_object())
                .map(|flags| flags.keys().cloned().collect());
            ChangeNotification::config_change(affected_keys)
        }
        "provider_shutdown" => ChangeNotification::new(NotificationKind::Shutdown),
        "keep_alive" => ChangeNotification::new(NotificationKind::KeepAlive),
        other => {
            log::debug!(target: "flagd", event_type = other; "ignoring unknown stream event");
            return Ok(None);
        }
    };
    Ok(Some(notification))
}

/// Interpret the end-of-stream message. Returns the error it carries, if any.
fn parse_end_stream(payload: &[u8]) -> Option<TransportError> {
    if payload.is_empty() {
        return None;
    }
    match serde_json::from_slice::<EndStreamWire>(payload) {
        Ok(end) => end.error.map(|err| error_from_wire(err, Code::Unknown)),
        Err(err) => Some(TransportError::new(Code::DataLoss, err.to_string())),
    }
}

enum Step {
    Yield(std::result::Result<ChangeNotification, TransportError>),
    Skip,
    End,
}

fn step(frame: Frame) -> Step {
    if frame.is_end_stream() {
        return match parse_end_stream(&frame.payload) {
            Some(err) => Step::Yield(Err(err)),
            None => Step::End,
        };
    }
    match parse_event(&frame.payload) {
        Ok(Some(notification)) => Step::Yield(Ok(notification)),
        Ok(None) => Step::Skip,
        Err(err) => Step::Yield(Err(err)),
    }
}

struct StreamState<B> {
    body: B,
    decoder: FrameDecoder,
    done: bool,
}

/// Decode a streaming response body into change notifications.
///
/// The stream stops after the first error or after the end-of-stream message.
fn decode_stream<B>(body: B) -> EventStream
where
    B: futures::Stream<Item = std::result::Result<Bytes, TransportError>> + Send + Unpin + 'static,
{
    let state = StreamState {
        body,
        decoder: FrameDecoder::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            match state.decoder.next_frame() {
                Ok(Some(frame)) => match step(frame) {
                    Step::Yield(item) => {
                        state.done = item.is_err();
                        return Some((item, state));
                    }
                    Step::Skip => continue,
                    Step::End => return None,
                },
                Ok(None) => {}
                Err(err) => {
                    state.done = true;
                    return Some((Err(err), state));
                }
            }

            match state.body.next().await {
                Some(Ok(chunk)) => state.decoder.extend(&chunk),
                Some(Err(err)) => {
                    state.done = true;
                    return Some((Err(err), state));
                }
                None if state.decoder.has_partial() => {
                    state.done = true;
                    let err = TransportError::new(Code::DataLoss, "stream ended inside a message");
                    return Some((Err(err), state));
                }
                None => return None,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl FlagService for ConnectTransport {
    async fn resolve(
        &self,
        kind: FlagKind,
        flag_key: &str,
        context: &EvaluationContext,
    ) -> std::result::Result<ResolveResponse, TransportError> {
        let request = serde_json::to_vec(&ResolveRequestWire { flag_key, context })
            .map_err(|err| TransportError::new(Code::Internal, err.to_string()))?;

        log::trace!(target: "flagd", flag_key, flag_type = kind.as_str(); "resolving flag");
        let call = async {
            let reply = self
                .post(
                    method_name(kind),
                    CONTENT_TYPE_JSON,
                    Some(self.deadline),
                    request.into(),
                )
                .await?;
            if reply.status != StatusCode::OK {
                return Err(error_from_response(reply).await);
            }
            reply.into_bytes().await
        };
        let body = tokio::time::timeout(self.deadline, call)
            .await
            .map_err(|_| TransportError::new(Code::DeadlineExceeded, "deadline exceeded"))??;

        let wire: ResolveResponseWire = serde_json::from_slice(&body)
            .map_err(|err| TransportError::new(Code::DataLoss, err.to_string()))?;

        Ok(ResolveResponse {
            value: wire.value.unwrap_or_else(|| omitted_value(kind)),
            variant: wire.variant,
            reason: wire.reason.unwrap_or_default(),
            metadata: wire.metadata.unwrap_or_default(),
        })
    }

    async fn event_stream(&self) -> std::result::Result<EventStream, TransportError> {
        log::debug!(target: "flagd", "opening change stream");
        let reply = self
            .post(
                "EventStream",
                CONTENT_TYPE_STREAM_JSON,
                None,
                frame::encode(0, b"{}"),
            )
            .await?;

        if reply.status != StatusCode::OK {
            return Err(error_from_response(reply).await);
        }

        Ok(decode_stream(reply.body))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::{decode_stream, parse_event, ConnectTransport};
    use crate::{
        transport::{
            frame, ChangeNotification, Code, FlagService, NotificationKind, TransportError,
        },
        ClientConfig, EvaluationContext, FlagKind,
    };

    fn transport_for(server: &MockServer) -> ConnectTransport {
        let address = server.address();
        let config = ClientConfig::builder()
            .host(address.ip().to_string())
            .port(address.port())
            .build()
            .unwrap();
        ConnectTransport::new(&config).unwrap()
    }

    fn body_of(
        chunks: Vec<&'static [u8]>,
    ) -> futures::stream::BoxStream<'static, Result<bytes::Bytes, TransportError>> {
        futures::stream::iter(chunks.into_iter().map(|c| Ok(bytes::Bytes::from_static(c)))).boxed()
    }

    #[test]
    fn configuration_change_lists_flag_keys() {
        let payload = json!({
            "type": "configuration_change",
            "data": {"flags": {"a": {"type": "update"}, "b": {"type": "delete"}}}
        });

        let notification = parse_event(payload.to_string().as_bytes()).unwrap().unwrap();

        let mut keys = notification.affected_keys.unwrap();
        keys.sort();
        assert_eq!(notification.kind, NotificationKind::ConfigChange);
        assert_eq!(keys, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn configuration_change_without_flags_affects_everything() {
        let notification = parse_event(br#"{"type":"configuration_change"}"#)
            .unwrap()
            .unwrap();

        assert_eq!(notification, ChangeNotification::config_change(None));
    }

    #[test]
    fn unknown_events_are_skipped() {
        assert_eq!(parse_event(br#"{"type":"something_else"}"#).unwrap(), None);
        assert_eq!(parse_event(b"not json").unwrap_err().code, Code::DataLoss);
    }

    #[tokio::test]
    async fn stream_yields_messages_until_clean_end() {
        let ready = frame::encode(0, br#"{"type":"provider_ready"}"#);
        let keep_alive = frame::encode(0, br#"{"type":"keep_alive"}"#);
        let end = frame::encode(frame::FLAG_END_STREAM, b"{}");
        let wire: &'static [u8] = Box::leak([ready, keep_alive, end].concat().into_boxed_slice());

        let items: Vec<_> = decode_stream(body_of(vec![wire])).collect().await;

        assert_eq!(
            items,
            vec![
                Ok(ChangeNotification::new(NotificationKind::Ready)),
                Ok(ChangeNotification::new(NotificationKind::KeepAlive)),
            ]
        );
    }

    #[tokio::test]
    async fn stream_surfaces_end_stream_errors() {
        let end = frame::encode(
            frame::FLAG_END_STREAM,
            br#"{"error":{"code":"unavailable","message":"shutting down"}}"#,
        );
        let wire: &'static [u8] = Box::leak(end.to_vec().into_boxed_slice());

        let items: Vec<_> = decode_stream(body_of(vec![wire])).collect().await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap_err().code, Code::Unavailable);
    }

    #[tokio::test]
    async fn truncated_stream_is_a_data_loss() {
        let wire: &'static [u8] = &[0, 0, 0, 0, 9, b'{'];

        let items: Vec<_> = decode_stream(body_of(vec![wire])).collect().await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap_err().code, Code::DataLoss);
    }

    #[tokio::test]
    async fn resolves_boolean_flag() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/flagd.evaluation.v1.Service/ResolveBoolean"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({"flagKey": "new-ui", "context": {"plan": "pro"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": true,
                "reason": "STATIC",
                "variant": "on",
                "metadata": {"scope": "web"}
            })))
            .mount(&server)
            .await;
        let transport = transport_for(&server);
        let context: EvaluationContext = [("plan".to_owned(), json!("pro"))].into_iter().collect();

        let response = transport
            .resolve(FlagKind::Boolean, "new-ui", &context)
            .await
            .unwrap();

        assert_eq!(response.value, json!(true));
        assert_eq!(response.reason, "STATIC");
        assert_eq!(response.variant.as_deref(), Some("on"));
        assert_eq!(response.metadata.get("scope"), Some(&json!("web")));
    }

    #[tokio::test]
    async fn omitted_false_value_is_restored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/flagd.evaluation.v1.Service/ResolveBoolean"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"reason": "TARGETING_MATCH", "variant": "off"})),
            )
            .mount(&server)
            .await;

        let response = transport_for(&server)
            .resolve(FlagKind::Boolean, "new-ui", &EvaluationContext::new())
            .await
            .unwrap();

        assert_eq!(response.value, json!(false));
    }

    #[tokio::test]
    async fn connect_errors_carry_their_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/flagd.evaluation.v1.Service/ResolveString"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "code": "not_found",
                "message": "flag: missing not found"
            })))
            .mount(&server)
            .await;

        let err = transport_for(&server)
            .resolve(FlagKind::String, "missing", &EvaluationContext::new())
            .await
            .unwrap_err();

        assert_eq!(err.code, Code::NotFound);
        assert_eq!(err.message, "flag: missing not found");
    }

    #[tokio::test]
    async fn opens_event_stream() {
        let server = MockServer::start().await;
        let mut body = frame::encode(0, br#"{"type":"provider_ready"}"#).to_vec();
        body.extend_from_slice(&frame::encode(
            0,
            br#"{"type":"configuration_change","data":{"flags":{"f":{}}}}"#,
        ));
        body.extend_from_slice(&frame::encode(frame::FLAG_END_STREAM, b"{}"));
        Mock::given(method("POST"))
            .and(path("/flagd.evaluation.v1.Service/EventStream"))
            .and(header("content-type", "application/connect+json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/connect+json")
                    .set_body_bytes(body),
            )
            .mount(&server)
            .await;

        let stream = transport_for(&server).event_stream().await.unwrap();
        let items: Vec<_> = stream.collect().await;

        assert_eq!(
            items,
            vec![
                Ok(ChangeNotification::new(NotificationKind::Ready)),
                Ok(ChangeNotification::config_change(Some(vec!["f".to_owned()]))),
            ]
        );
    }

    #[cfg(not(unix))]
    #[test]
    fn unix_sockets_are_rejected() {
        let config = ClientConfig::builder()
            .socket_path("flagd.sock")
            .build()
            .unwrap();

        assert!(matches!(
            ConnectTransport::new(&config),
            Err(crate::Error::UnsupportedSocket(_))
        ));
    }

    #[cfg(unix)]
    mod unix_socket {
        use futures::StreamExt;
        use serde_json::json;
        use tempfile::TempDir;
        use tokio::{
            io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
            net::UnixListener,
            task::JoinHandle,
        };

        use super::ConnectTransport;
        use crate::{
            transport::{frame, ChangeNotification, Code, FlagService, NotificationKind},
            ClientConfig, EvaluationContext, FlagKind,
        };

        /// What the server saw: the request line, the lower-cased headers and the body.
        struct Received {
            request_line: String,
            headers: Vec<String>,
            body: Vec<u8>,
        }

        /// Accept one connection, read one request and answer it with a raw HTTP/1.1 response.
        fn serve_once(
            listener: UnixListener,
            status: &'static str,
            content_type: &'static str,
            body: Vec<u8>,
        ) -> JoinHandle<Received> {
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let (read, mut write) = stream.into_split();
                let mut reader = BufReader::new(read);

                let mut request_line = String::new();
                reader.read_line(&mut request_line).await.unwrap();
                let mut headers = Vec::new();
                let mut content_length = 0;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).await.unwrap();
                    let line = line.trim_end().to_ascii_lowercase();
                    if line.is_empty() {
                        break;
                    }
                    if let Some(length) = line.strip_prefix("content-length:") {
                        content_length = length.trim().parse().unwrap();
                    }
                    headers.push(line);
                }
                let mut request_body = vec![0; content_length];
                reader.read_exact(&mut request_body).await.unwrap();

                let head = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                write.write_all(head.as_bytes()).await.unwrap();
                write.write_all(&body).await.unwrap();
                write.shutdown().await.unwrap();

                Received {
                    request_line: request_line.trim_end().to_owned(),
                    headers,
                    body: request_body,
                }
            })
        }

        fn bind() -> (TempDir, UnixListener, ConnectTransport) {
            let dir = TempDir::new().unwrap();
            let socket_path = dir.path().join("flagd.sock");
            let listener = UnixListener::bind(&socket_path).unwrap();
            let config = ClientConfig::builder()
                .socket_path(socket_path.to_str().unwrap())
                .build()
                .unwrap();
            (dir, listener, ConnectTransport::new(&config).unwrap())
        }

        #[tokio::test]
        async fn resolves_over_unix_socket() {
            let (_dir, listener, transport) = bind();
            let response = json!({"value": "blue", "reason": "STATIC", "variant": "blue"});
            let server = serve_once(
                listener,
                "200 OK",
                "application/json",
                response.to_string().into_bytes(),
            );

            let response = transport
                .resolve(FlagKind::String, "color", &EvaluationContext::new())
                .await
                .unwrap();
            let received = server.await.unwrap();

            assert_eq!(response.value, json!("blue"));
            assert_eq!(response.reason, "STATIC");
            assert_eq!(
                received.request_line,
                "POST /flagd.evaluation.v1.Service/ResolveString HTTP/1.1"
            );
            assert!(received
                .headers
                .contains(&"content-type: application/json".to_owned()));
            assert!(received
                .headers
                .contains(&"connect-protocol-version: 1".to_owned()));
            let request: serde_json::Value = serde_json::from_slice(&received.body).unwrap();
            assert_eq!(request, json!({"flagKey": "color", "context": {}}));
        }

        #[tokio::test]
        async fn unix_socket_errors_carry_their_code() {
            let (_dir, listener, transport) = bind();
            let error = json!({"code": "not_found", "message": "flag: color not found"});
            let _server = serve_once(
                listener,
                "404 Not Found",
                "application/json",
                error.to_string().into_bytes(),
            );

            let err = transport
                .resolve(FlagKind::String, "color", &EvaluationContext::new())
                .await
                .unwrap_err();

            assert_eq!(err.code, Code::NotFound);
            assert_eq!(err.message, "flag: color not found");
        }

        #[tokio::test]
        async fn opens_event_stream_over_unix_socket() {
            let (_dir, listener, transport) = bind();
            let mut body = frame::encode(0, br#"{"type":"provider_ready"}"#).to_vec();
            body.extend_from_slice(&frame::encode(
                0,
                br#"{"type":"configuration_change","data":{"flags":{"f":{}}}}"#,
            ));
            body.extend_from_slice(&frame::encode(frame::FLAG_END_STREAM, b"{}"));
            let server = serve_once(listener, "200 OK", "application/connect+json", body);

            let items: Vec<_> = transport.event_stream().await.unwrap().collect().await;
            let received = server.await.unwrap();

            assert_eq!(
                items,
                vec![
                    Ok(ChangeNotification::new(NotificationKind::Ready)),
                    Ok(ChangeNotification::config_change(Some(vec!["f".to_owned()]))),
                ]
            );
            assert_eq!(
                received.request_line,
                "POST /flagd.evaluation.v1.Service/EventStream HTTP/1.1"
            );
            assert_eq!(received.body, frame::encode(0, b"{}").to_vec());
        }

        #[tokio::test]
        async fn missing_socket_is_unavailable() {
            let dir = TempDir::new().unwrap();
            let config = ClientConfig::builder()
                .socket_path(dir.path().join("absent.sock").to_str().unwrap())
                .build()
                .unwrap();

            let err = ConnectTransport::new(&config)
                .unwrap()
                .resolve(FlagKind::Boolean, "f", &EvaluationContext::new())
                .await
                .unwrap_err();

            assert_eq!(err.code, Code::Unavailable);
        }
    }
}
