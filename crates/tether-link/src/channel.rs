//! The reverse-connection channel to the host.
//!
//! A channel is one long-lived SSE `GET` plus short-lived `POST`s. Requests
//! are POSTed to the session's message endpoint and acknowledged with
//! `202 Accepted`; the actual JSON-RPC response arrives later on the event
//! stream, where a background reader task matches it to the waiting caller by
//! request id. The same stream also carries host-initiated "reverse" calls,
//! which the reader queues for the dispatcher.
//!
//! Channels are disposable: each connection attempt builds a new one, and
//! closing or dropping it stops the reader and fails every outstanding waiter.

use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::sse::{EventStream, SseEvent};
use crate::discovery::ServerConfig;
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tether_types::{LinkError, ToolResult};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Default wait for replies to control requests (`tools/list`, registration).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for nested tool calls, which proxy to possibly slow tools.
pub const DEFAULT_TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

/// Transport knobs for a channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Budget for opening the stream and receiving the `endpoint` event.
    pub connect_timeout: Duration,
    /// Per-POST HTTP timeout (the POST only waits for `202 Accepted`).
    pub post_timeout: Duration,
    /// Reply wait for control requests.
    pub request_timeout: Duration,
    /// Reply wait for nested `tools/call` requests.
    pub tool_call_timeout: Duration,
    /// Accept self-signed certificates from the local host.
    pub accept_invalid_certs: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            post_timeout: Duration::from_secs(10),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            tool_call_timeout: DEFAULT_TOOL_CALL_TIMEOUT,
            accept_invalid_certs: true,
        }
    }
}

/// A host-initiated invocation of the tool this process registered.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundCall {
    #[serde(rename = "tool")]
    pub tool_name: String,
    /// Correlation key to echo back in `tools/reply`.
    pub call_id: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Where outbound requests for this session are POSTed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Path (or URL) announced by the host, e.g. `/messages/?session_id=abc`.
    pub path: String,
    /// `path` resolved against the stream URL.
    pub url: reqwest::Url,
    pub session_id: Option<String>,
}

impl Endpoint {
    /// Resolve an announced endpoint against the event stream's URL.
    pub fn resolve(server_url: &reqwest::Url, path: &str) -> Result<Self, LinkError> {
        let url = server_url.join(path).map_err(|e| {
            LinkError::Protocol(format!("invalid message endpoint '{path}': {e}"))
        })?;
        let session_id = url
            .query_pairs()
            .find(|(key, _)| key == "session_id")
            .map(|(_, value)| value.into_owned())
            .filter(|id| !id.is_empty());
        Ok(Self {
            path: path.to_string(),
            url,
            session_id,
        })
    }
}

/// A stream event, classified by what the channel must do with it.
#[derive(Debug)]
pub enum StreamMessage {
    /// The message endpoint path announced by the host.
    Endpoint(String),
    Inbound(InboundCall),
    Reply(JsonRpcResponse),
    Ignored,
}

/// Decide how an SSE event is routed.
pub fn classify(event: &SseEvent) -> StreamMessage {
    if event.event_type.as_deref() == Some("endpoint") {
        return StreamMessage::Endpoint(event.data.trim().to_string());
    }

    let value: serde_json::Value = match serde_json::from_str(&event.data) {
        Ok(v) => v,
        Err(_) => return StreamMessage::Ignored,
    };

    if let Some(reverse) = value.get("reverse") {
        return match serde_json::from_value(reverse.clone()) {
            Ok(call) => StreamMessage::Inbound(call),
            Err(e) => {
                tracing::warn!("Malformed reverse call: {e}: {}", event.data);
                StreamMessage::Ignored
            }
        };
    }

    if value.get("id").is_some() {
        if let Ok(resp) = serde_json::from_value(value) {
            return StreamMessage::Reply(resp);
        }
    }

    StreamMessage::Ignored
}

/// Generate a fresh correlation id for an outbound request.
pub fn next_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A live reverse connection to the host.
pub struct Channel {
    http: reqwest::Client,
    auth_credential: String,
    endpoint: Arc<RwLock<Endpoint>>,
    pending: PendingMap,
    inbound: Mutex<mpsc::UnboundedReceiver<InboundCall>>,
    options: ChannelOptions,
    /// Cancelled to stop the reader (close, drop, or process shutdown).
    stop: CancellationToken,
    /// Cancelled by the reader once it has exited and failed all waiters.
    closed: CancellationToken,
}

impl Channel {
    /// Open the event stream, wait for the session endpoint, and start the reader.
    pub async fn connect(
        config: &ServerConfig,
        options: ChannelOptions,
        shutdown: &CancellationToken,
    ) -> Result<Self, LinkError> {
        let server_url = reqwest::Url::parse(&config.endpoint_url).map_err(|e| {
            LinkError::Connect(format!("invalid endpoint URL '{}': {e}", config.endpoint_url))
        })?;

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|e| LinkError::Connect(e.to_string()))?;

        let stop = shutdown.child_token();

        tracing::debug!("GET {server_url} (event stream)");
        let opening = async {
            let response = http
                .get(server_url.clone())
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache")
                .header(AUTHORIZATION, &config.auth_credential)
                .send()
                .await
                .map_err(|e| LinkError::Connect(e.to_string()))?;

            let status = response.status();
            if status != StatusCode::OK {
                let body = response.text().await.unwrap_or_default();
                return Err(LinkError::Connect(format!(
                    "event stream returned {status}: {body}"
                )));
            }

            let mut events = EventStream::new(response.bytes_stream());
            let endpoint = wait_for_endpoint(&mut events, &server_url).await?;
            Ok((events, endpoint))
        };

        let (events, endpoint) = tokio::select! {
            _ = stop.cancelled() => return Err(LinkError::Cancelled),
            opened = tokio::time::timeout(options.connect_timeout, opening) => match opened {
                Ok(result) => result?,
                Err(_) => {
                    return Err(LinkError::Connect(format!(
                        "no endpoint event within {}ms",
                        options.connect_timeout.as_millis()
                    )));
                }
            },
        };

        tracing::info!(
            "Event stream open (session: {}, endpoint: {})",
            endpoint.session_id.as_deref().unwrap_or("none"),
            endpoint.path
        );

        let pending: PendingMap = Arc::default();
        let endpoint = Arc::new(RwLock::new(endpoint));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let reader = Reader {
            server_url,
            pending: Arc::clone(&pending),
            endpoint: Arc::clone(&endpoint),
            inbound: inbound_tx,
        };
        tokio::spawn(reader.run(events, stop.clone(), closed.clone()));

        Ok(Self {
            http,
            auth_credential: config.auth_credential.clone(),
            endpoint,
            pending,
            inbound: Mutex::new(inbound_rx),
            options,
            stop,
            closed,
        })
    }

    /// Send a request and wait for its reply to arrive over the stream.
    pub async fn send(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, LinkError> {
        if !self.is_alive() {
            return Err(LinkError::ChannelClosed);
        }

        let id = next_request_id();
        let (tx, rx) = oneshot::channel();
        // Register before POSTing: the reply may beat the 202.
        self.pending.lock().await.insert(id.clone(), tx);

        let request = JsonRpcRequest::new(id.clone(), method, params);
        tracing::debug!("POST {method} (id {id})");

        let outcome = tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(LinkError::Cancelled),
            posted = self.post(&request) => match posted {
                Ok(()) => self.wait_for_reply(method, rx, timeout).await,
                Err(e) => Err(e),
            },
        };

        if outcome.is_err() {
            self.pending.lock().await.remove(&id);
        }
        outcome
    }

    async fn wait_for_reply(
        &self,
        method: &str,
        rx: oneshot::Receiver<JsonRpcResponse>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, LinkError> {
        tokio::select! {
            biased;
            reply = rx => reply.map_err(|_| LinkError::ChannelClosed),
            _ = self.stop.cancelled() => Err(LinkError::Cancelled),
            _ = self.closed.cancelled() => Err(LinkError::ChannelClosed),
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!("Timed out waiting for reply to {method}");
                Err(LinkError::RequestTimeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a request and return its `result`, mapping JSON-RPC errors.
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, LinkError> {
        let resp = self.send(method, params, timeout).await?;

        if let Some(err) = resp.error {
            return Err(LinkError::JsonRpc {
                code: err.code,
                message: err.message,
            });
        }

        resp.result.ok_or_else(|| {
            LinkError::Protocol(format!("{method} response has neither result nor error"))
        })
    }

    /// List the tools the host currently exposes.
    pub async fn list_tools(&self) -> Result<Vec<HostTool>, LinkError> {
        let result = self
            .request("tools/list", serde_json::json!({}), self.options.request_timeout)
            .await?;
        let list: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| LinkError::Protocol(format!("Failed to parse tools/list response: {e}")))?;
        Ok(list.tools)
    }

    /// Call another tool registered with the host.
    ///
    /// Safe to use from inside an inbound-call handler: the reader keeps
    /// running while this waits.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, LinkError> {
        self.call_tool_with_timeout(name, arguments, self.options.tool_call_timeout)
            .await
    }

    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolResult, LinkError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let result = self.request("tools/call", params, timeout).await?;
        serde_json::from_value(result)
            .map_err(|e| LinkError::Protocol(format!("Failed to parse tools/call result: {e}")))
    }

    /// Answer an inbound call. Fire-and-forget: no reply is awaited.
    pub async fn reply(&self, call_id: &str, result: &ToolResult) -> Result<(), LinkError> {
        let request = JsonRpcRequest::reply(call_id, result)?;
        self.post(&request).await?;
        tracing::info!("Sent tools/reply for call {call_id}");
        Ok(())
    }

    async fn post(&self, request: &JsonRpcRequest) -> Result<(), LinkError> {
        let url = self.endpoint.read().await.url.clone();
        let response = self
            .http
            .post(url)
            .header(AUTHORIZATION, &self.auth_credential)
            .timeout(self.options.post_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| LinkError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LinkError::Transport {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Take the next queued inbound call; `None` once the stream is gone.
    pub async fn next_inbound(&self) -> Option<InboundCall> {
        self.inbound.lock().await.recv().await
    }

    /// Whether the reader is still running.
    pub fn is_alive(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Resolves once the stream has ended and all waiters have been failed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Stop the reader and wait until outstanding waiters have been failed.
    pub async fn close(&self) {
        self.stop.cancel();
        self.closed.cancelled().await;
    }

    pub async fn session_id(&self) -> Option<String> {
        self.endpoint.read().await.session_id.clone()
    }

    pub async fn message_endpoint(&self) -> String {
        self.endpoint.read().await.path.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// A tool listed by the host.
#[derive(Debug, Clone, Deserialize)]
pub struct HostTool {
    pub name: String,
}

#[derive(Deserialize)]
struct ToolsListResult {
    #[serde(default)]
    tools: Vec<HostTool>,
}

async fn wait_for_endpoint(
    events: &mut EventStream,
    server_url: &reqwest::Url,
) -> Result<Endpoint, LinkError> {
    while let Some(event) = events.next().await {
        let event = event.map_err(|e| LinkError::Connect(e.to_string()))?;
        match classify(&event) {
            StreamMessage::Endpoint(path) => return Endpoint::resolve(server_url, &path),
            other => tracing::debug!("Ignoring event before endpoint: {other:?}"),
        }
    }
    Err(LinkError::Connect(
        "event stream ended before the endpoint event".to_string(),
    ))
}

/// Background task state shared with the channel.
///
/// The event stream is passed to [`Reader::run`] rather than stored here: it
/// is `Send` but not `Sync`, and `route` holds `&self` across awaits.
struct Reader {
    server_url: reqwest::Url,
    pending: PendingMap,
    endpoint: Arc<RwLock<Endpoint>>,
    inbound: mpsc::UnboundedSender<InboundCall>,
}

impl Reader {
    async fn run(
        self,
        mut events: EventStream,
        stop: CancellationToken,
        closed: CancellationToken,
    ) {
        // Marks the channel dead even if routing panics.
        let _closed_guard = closed.drop_guard();

        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => break,
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => self.route(event).await,
                Some(Err(e)) => {
                    tracing::warn!("Event stream error: {e}");
                    break;
                }
                None => {
                    tracing::warn!("Event stream closed by host");
                    break;
                }
            }
        }

        // Dropping the senders fails every waiter with ChannelClosed.
        let abandoned = {
            let mut pending = self.pending.lock().await;
            let n = pending.len();
            pending.clear();
            n
        };
        if abandoned > 0 {
            tracing::debug!("Failed {abandoned} outstanding request(s) on stream close");
        }
    }

    async fn route(&self, event: SseEvent) {
        match classify(&event) {
            StreamMessage::Endpoint(path) => match Endpoint::resolve(&self.server_url, &path) {
                Ok(endpoint) => {
                    tracing::info!("Host announced new message endpoint: {path}");
                    *self.endpoint.write().await = endpoint;
                }
                Err(e) => tracing::warn!("Keeping current message endpoint: {e}"),
            },
            StreamMessage::Inbound(call) => {
                tracing::debug!("Queued inbound call {} for '{}'", call.call_id, call.tool_name);
                if self.inbound.send(call).is_err() {
                    tracing::debug!("Inbound queue dropped; discarding call");
                }
            }
            StreamMessage::Reply(resp) => {
                let Some(id) = resp.correlation_id() else {
                    tracing::debug!("Dropping reply without a usable id");
                    return;
                };
                let waiter = self.pending.lock().await.remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => tracing::debug!("Dropping reply for unknown request {id}"),
                }
            }
            StreamMessage::Ignored => {
                tracing::trace!("Ignoring event: {:?}", event.event_type);
            }
        }
    }
}
