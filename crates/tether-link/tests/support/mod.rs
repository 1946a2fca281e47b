//! A fake host for integration tests.
//!
//! Speaks just enough HTTP/1.1 over a raw `TcpListener`: `GET` opens a
//! close-delimited SSE stream that starts with an `endpoint` event, and `POST`
//! answers `202 Accepted` (or a configured status), records the body, and may
//! push a reply onto the current stream through the test's responder.

#![allow(dead_code)]

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_link::ServerConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const AUTH: &str = "Bearer test-token";

/// Maps a POSTed JSON-RPC request to the payload to push back on the stream.
pub type Responder = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// A POST received by the host.
#[derive(Debug, Clone)]
pub struct Post {
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl Post {
    pub fn method(&self) -> &str {
        self.body["method"].as_str().unwrap_or_default()
    }
}

enum StreamCmd {
    Event(String),
    Close,
}

struct HostState {
    responder: Responder,
    stream: Mutex<Option<mpsc::UnboundedSender<StreamCmd>>>,
    posts: mpsc::UnboundedSender<Post>,
    streams_opened: AtomicUsize,
    stream_headers: Mutex<Vec<HashMap<String, String>>>,
    post_status: AtomicU16,
    reject_streams: AtomicBool,
    announce_endpoint: AtomicBool,
}

impl HostState {
    fn push_raw(&self, frame: String) -> bool {
        match self.stream.lock().unwrap().as_ref() {
            Some(tx) => tx.send(StreamCmd::Event(frame)).is_ok(),
            None => false,
        }
    }
}

pub struct FakeHost {
    pub base_url: String,
    state: Arc<HostState>,
    posts: tokio::sync::Mutex<mpsc::UnboundedReceiver<Post>>,
}

impl FakeHost {
    pub async fn start(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (posts_tx, posts_rx) = mpsc::unbounded_channel();

        let state = Arc::new(HostState {
            responder,
            stream: Mutex::new(None),
            posts: posts_tx,
            streams_opened: AtomicUsize::new(0),
            stream_headers: Mutex::new(Vec::new()),
            post_status: AtomicU16::new(202),
            reject_streams: AtomicBool::new(false),
            announce_endpoint: AtomicBool::new(true),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                tokio::spawn(handle_connection(socket, Arc::clone(&accept_state)));
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            posts: tokio::sync::Mutex::new(posts_rx),
        }
    }

    /// A host that answers nothing on its own.
    pub async fn silent() -> Self {
        Self::start(Arc::new(|_: &Value| -> Option<Value> { None })).await
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            endpoint_url: format!("{}/sse", self.base_url),
            auth_credential: AUTH.to_string(),
        }
    }

    /// Push a JSON payload as a `data:` event on the current stream.
    pub fn push(&self, payload: &Value) -> bool {
        self.state.push_raw(format!("data: {payload}\n\n"))
    }

    /// Push a raw SSE frame on the current stream.
    pub fn push_frame(&self, frame: &str) -> bool {
        self.state.push_raw(frame.to_string())
    }

    /// End the current stream as if the host dropped the connection.
    pub fn close_stream(&self) {
        if let Some(tx) = self.state.stream.lock().unwrap().take() {
            let _ = tx.send(StreamCmd::Close);
        }
    }

    pub fn streams_opened(&self) -> usize {
        self.state.streams_opened.load(Ordering::SeqCst)
    }

    pub fn stream_headers(&self, index: usize) -> HashMap<String, String> {
        self.state.stream_headers.lock().unwrap()[index].clone()
    }

    pub fn set_post_status(&self, status: u16) {
        self.state.post_status.store(status, Ordering::SeqCst);
    }

    pub fn reject_streams(&self) {
        self.state.reject_streams.store(true, Ordering::SeqCst);
    }

    pub fn withhold_endpoint(&self) {
        self.state.announce_endpoint.store(false, Ordering::SeqCst);
    }

    /// The next POST received, in arrival order.
    pub async fn next_post(&self) -> Post {
        let mut posts = self.posts.lock().await;
        tokio::time::timeout(Duration::from_secs(5), posts.recv())
            .await
            .expect("timed out waiting for a POST")
            .expect("host stopped")
    }

    /// Skip POSTs until one matches `pred`.
    pub async fn next_post_where(&self, pred: impl Fn(&Post) -> bool) -> Post {
        loop {
            let post = self.next_post().await;
            if pred(&post) {
                return post;
            }
        }
    }

    /// Assert no POST arrives within `wait`.
    pub async fn assert_no_post(&self, wait: Duration) {
        let mut posts = self.posts.lock().await;
        if let Ok(Some(post)) = tokio::time::timeout(wait, posts.recv()).await {
            panic!("unexpected POST: {}", post.body);
        }
    }
}

/// A JSON-RPC success reply to the request `req`.
pub fn ok_reply(req: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": req["id"].clone(), "result": result })
}

/// A `tools/call` result carrying one text block.
pub fn text_result(text: &str) -> Value {
    json!({ "content": [{ "type": "text", "text": text }], "isError": false })
}

/// A responder that behaves like a host with the registrar and a `sqlite` tool.
///
/// `sqlite` answers with `sqlite_text`, or never answers when it is `None`.
pub fn registrar_host(sqlite_text: Option<&'static str>) -> Responder {
    Arc::new(move |req: &Value| match req["method"].as_str()? {
        "tools/list" => Some(ok_reply(
            req,
            json!({ "tools": [{ "name": "remote" }, { "name": "sqlite" }] }),
        )),
        "tools/call" => match req["params"]["name"].as_str()? {
            "remote" => {
                let tool = req["params"]["arguments"]["input"]["tool_name"]
                    .as_str()
                    .unwrap_or_default();
                Some(ok_reply(
                    req,
                    text_result(&format!("Successfully registered tool '{tool}'")),
                ))
            }
            "sqlite" => sqlite_text.map(|text| ok_reply(req, text_result(text))),
            _ => None,
        },
        _ => None,
    })
}

struct Request {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

async fn read_request(socket: &mut TcpStream) -> Option<Request> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(Request {
        method,
        path,
        headers,
        body,
    })
}

async fn handle_connection(mut socket: TcpStream, state: Arc<HostState>) {
    let Some(request) = read_request(&mut socket).await else {
        return;
    };

    match request.method.as_str() {
        "GET" => serve_stream(socket, request, state).await,
        "POST" => serve_post(socket, request, state).await,
        _ => {
            let _ = socket
                .write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        }
    }
}

async fn serve_stream(mut socket: TcpStream, request: Request, state: Arc<HostState>) {
    let index = state.streams_opened.fetch_add(1, Ordering::SeqCst);
    state.stream_headers.lock().unwrap().push(request.headers);

    if state.reject_streams.load(Ordering::SeqCst) {
        let body = "unauthorized";
        let response = format!(
            "HTTP/1.1 401 Unauthorized\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = socket.write_all(response.as_bytes()).await;
        let _ = socket.shutdown().await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    *state.stream.lock().unwrap() = Some(tx);

    let session = if index == 0 {
        "abc123".to_string()
    } else {
        format!("session-{index}")
    };
    let mut preamble = String::from(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/event-stream\r\n\
         Cache-Control: no-cache\r\n\
         Connection: close\r\n\
         \r\n\
         : stream open\n\n",
    );
    if state.announce_endpoint.load(Ordering::SeqCst) {
        preamble.push_str(&format!(
            "event: endpoint\ndata: /messages/?session_id={session}\n\n"
        ));
    }
    if socket.write_all(preamble.as_bytes()).await.is_err() {
        return;
    }
    let _ = socket.flush().await;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StreamCmd::Event(frame) => {
                if socket.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
                let _ = socket.flush().await;
            }
            StreamCmd::Close => break,
        }
    }
    let _ = socket.shutdown().await;
}

async fn serve_post(mut socket: TcpStream, request: Request, state: Arc<HostState>) {
    let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
    let status = state.post_status.load(Ordering::SeqCst);

    let response = if status == 202 {
        "HTTP/1.1 202 Accepted\r\nContent-Length: 8\r\nConnection: close\r\n\r\nAccepted".to_string()
    } else {
        let text = "session not found";
        format!(
            "HTTP/1.1 {status} Error\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{text}",
            text.len()
        )
    };
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;

    let _ = state.posts.send(Post {
        path: request.path,
        headers: request.headers,
        body: body.clone(),
    });

    if status == 202 {
        if let Some(reply) = (state.responder)(&body) {
            state.push_raw(format!("data: {reply}\n\n"));
        }
    }
}
