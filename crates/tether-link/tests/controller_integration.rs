//! End-to-end tests of the controller: register, serve, nested calls, reconnect.

mod support;

use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use support::{FakeHost, Post};
use tether_link::{
    BackoffConfig, Channel, ChannelOptions, Controller, LinkSettings, LinkState, StaticDiscovery,
    ToolHandler,
};
use tether_types::{ToolRegistration, ToolResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Answers every call by asking the host's `sqlite` tool for its databases.
struct NestedCallHandler {
    registration: ToolRegistration,
    nested_timeout: Duration,
}

impl ToolHandler for NestedCallHandler {
    fn registration(&self) -> &ToolRegistration {
        &self.registration
    }

    fn handle(
        &self,
        input: Value,
        channel: Arc<Channel>,
    ) -> Pin<Box<dyn Future<Output = ToolResult> + Send + '_>> {
        Box::pin(async move {
            let message = input["message"].as_str().unwrap_or_default().to_string();
            match channel
                .call_tool_with_timeout(
                    "sqlite",
                    json!({ "input": { "sql": ".databases" } }),
                    self.nested_timeout,
                )
                .await
            {
                Ok(result) => ToolResult::text(format!(
                    "{message} | {}",
                    result.first_text().unwrap_or_default()
                )),
                Err(e) => ToolResult::error(format!("{message} | nested call failed: {e}")),
            }
        })
    }
}

fn handler(nested_timeout: Duration) -> Arc<dyn ToolHandler> {
    Arc::new(NestedCallHandler {
        registration: ToolRegistration {
            tool_name: "probe".into(),
            readme: "Test tool.".into(),
            description: "Calls sqlite".into(),
            parameters: json!({ "type": "object" }),
            callback_endpoint: "tether://probe".into(),
            api_key: "test-key".into(),
        },
        nested_timeout,
    })
}

fn settings() -> LinkSettings {
    LinkSettings {
        channel: ChannelOptions {
            connect_timeout: Duration::from_secs(2),
            post_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            tool_call_timeout: Duration::from_secs(2),
            accept_invalid_certs: true,
        },
        backoff: BackoffConfig {
            unit: Duration::from_millis(5),
            max_delay: Duration::from_millis(40),
        },
    }
}

struct Running {
    controller: Arc<Controller>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Running {
    fn start(host: &FakeHost, handler: Arc<dyn ToolHandler>) -> Self {
        Self::start_with(host, handler, settings())
    }

    fn start_with(
        host: &FakeHost,
        handler: Arc<dyn ToolHandler>,
        settings: LinkSettings,
    ) -> Self {
        let controller = Arc::new(Controller::new(
            Arc::new(StaticDiscovery::new(host.server_config())),
            handler,
            settings,
        ));
        let cancel = CancellationToken::new();
        let task = {
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await })
        };
        Self {
            controller,
            cancel,
            task,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("controller should stop promptly")
            .unwrap();
        assert_eq!(self.controller.state(), LinkState::Stopped);
    }
}

async fn wait_for_state(mut states: watch::Receiver<LinkState>, target: LinkState) {
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("never reached {target}"))
        .unwrap();
}

fn is_register(post: &Post) -> bool {
    post.method() == "tools/call" && post.body["params"]["name"] == "remote"
}

fn is_reply(post: &Post) -> bool {
    post.method() == "tools/reply"
}

fn push_call(host: &FakeHost, tool: &str, call_id: &str, message: &str) {
    assert!(host.push(&json!({
        "reverse": {
            "tool": tool,
            "call_id": call_id,
            "input": { "message": message }
        }
    })));
}

#[tokio::test]
async fn registers_then_answers_calls_with_nested_results() {
    let host = FakeHost::start(support::registrar_host(Some("main: /tmp/app.db"))).await;
    let running = Running::start(&host, handler(Duration::from_secs(2)));

    let probe = host.next_post().await;
    assert_eq!(probe.method(), "tools/list");

    let register = host.next_post().await;
    assert!(is_register(&register));
    let input = &register.body["params"]["arguments"]["input"];
    assert_eq!(input["operation"], "register");
    assert_eq!(input["tool_name"], "probe");
    assert_eq!(input["description"], "Calls sqlite");
    assert_eq!(input["callback_endpoint"], "tether://probe");
    assert_eq!(input["TOOL_API_KEY"], "test-key");

    wait_for_state(running.controller.subscribe(), LinkState::Serving).await;

    push_call(&host, "probe", "call-1", "hello");
    let reply = host.next_post_where(is_reply).await;
    assert_eq!(reply.body["id"], "call-1");
    let result = &reply.body["params"]["result"];
    assert_eq!(result["isError"], false);
    assert_eq!(result["content"][0]["text"], "hello | main: /tmp/app.db");

    running.stop().await;
}

#[tokio::test]
async fn nested_call_timeout_becomes_error_reply() {
    // sqlite never answers.
    let host = FakeHost::start(support::registrar_host(None)).await;
    let running = Running::start(&host, handler(Duration::from_millis(150)));
    wait_for_state(running.controller.subscribe(), LinkState::Serving).await;

    push_call(&host, "probe", "call-slow", "hi");
    let reply = host.next_post_where(is_reply).await;
    assert_eq!(reply.body["id"], "call-slow");
    let result = &reply.body["params"]["result"];
    assert_eq!(result["isError"], true);
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("nested call failed"), "got: {text}");
    assert!(text.contains("timed out"), "got: {text}");

    // Still serving after a failed call.
    assert_eq!(running.controller.state(), LinkState::Serving);
    running.stop().await;
}

#[tokio::test]
async fn slow_handler_does_not_block_other_calls() {
    // The first call blocks on a nested request that is never answered; the
    // second is addressed to an unknown tool and must be answered meanwhile.
    let host = FakeHost::start(support::registrar_host(None)).await;
    let running = Running::start(&host, handler(Duration::from_secs(3)));
    wait_for_state(running.controller.subscribe(), LinkState::Serving).await;

    push_call(&host, "probe", "call-blocked", "wait");
    push_call(&host, "other-tool", "call-unknown", "hi");

    let reply = host.next_post_where(is_reply).await;
    assert_eq!(reply.body["id"], "call-unknown");
    let result = &reply.body["params"]["result"];
    assert_eq!(result["isError"], true);
    assert!(
        result["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("Unknown tool 'other-tool'")
    );

    running.stop().await;
}

#[tokio::test]
async fn reconnects_and_reregisters_after_stream_loss() {
    let host = FakeHost::start(support::registrar_host(Some("ok"))).await;
    let running = Running::start(&host, handler(Duration::from_secs(2)));

    host.next_post_where(is_register).await;
    wait_for_state(running.controller.subscribe(), LinkState::Serving).await;
    assert_eq!(host.streams_opened(), 1);

    host.close_stream();

    // A brand-new stream and session, followed by a fresh registration.
    let register = host.next_post_where(is_register).await;
    assert_eq!(register.path, "/messages/?session_id=session-1");
    wait_for_state(running.controller.subscribe(), LinkState::Serving).await;
    assert_eq!(host.streams_opened(), 2);

    push_call(&host, "probe", "call-2", "again");
    let reply = host.next_post_where(is_reply).await;
    assert_eq!(reply.path, "/messages/?session_id=session-1");
    assert_eq!(reply.body["id"], "call-2");

    running.stop().await;
}

#[tokio::test]
async fn missing_registrar_is_retried() {
    let host = FakeHost::start(Arc::new(|req: &Value| {
        (req["method"] == "tools/list")
            .then(|| support::ok_reply(req, json!({ "tools": [{ "name": "sqlite" }] })))
    }))
    .await;
    let running = Running::start(&host, handler(Duration::from_secs(2)));

    // Every attempt probes, finds no registrar, and backs off without registering.
    for _ in 0..3 {
        let post = host.next_post().await;
        assert_eq!(post.method(), "tools/list");
    }
    assert!(host.streams_opened() >= 3);
    assert_ne!(running.controller.state(), LinkState::Serving);

    running.stop().await;
}

#[tokio::test]
async fn rejected_registration_is_retried() {
    let host = FakeHost::start(Arc::new(|req: &Value| match req["method"].as_str()? {
        "tools/list" => Some(support::ok_reply(
            req,
            json!({ "tools": [{ "name": "remote" }] }),
        )),
        "tools/call" => Some(support::ok_reply(
            req,
            support::text_result("Tool name already in use"),
        )),
        _ => None,
    }))
    .await;
    let running = Running::start(&host, handler(Duration::from_secs(2)));

    host.next_post_where(is_register).await;
    host.next_post_where(is_register).await;
    assert!(host.streams_opened() >= 2);

    running.stop().await;
}

#[tokio::test]
async fn registration_resets_backoff_after_failures() {
    // The first two registrations are rejected, the third succeeds.
    let registrations = Arc::new(AtomicUsize::new(0));
    let host = FakeHost::start({
        let registrations = Arc::clone(&registrations);
        Arc::new(move |req: &Value| match req["method"].as_str()? {
            "tools/list" => Some(support::ok_reply(
                req,
                json!({ "tools": [{ "name": "remote" }] }),
            )),
            "tools/call" => {
                let text = if registrations.fetch_add(1, Ordering::SeqCst) < 2 {
                    "Tool name already in use"
                } else {
                    "Successfully registered tool 'probe'"
                };
                Some(support::ok_reply(req, support::text_result(text)))
            }
            _ => None,
        })
    })
    .await;

    // Delays long enough that Degraded is observable before rediscovery.
    let mut settings = settings();
    settings.backoff = BackoffConfig {
        unit: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
    };
    let running = Running::start_with(&host, handler(Duration::from_secs(2)), settings);

    wait_for_state(running.controller.subscribe(), LinkState::Serving).await;
    assert_eq!(host.streams_opened(), 3);
    assert_eq!(registrations.load(Ordering::SeqCst), 3);
    assert_eq!(running.controller.retry_attempt(), 0);

    host.close_stream();
    wait_for_state(running.controller.subscribe(), LinkState::Degraded).await;
    assert_eq!(running.controller.retry_attempt(), 1);

    wait_for_state(running.controller.subscribe(), LinkState::Serving).await;
    assert_eq!(host.streams_opened(), 4);
    assert_eq!(running.controller.retry_attempt(), 0);

    running.stop().await;
}

#[tokio::test]
async fn shutdown_while_serving_closes_stream() {
    let host = FakeHost::start(support::registrar_host(Some("ok"))).await;
    let running = Running::start(&host, handler(Duration::from_secs(2)));
    wait_for_state(running.controller.subscribe(), LinkState::Serving).await;

    running.stop().await;
    // No reconnect after shutdown.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.streams_opened(), 1);
}
