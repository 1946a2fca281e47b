//! The demo tool: echoes its message and shows nested calls to `sqlite`.

use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tether_config::ToolSettings;
use tether_link::{Channel, ToolHandler};
use tether_types::{LinkError, ToolRegistration, ToolResult};

pub const DEMO_TOOL_NAME: &str = "tether_demo";

const NESTED_TOOL: &str = "sqlite";
const SQLITE_UNLOCK_TOKEN: &str = "29e63eb5";
const DEFAULT_DATABASE: &str = ":memory:";
const NO_MESSAGE: &str = "(no message provided)";

const README: &str = "Demo tool that echoes messages back and can call other tools.\n\
- Use this to test tool registration and two-way communication with the host.\n\
- Shows how a remote tool can call OTHER tools on the host (like sqlite).";

const DESCRIPTION: &str = "Demo tool (Rust implementation) for testing remote tool \
registration and end-to-end communication. It echoes back any message sent to it, and \
it can call other tools on the host. Usage: {\"message\": \"list databases\"} calls sqlite \
to show the available databases; {\"message\": \"list tables in test.db\"} calls sqlite and \
returns the table names (the database defaults to :memory:); {\"message\": \"test\"} returns \
'Echo: test'.";

/// What a message asks the demo to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemoAction {
    Echo,
    ListDatabases,
    ListTables { database: String },
}

impl DemoAction {
    /// Pick an action by keyword. Database listing wins over table listing.
    pub fn from_message(message: &str) -> Self {
        // ASCII lowercasing keeps byte offsets aligned with `message`.
        let lower = message.to_ascii_lowercase();

        if lower.contains("databases") || lower.contains("list db") {
            return Self::ListDatabases;
        }
        if lower.contains("tables") {
            let database = lower
                .find(" in ")
                .map(|pos| message[pos + 4..].trim())
                .filter(|db| !db.is_empty())
                .unwrap_or(DEFAULT_DATABASE);
            return Self::ListTables {
                database: database.to_string(),
            };
        }
        Self::Echo
    }

    /// Arguments for the nested `sqlite` call, if this action makes one.
    pub fn sqlite_arguments(&self) -> Option<Value> {
        match self {
            Self::Echo => None,
            Self::ListDatabases => Some(json!({
                "input": { "sql": ".databases", "tool_unlock_token": SQLITE_UNLOCK_TOKEN }
            })),
            Self::ListTables { database } => Some(json!({
                "input": {
                    "sql": ".tables",
                    "database": database,
                    "tool_unlock_token": SQLITE_UNLOCK_TOKEN
                }
            })),
        }
    }
}

/// The `message` argument, from either the host's wrapper or bare arguments.
pub fn message_from_input(input: &Value) -> &str {
    input
        .pointer("/params/arguments/message")
        .or_else(|| input.get("message"))
        .and_then(Value::as_str)
        .unwrap_or(NO_MESSAGE)
}

/// Build the reply text from the echo and the nested call's outcome.
pub fn render(
    message: &str,
    action: &DemoAction,
    nested: Option<Result<ToolResult, LinkError>>,
) -> ToolResult {
    let mut text = format!("Echo: {message}");

    let Some(outcome) = nested else {
        return ToolResult::text(text);
    };

    match outcome {
        Ok(result) => {
            text.push_str("\n\n[DEMO] Called sqlite tool successfully!\n");
            if let DemoAction::ListTables { database } = action {
                text.push_str(&format!("Database: {database}\n"));
            }
            let pretty = serde_json::to_string_pretty(&result)
                .unwrap_or_else(|_| result.first_text().unwrap_or_default().to_string());
            text.push_str(&format!("Result:\n{pretty}"));
            ToolResult::text(text)
        }
        Err(e) => {
            text.push_str(&format!("\n\n[DEMO] SQLite tool call failed: {e}"));
            ToolResult::error(text)
        }
    }
}

pub struct DemoHandler {
    registration: ToolRegistration,
}

impl DemoHandler {
    pub fn new(tool: &ToolSettings) -> Self {
        Self {
            registration: ToolRegistration {
                tool_name: DEMO_TOOL_NAME.to_string(),
                readme: README.to_string(),
                description: DESCRIPTION.to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "message": {
                            "type": "string",
                            "description": "The message to echo back"
                        }
                    },
                    "required": ["message"]
                }),
                callback_endpoint: tool.callback_endpoint.clone(),
                api_key: tool.api_key.clone(),
            },
        }
    }
}

impl ToolHandler for DemoHandler {
    fn registration(&self) -> &ToolRegistration {
        &self.registration
    }

    fn handle(
        &self,
        input: Value,
        channel: Arc<Channel>,
    ) -> Pin<Box<dyn Future<Output = ToolResult> + Send + '_>> {
        Box::pin(async move {
            let message = message_from_input(&input);
            tracing::info!("Demo call: {message}");

            let action = DemoAction::from_message(message);
            let nested = match action.sqlite_arguments() {
                Some(arguments) => {
                    tracing::info!("Calling {NESTED_TOOL} for {action:?}");
                    Some(channel.call_tool(NESTED_TOOL, arguments).await)
                }
                None => None,
            };

            render(message, &action, nested)
        })
    }
}
