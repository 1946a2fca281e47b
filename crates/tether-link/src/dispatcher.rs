//! Runs inbound calls against the registered handler and sends the replies.

use crate::channel::{Channel, InboundCall};
use crate::handler::ToolHandler;
use std::sync::Arc;
use tether_types::ToolResult;
use tokio::task::JoinSet;

/// Handle one inbound call and reply to it.
///
/// Calls addressed to a tool this process did not register get an error
/// result, so the host's caller is answered rather than left waiting.
pub async fn dispatch(handler: Arc<dyn ToolHandler>, call: InboundCall, channel: Arc<Channel>) {
    tracing::info!("Received call {} for '{}'", call.call_id, call.tool_name);

    let result = if call.tool_name == handler.name() {
        handler.handle(call.input, Arc::clone(&channel)).await
    } else {
        tracing::warn!(
            "Call {} addressed to unknown tool '{}'",
            call.call_id,
            call.tool_name
        );
        ToolResult::error(format!(
            "Unknown tool '{}'; this process serves '{}'",
            call.tool_name,
            handler.name()
        ))
    };

    if let Err(e) = channel.reply(&call.call_id, &result).await {
        tracing::warn!("Failed to reply to call {}: {e}", call.call_id);
    }
}

/// Owns the tasks of in-flight calls for one serving session.
///
/// Every call runs in its own task, so a handler waiting on a nested call
/// never holds up the stream reader or the calls queued behind it.
pub struct Dispatcher {
    handler: Arc<dyn ToolHandler>,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            handler,
            tasks: JoinSet::new(),
        }
    }

    /// Start handling `call` in the background.
    pub fn spawn(&mut self, call: InboundCall, channel: &Arc<Channel>) {
        self.tasks.spawn(dispatch(
            Arc::clone(&self.handler),
            call,
            Arc::clone(channel),
        ));
    }

    /// Wait for the next in-flight call to finish; `None` when idle.
    pub async fn join_next(&mut self) -> Option<()> {
        let joined = self.tasks.join_next().await?;
        if let Err(e) = joined {
            if e.is_panic() {
                tracing::error!("Tool handler panicked: {e}");
            }
        }
        Some(())
    }

    /// Abort every in-flight call (shutdown or lost session).
    pub fn abort_all(&mut self) {
        if !self.tasks.is_empty() {
            tracing::debug!("Aborting {} in-flight call(s)", self.tasks.len());
        }
        self.tasks.abort_all();
    }
}
