//! The handler trait implemented by whatever logic a process exposes as a tool.

use crate::channel::Channel;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tether_types::{ToolRegistration, ToolResult};

/// Logic behind the single tool a process registers with the host.
///
/// `handle` receives the call input and the live channel, so an implementation
/// can make nested `tools/call` requests before it returns. Failures should be
/// expressed as an error-flagged [`ToolResult`]; a reply is always sent.
pub trait ToolHandler: Send + Sync {
    /// What gets registered: name, readme, description and parameter schema.
    fn registration(&self) -> &ToolRegistration;

    /// The tool name inbound calls are addressed to.
    fn name(&self) -> &str {
        &self.registration().tool_name
    }

    /// Handle one inbound call.
    ///
    /// The channel is passed as an `Arc` so the future can outlive the
    /// dispatcher's borrow.
    fn handle(
        &self,
        input: serde_json::Value,
        channel: Arc<Channel>,
    ) -> Pin<Box<dyn Future<Output = ToolResult> + Send + '_>>;
}
