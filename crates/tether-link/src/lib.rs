//! Reverse-connection transport for Tether.
//!
//! A process using this crate discovers a locally running host, opens a
//! long-lived SSE channel to it, registers a tool, and then answers the calls
//! the host routes to that tool. Replies to the process's own requests arrive
//! on the same stream and are matched back to their callers by request id.

pub mod backoff;
pub mod channel;
pub mod controller;
pub mod discovery;
pub mod dispatcher;
pub mod handler;
pub mod jsonrpc;
pub mod registration;
pub mod sse;

pub use backoff::{BackoffConfig, RetryState};
pub use channel::{Channel, ChannelOptions, HostTool, InboundCall};
pub use controller::{Controller, LinkSettings, LinkState};
pub use discovery::{Discovery, ManifestDiscovery, ServerConfig, StaticDiscovery};
pub use dispatcher::{Dispatcher, dispatch};
pub use handler::ToolHandler;
