//! The registration/reconnection state machine.
//!
//! One [`Controller::run`] call drives the whole lifecycle: discover the host,
//! open a channel, verify the registrar, register, serve inbound calls, and on
//! any failure or disconnect back off and start over with a fresh channel.
//! Only the cancellation token ends the loop.

use crate::backoff::{BackoffConfig, RetryState, sleep_or_cancel};
use crate::channel::{Channel, ChannelOptions};
use crate::discovery::Discovery;
use crate::dispatcher::Dispatcher;
use crate::handler::ToolHandler;
use crate::registration;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tether_types::LinkError;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Discovering,
    Connecting,
    Verifying,
    Registering,
    Serving,
    /// A serving session was lost; waiting to rediscover.
    Degraded,
    Stopped,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Discovering => "discovering",
            Self::Connecting => "connecting",
            Self::Verifying => "verifying",
            Self::Registering => "registering",
            Self::Serving => "serving",
            Self::Degraded => "degraded",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Tunables for the controller and the channels it opens.
#[derive(Debug, Clone, Default)]
pub struct LinkSettings {
    pub channel: ChannelOptions,
    pub backoff: BackoffConfig,
}

enum SessionEnd {
    Shutdown,
    StreamLost,
}

/// Keeps one tool registered with the host for as long as the process runs.
pub struct Controller {
    discovery: Arc<dyn Discovery>,
    handler: Arc<dyn ToolHandler>,
    settings: LinkSettings,
    state: watch::Sender<LinkState>,
    /// Mirror of the run loop's consecutive-failure count.
    attempt: AtomicU32,
}

impl Controller {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        handler: Arc<dyn ToolHandler>,
        settings: LinkSettings,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Idle);
        Self {
            discovery,
            handler,
            settings,
            state,
            attempt: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Consecutive failures counted toward the next reconnect delay.
    pub fn retry_attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    fn record(&self, retry: &RetryState) {
        self.attempt.store(retry.attempt, Ordering::SeqCst);
    }

    fn transition(&self, next: LinkState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::info!("Link state: {prev} -> {next}");
        }
    }

    /// Run until `cancel` fires. Network and host failures are retried forever.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut retry = RetryState::default();

        loop {
            match self.establish(&cancel).await {
                Ok(channel) => {
                    retry.reset();
                    self.record(&retry);
                    match self.serve(channel, &cancel).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::StreamLost => {
                            retry.stream_lost();
                            self.record(&retry);
                            self.transition(LinkState::Degraded);
                            tracing::warn!("Lost connection to host");
                        }
                    }
                }
                Err(_) if cancel.is_cancelled() => break,
                Err(e) => {
                    tracing::warn!("Connection attempt failed in {} state: {e}", self.state());
                    retry.record_failure();
                    self.record(&retry);
                }
            }

            let delay = retry.delay(&self.settings.backoff);
            tracing::info!("Reconnecting in {delay:?} (attempt {})", retry.attempt);
            if !sleep_or_cancel(delay, &cancel).await {
                break;
            }
        }

        self.transition(LinkState::Stopped);
        tracing::info!("Link stopped");
    }

    /// Discover, connect, verify and register. The channel is dropped on failure.
    async fn establish(&self, cancel: &CancellationToken) -> Result<Arc<Channel>, LinkError> {
        self.transition(LinkState::Discovering);
        let config = tokio::select! {
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            discovered = self.discovery.discover() => discovered?,
        };
        tracing::info!("Discovered host at {}", config.endpoint_url);

        self.transition(LinkState::Connecting);
        let channel = Channel::connect(&config, self.settings.channel.clone(), cancel).await?;

        self.transition(LinkState::Verifying);
        registration::verify_registrar(&channel).await?;

        self.transition(LinkState::Registering);
        registration::register(&channel, self.handler.registration()).await?;

        Ok(Arc::new(channel))
    }

    /// Serve inbound calls until the stream dies or shutdown is requested.
    async fn serve(&self, channel: Arc<Channel>, cancel: &CancellationToken) -> SessionEnd {
        self.transition(LinkState::Serving);
        tracing::info!(
            "Serving '{}'; waiting for calls",
            self.handler.name()
        );

        let mut dispatcher = Dispatcher::new(Arc::clone(&self.handler));
        let end = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break SessionEnd::Shutdown,
                call = channel.next_inbound() => match call {
                    Some(call) => dispatcher.spawn(call, &channel),
                    None => break SessionEnd::StreamLost,
                },
                Some(()) = dispatcher.join_next() => {}
                _ = channel.closed() => break SessionEnd::StreamLost,
            }
        };

        dispatcher.abort_all();
        channel.close().await;
        end
    }
}
