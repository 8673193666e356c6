//! Bridge loop moving messages from the source queue to the broker.
//!
//! The bridge repeatedly:
//!
//! - Dequeues one raw payload through a [`SourcePoller`]
//! - Decodes it as an [`Envelope`]
//! - Dispatches it to the matching strategy through a [`StrategyRouter`]
//!
//! Malformed envelopes and dispatch failures are logged and skipped. Empty
//! polls and poll failures back off before the next attempt. The loop only
//! ends when its [`CancellationToken`] is triggered.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{
    Envelope, codec,
    router::{RouteError, RouteErrorKind, StrategyRouter},
    source::{PollOutcome, SourceError, SourceErrorKind, SourcePoller, SourceQueue},
    strategy::{AuthorStrategy, ClientStrategy, MessageStrategy},
};

/// Pause after a poll that found nothing.
pub const EMPTY_BACKOFF: Duration = Duration::from_secs(5);
/// Pause after a failed poll.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// Source-to-broker bridge.
///
/// Generic parameters:
/// - `Q`: Source queue implementation
/// - `HK`: Hook implementation for lifecycle events
/// - `A`, `C`: Author and client strategies
pub struct Bridge<Q, HK = DefaultBridgeHook, A = AuthorStrategy, C = ClientStrategy> {
    poller: SourcePoller<Q>,
    router: StrategyRouter<A, C>,
    hook: HK,
    empty_backoff: Duration,
    error_backoff: Duration,
}

impl<Q, A, C> Bridge<Q, DefaultBridgeHook, A, C>
where
    Q: SourceQueue,
    A: MessageStrategy,
    C: MessageStrategy,
{
    /// Create a bridge with the default hook and backoffs.
    pub fn new(poller: SourcePoller<Q>, router: StrategyRouter<A, C>) -> Self {
        Self {
            poller,
            router,
            hook: DefaultBridgeHook,
            empty_backoff: EMPTY_BACKOFF,
            error_backoff: ERROR_BACKOFF,
        }
    }
}

impl<Q, HK, A, C> Bridge<Q, HK, A, C>
where
    Q: SourceQueue,
    HK: BridgeHook,
    A: MessageStrategy,
    C: MessageStrategy,
{
    /// Replace the hook while keeping everything else.
    pub fn with_hook<HK2: BridgeHook>(self, hook: HK2) -> Bridge<Q, HK2, A, C> {
        Bridge {
            poller: self.poller,
            router: self.router,
            hook,
            empty_backoff: self.empty_backoff,
            error_backoff: self.error_backoff,
        }
    }

    /// Override the pauses after empty and failed polls.
    pub fn with_backoff(mut self, empty: Duration, error: Duration) -> Self {
        self.empty_backoff = empty;
        self.error_backoff = error;
        self
    }

    /// Run the bridge loop until `cancel` is triggered.
    ///
    /// Cancellation is observed during backoff and, through the dequeue
    /// options, by the source while it waits for a message. A poll itself is
    /// never abandoned: a message that was already dequeued is no longer in
    /// the source queue, so it is always dispatched to completion first.
    #[tracing::instrument(skip_all, fields(queue = %self.poller.queue_name()))]
    pub async fn run(mut self, cancel: CancellationToken) {
        self.hook.on_startup();
        self.poller.set_cancellation(cancel.clone());

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let backoff = match self.poller.poll().await {
                PollOutcome::Message(raw) => {
                    self.forward(&raw).await;
                    continue;
                }
                PollOutcome::Empty => {
                    self.hook.on_empty_poll();
                    self.empty_backoff
                }
                PollOutcome::Fatal(err) => {
                    self.hook.on_poll_error(&err);
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        self.hook.on_shutdown();
    }

    async fn forward(&mut self, raw: &str) {
        self.hook.on_message_received(raw);

        let envelope: Envelope = match codec::from_str(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.hook.on_malformed_envelope(raw, &err);
                return;
            }
        };

        match self.router.route(&envelope).await {
            Ok(()) => self.hook.on_dispatched(&envelope),
            Err(err) => self.hook.on_dispatch_error(&envelope, &err),
        }
    }
}

/// Hook trait for observing bridge lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait BridgeHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_message_received(&self, raw: &str);
    fn on_empty_poll(&self);
    fn on_poll_error(&self, error: &SourceError);
    fn on_malformed_envelope(&self, raw: &str, error: &dyn std::error::Error);
    fn on_dispatched(&self, envelope: &Envelope);
    fn on_dispatch_error(&self, envelope: &Envelope, error: &RouteError);
}

/// Default bridge hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultBridgeHook;

impl BridgeHook for DefaultBridgeHook {
    fn on_startup(&self) {
        tracing::info!("Bridge is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Bridge is shutting down");
    }

    fn on_message_received(&self, _raw: &str) {
        tracing::debug!("Message dequeued");
    }

    fn on_empty_poll(&self) {
        tracing::debug!("No message available");
    }

    fn on_poll_error(&self, error: &SourceError) {
        match error.kind() {
            SourceErrorKind::EmptyPayload => {
                tracing::warn!("Dequeued message has no payload, skipping")
            }
            SourceErrorKind::Store { .. } => tracing::error!(%error, "Error dequeuing message"),
        }
    }

    fn on_malformed_envelope(&self, raw: &str, error: &dyn std::error::Error) {
        tracing::error!(%error, raw, "Malformed envelope, skipping");
    }

    fn on_dispatched(&self, envelope: &Envelope) {
        tracing::debug!(tag = envelope.table, "Message dispatched");
    }

    fn on_dispatch_error(&self, envelope: &Envelope, error: &RouteError) {
        match error.kind() {
            // The router already warned.
            RouteErrorKind::UnsupportedTag(_) => {
                tracing::debug!(tag = envelope.table, "Message skipped")
            }
            RouteErrorKind::Strategy(_) => {
                tracing::error!(tag = envelope.table, %error, "Error dispatching message")
            }
        }
    }
}
