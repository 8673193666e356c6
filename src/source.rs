//! Source queue abstractions and backend drivers.
//!
//! The source queue is a database-resident queue that producers write
//! [`Envelope`](crate::Envelope)s into. This module only needs one primitive
//! from it: a destructive, first-available dequeue bounded by a wait time.
//!
//! Backends report "nothing to dequeue" the way Oracle AQ does, as an error
//! carrying a well-known code. The [`SourcePoller`] turns those codes into
//! [`PollOutcome::Empty`] and everything else into
//! [`PollOutcome::Fatal`], so the bridge loop can back off differently.
//!
//! ## Components
//!
//! - [`SourceQueue`]: Trait implemented by backends
//! - [`SourcePoller`]: One dequeue attempt, classified
//! - [`inmemory::InMemorySourceQueue`]: Scripted backend for tests
//! - [`sqlx::SqlxSourceQueue`]: Postgres backend (feature-gated)

pub mod inmemory;
mod poller;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

pub use poller::{PollOutcome, SourcePoller};

/// Code reported when a dequeue waited its full window without a message
/// (ORA-25228).
pub const DEQUEUE_TIMEOUT: i32 = 25228;

/// Error codes that mean "no message available" rather than a failure.
///
/// - 25228: timeout or end-of-fetch during dequeue
/// - 25254: timeout while listening for a message
/// - 25235: all messages of the current transaction already fetched
/// - 25263: no message with the requested id
pub const NO_MESSAGE_CODES: [i32; 4] = [DEQUEUE_TIMEOUT, 25254, 25235, 25263];

/// Options applied to every dequeue.
///
/// Dequeues always remove the message (there is no browse mode) and always
/// take the first available message, with no priority or selector.
#[derive(Debug, Clone)]
pub struct DequeueOptions {
    /// How long the backend may wait for a message to become available.
    pub wait: Duration,
    /// Cuts the wait short. Never cancelled by default.
    pub cancel: CancellationToken,
}

impl Default for DequeueOptions {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(1),
            cancel: CancellationToken::new(),
        }
    }
}

/// Trait implemented by source queue backends.
///
/// Implementations must open their own connection for each call and release
/// it before returning, on every path.
#[async_trait::async_trait]
pub trait SourceQueue: Send + Sync {
    /// Remove and return the payload of the first available message.
    ///
    /// When no message arrives within `options.wait`, implementations fail
    /// with an error whose [`SourceError::code`] is [`DEQUEUE_TIMEOUT`].
    /// They report the same timeout as soon as `options.cancel` fires while
    /// they are still waiting. Once a message has been removed it must be
    /// returned, cancelled or not.
    async fn dequeue(
        &self,
        queue_name: &str,
        options: &DequeueOptions,
    ) -> Result<String, SourceError>;
}

/// Error returned by source queue operations.
#[derive(Debug)]
pub struct SourceError {
    context: SpanTrace,
    kind: SourceErrorKind,
}

/// Kinds of source queue errors.
#[derive(Debug)]
pub enum SourceErrorKind {
    /// Error reported by the store, with its vendor code when it has one.
    Store {
        code: Option<i32>,
        source: tower::BoxError,
    },
    /// A message was dequeued but its payload was blank.
    EmptyPayload,
}

impl SourceError {
    /// Create a store error, optionally tagged with a vendor code.
    pub fn store(code: Option<i32>, err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SourceErrorKind::Store {
                code,
                source: err.into(),
            },
        }
    }

    /// Create the error reported when a dequeue times out.
    pub fn timeout() -> Self {
        Self::store(
            Some(DEQUEUE_TIMEOUT),
            "timed out waiting for a message to dequeue",
        )
    }

    /// Create the error reported for a blank payload.
    pub fn empty_payload() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SourceErrorKind::EmptyPayload,
        }
    }

    /// Vendor error code, if any.
    pub fn code(&self) -> Option<i32> {
        match &self.kind {
            SourceErrorKind::Store { code, .. } => *code,
            _ => None,
        }
    }

    pub fn kind(&self) -> &SourceErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SourceErrorKind::Store {
                code: Some(code),
                source,
            } => writeln!(f, "Store error {code}: {source}"),
            SourceErrorKind::Store { code: None, source } => writeln!(f, "Store error: {source}"),
            SourceErrorKind::EmptyPayload => writeln!(f, "Dequeued message has an empty payload"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SourceErrorKind::Store { source, .. } => Some(source.as_ref()),
            SourceErrorKind::EmptyPayload => None,
        }
    }
}
