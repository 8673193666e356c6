//! Broker transport abstractions and backends.
//!
//! The publishing half is a Tower-compatible stack used to send
//! [`Outgoing`] messages through a backend (in-memory or RabbitMQ). Layers
//! such as [`layers::JsonLayer`] turn typed messages into raw bytes before
//! they reach the backend, so backends never see message types.
//!
//! The consuming half is the [`Subscriber`] trait: a backend yields a stream
//! of [`Delivery`] values, each carrying an acknowledger that settles it.
//!
//! ## Key components
//!
//! - [`Transport`]: Public-facing wrapper implementing `tower::Service`
//! - [`SenderService`]: Adapter from a [`Sender`] to a Tower service
//! - [`Sender`]: Trait implemented by concrete sender backends
//! - [`Subscriber`] / [`Acknowledge`]: Trait pair implemented by consuming backends
//! - [`TransportError`]: Unified error type with tracing context

mod inmemory;

pub mod layers;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures_core::stream::BoxStream;
use tower::Service;
use tracing_error::SpanTrace;

pub use inmemory::{InMemory, InMemoryAcker, InMemorySubscriber, Settlement};

/// A message addressed to a broker queue.
///
/// Messages are published on the default exchange, so the queue name doubles
/// as the routing key.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing<M> {
    /// Target queue.
    pub queue: String,
    /// Message payload.
    pub message: M,
}

impl<M> Outgoing<M> {
    pub fn new(queue: impl Into<String>, message: M) -> Self {
        Self {
            queue: queue.into(),
            message,
        }
    }
}

/// Declaration parameters for a broker queue.
///
/// The default is a plain queue: non-durable, non-exclusive and never
/// auto-deleted. Declaring it repeatedly with the same parameters is a no-op
/// on the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` wraps an underlying Tower `Service` and normalizes its errors
/// into [`TransportError`]. It is typically built from a concrete [`Sender`]
/// and then layered:
///
/// ```rust
/// use queuebridge::transport::{InMemory, Transport, layers::JsonLayer};
///
/// let sender: InMemory<Vec<u8>> = InMemory::default();
/// let _transport = Transport::new(sender).layer(JsonLayer);
/// ```
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Create a new transport from a concrete sender backend.
    pub fn new(driver: D) -> Self {
        Self {
            service: SenderService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }
}

impl<R, S> Service<R> for Transport<S>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
    R: Send + 'static,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::classify(e.into()))
    }

    fn call(&mut self, req: R) -> Self::Future {
        // Take the readied service and leave a fresh clone behind.
        let clone = self.service.clone();
        let mut service = std::mem::replace(&mut self.service, clone);

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| TransportError::classify(e.into()))?;
            Ok(())
        })
    }
}

/// Error returned by transport operations.
///
/// Each error captures the underlying error kind and a tracing span trace.
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// The broker connection or channel could not be established.
    ChannelUnavailable(tower::BoxError),
    /// Errors originating from the backend while sending or settling.
    Sender(tower::BoxError),
    /// Errors related to serialization.
    Serde(tower::BoxError),
}

impl TransportError {
    /// Create a connection-related transport error.
    pub fn channel_unavailable(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::ChannelUnavailable(err.into()),
        }
    }

    /// Create a sender-related transport error.
    pub fn sender(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Sender(err.into()),
        }
    }

    /// Create a serialization-related transport error.
    pub fn serde(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Serde(err.into()),
        }
    }

    /// Wrap an error coming out of a service stack, keeping nested transport
    /// errors intact and recognizing serialization failures.
    fn classify(err: tower::BoxError) -> Self {
        let err = match err.downcast::<TransportError>() {
            Ok(inner) => return *inner,
            Err(err) => err,
        };
        if err.is::<serde_json::Error>() {
            Self::serde(err)
        } else {
            Self::sender(err)
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::ChannelUnavailable(err) => {
                writeln!(f, "Broker channel unavailable: {err}")
            }
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            TransportErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::ChannelUnavailable(err) => Some(err.as_ref()),
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::Serde(err) => Some(err.as_ref()),
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

impl<M, D> Service<Outgoing<M>> for SenderService<D>
where
    M: Send + 'static,
    D: Sender<M> + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Outgoing<M>) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by concrete sender backends.
///
/// A sender delivers an [`Outgoing`] message to its queue on the broker.
#[async_trait::async_trait]
pub trait Sender<M> {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Send a message using the underlying transport.
    async fn send(&mut self, outgoing: Outgoing<M>) -> Result<(), Self::Error>;
}

/// A message handed out by a [`Subscriber`].
///
/// The delivery stays unsettled on the broker until its acknowledger is used.
#[derive(Debug)]
pub struct Delivery<A> {
    /// Broker-assigned tag, unique per channel.
    pub delivery_tag: u64,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    /// Raw message body.
    pub body: Vec<u8>,
    /// Handle used to settle the delivery.
    pub acker: A,
}

/// Settles a single delivery.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Acknowledge the delivery, removing it from the queue.
    async fn ack(&self) -> Result<(), Self::Error>;

    /// Reject the delivery, optionally asking the broker to redeliver it.
    async fn reject(&self, requeue: bool) -> Result<(), Self::Error>;
}

/// Stream of deliveries returned by [`Subscriber::subscribe`].
pub type DeliveryStream<A, E> = BoxStream<'static, Result<Delivery<A>, E>>;

/// Trait implemented by consuming backends.
#[async_trait::async_trait]
pub trait Subscriber: Send {
    /// Acknowledger attached to each delivery.
    type Acker: Acknowledge + Send + 'static;
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send + 'static;

    /// Start consuming `queue` with at most `prefetch` unsettled deliveries.
    async fn subscribe(
        &mut self,
        queue: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream<Self::Acker, Self::Error>, Self::Error>;

    /// Cancel the subscription and release the underlying connection.
    async fn close(self) -> Result<(), Self::Error>
    where
        Self: Sized;
}

/// Wrapper type for raw byte payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload(pub(crate) Vec<u8>);

impl From<Vec<u8>> for RawPayload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

/// Trait for values that can be viewed as raw bytes.
///
/// This abstraction avoids unnecessary allocations when handling payloads.
pub trait ToBytes {
    /// Convert the value into a byte slice.
    fn to_bytes(&self) -> &[u8];
}

impl ToBytes for RawPayload {
    fn to_bytes(&self) -> &[u8] {
        &self.0
    }
}
