//! Book consumer: persists books delivered by the broker.
//!
//! Deliveries are processed strictly one at a time. Each book is inserted in
//! its own transaction and the delivery is only acknowledged after the
//! commit, so a crash between the two causes a redelivery rather than a
//! lost book.

use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    codec,
    messages::BookMessage,
    store::{BookStore, StoreError, persist_book},
    transport::{Acknowledge, Delivery, Subscriber},
};

/// Unsettled deliveries allowed at once.
pub const PREFETCH: u16 = 1;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Rejected { requeue: bool },
}

/// Consumes book messages from one broker queue into a [`BookStore`].
pub struct Consumer<S> {
    store: S,
    queue: String,
}

impl<S> Consumer<S>
where
    S: BookStore,
{
    pub fn new(store: S, queue: impl Into<String>) -> Self {
        Self {
            store,
            queue: queue.into(),
        }
    }

    /// Subscribe and process deliveries until `cancel` is triggered or the
    /// delivery stream ends.
    ///
    /// A failed subscription is returned immediately. Once running, stream
    /// and handling errors are only logged. The subscriber is closed before
    /// returning.
    #[tracing::instrument(skip_all, fields(queue = %self.queue))]
    pub async fn run<B>(
        &self,
        mut subscriber: B,
        cancel: CancellationToken,
    ) -> Result<(), ConsumerError>
    where
        B: Subscriber,
    {
        let mut deliveries = subscriber
            .subscribe(&self.queue, PREFETCH)
            .await
            .map_err(|err| ConsumerError::subscribe(err.into()))?;
        tracing::info!("Consumer started");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Consumer is shutting down");
                    break;
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    if let Err(error) = self.handle_delivery(delivery).await {
                        tracing::error!(%error, "Delivery handling failed");
                    }
                }
                Some(Err(err)) => {
                    let error: tower::BoxError = err.into();
                    tracing::error!(%error, "Error receiving delivery");
                }
                None => {
                    tracing::info!("Delivery stream ended");
                    break;
                }
            }
        }

        drop(deliveries);
        subscriber
            .close()
            .await
            .map_err(|err| ConsumerError::broker(err.into()))
    }

    /// Persist one delivery and settle it.
    ///
    /// - Malformed body: rejected without requeue.
    /// - Store failure: rejected with requeue, the store error is returned
    ///   even when the reject itself fails.
    /// - Success: committed, then acknowledged.
    #[tracing::instrument(
        skip_all,
        fields(delivery_tag = delivery.delivery_tag, redelivered = delivery.redelivered)
    )]
    pub async fn handle_delivery<A>(
        &self,
        delivery: Delivery<A>,
    ) -> Result<DeliveryOutcome, ConsumerError>
    where
        A: Acknowledge,
    {
        let book: BookMessage = match codec::from_slice(&delivery.body) {
            Ok(book) => book,
            Err(error) => {
                let body = String::from_utf8_lossy(&delivery.body);
                tracing::error!(%error, %body, "Malformed book message, rejecting");
                settle(delivery.acker.reject(false)).await?;
                return Ok(DeliveryOutcome::Rejected { requeue: false });
            }
        };

        if let Err(err) = persist_book(&self.store, &book).await {
            if let Err(error) = settle(delivery.acker.reject(true)).await {
                tracing::error!(%error, "Failed to requeue delivery");
            }
            return Err(ConsumerError::store(err.into_inner()));
        }

        settle(delivery.acker.ack()).await?;
        tracing::info!(author_id = book.author_id, "Book message acknowledged");
        Ok(DeliveryOutcome::Acked)
    }
}

async fn settle<E>(
    result: impl std::future::Future<Output = Result<(), E>>,
) -> Result<(), ConsumerError>
where
    E: Into<tower::BoxError>,
{
    result
        .await
        .map_err(|err| ConsumerError::broker(err.into()))
}

/// Error returned by the consumer.
#[derive(Debug)]
pub struct ConsumerError {
    context: SpanTrace,
    kind: ConsumerErrorKind,
}

#[derive(Debug)]
pub enum ConsumerErrorKind {
    /// The subscription could not be established.
    Subscribe(tower::BoxError),
    /// Settling a delivery or closing the subscription failed.
    Broker(tower::BoxError),
    /// Persisting the book failed; the delivery was requeued.
    Store(StoreError),
}

impl ConsumerError {
    fn subscribe(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumerErrorKind::Subscribe(err),
        }
    }

    fn broker(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumerErrorKind::Broker(err),
        }
    }

    fn store(err: StoreError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumerErrorKind::Store(err),
        }
    }

    pub fn kind(&self) -> &ConsumerErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConsumerErrorKind::Subscribe(err) => writeln!(f, "Subscription error: {err}"),
            ConsumerErrorKind::Broker(err) => writeln!(f, "Broker error: {err}"),
            ConsumerErrorKind::Store(err) => writeln!(f, "Store error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumerErrorKind::Subscribe(err) | ConsumerErrorKind::Broker(err) => {
                Some(err.as_ref())
            }
            ConsumerErrorKind::Store(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_stream::StreamExt as _;

    use super::*;
    use crate::{
        store::inmemory::{InMemoryBookStore, StoreEvent},
        transport::{DeliveryStream, InMemoryAcker, InMemorySubscriber, Settlement},
    };

    const QUEUE: &str = "book_creation_queue";

    fn book(author_id: i64) -> BookMessage {
        BookMessage {
            author_id,
            title: format!("Book registered for author {author_id}"),
            num_pages: 80,
            category: "SELF-HELP".into(),
        }
    }

    fn body(author_id: i64) -> Vec<u8> {
        serde_json::to_vec(&book(author_id)).unwrap()
    }

    async fn first_delivery(
        body: impl Into<Vec<u8>>,
    ) -> (InMemorySubscriber, Delivery<InMemoryAcker>) {
        let body: Vec<u8> = body.into();
        let mut subscriber = InMemorySubscriber::new([body]);
        let mut stream = subscriber.subscribe(QUEUE, PREFETCH).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        (subscriber, delivery)
    }

    #[tokio::test]
    async fn deliveries_are_persisted_and_acked_in_order() {
        let store = InMemoryBookStore::default();
        let subscriber = InMemorySubscriber::new([body(1), body(2), body(3)]);
        let consumer = Consumer::new(store.clone(), QUEUE);

        consumer
            .run(subscriber.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(store.books(), vec![book(1), book(2), book(3)]);
        assert_eq!(
            subscriber.settlements(),
            vec![Settlement::Ack(1), Settlement::Ack(2), Settlement::Ack(3)]
        );
        assert_eq!(subscriber.subscriptions(), vec![(QUEUE.to_owned(), 1)]);
        assert!(!subscriber.overlapped());
        assert!(subscriber.is_closed());
    }

    #[tokio::test]
    async fn commit_happens_before_ack() {
        let store = InMemoryBookStore::default();
        let (subscriber, delivery) = first_delivery(body(5)).await;
        let consumer = Consumer::new(store.clone(), QUEUE);

        assert!(subscriber.settlements().is_empty());
        let outcome = consumer.handle_delivery(delivery).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Acked);
        assert_eq!(
            store.events(),
            vec![StoreEvent::Begin, StoreEvent::Insert(book(5)), StoreEvent::Commit]
        );
        assert_eq!(subscriber.settlements(), vec![Settlement::Ack(1)]);
    }

    #[tokio::test]
    async fn field_names_are_matched_case_insensitively() {
        let store = InMemoryBookStore::default();
        let (_, delivery) = first_delivery(
            r#"{"AuthorId":5,"Title":"T","NumPages":60,"Category":"ROMANCE"}"#,
        )
        .await;

        let outcome = Consumer::new(store.clone(), QUEUE)
            .handle_delivery(delivery)
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Acked);
        assert_eq!(store.books()[0].num_pages, 60);
    }

    #[tokio::test]
    async fn malformed_body_is_dropped() {
        let store = InMemoryBookStore::default();
        let (subscriber, delivery) = first_delivery("{not json").await;

        let outcome = Consumer::new(store.clone(), QUEUE)
            .handle_delivery(delivery)
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Rejected { requeue: false });
        assert_eq!(
            subscriber.settlements(),
            vec![Settlement::Reject {
                delivery_tag: 1,
                requeue: false
            }]
        );
        assert!(store.events().is_empty());
    }

    #[tokio::test]
    async fn insert_failure_rolls_back_and_requeues() {
        let store = InMemoryBookStore::default().fail_inserts();
        let (subscriber, delivery) = first_delivery(body(1)).await;

        let err = Consumer::new(store.clone(), QUEUE)
            .handle_delivery(delivery)
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), ConsumerErrorKind::Store(_)));
        assert_eq!(store.events(), vec![StoreEvent::Begin, StoreEvent::Rollback]);
        assert!(!store.events().contains(&StoreEvent::Commit));
        assert_eq!(
            subscriber.settlements(),
            vec![Settlement::Reject {
                delivery_tag: 1,
                requeue: true
            }]
        );
    }

    /// Acker whose channel is already gone.
    struct ClosedChannel;

    #[async_trait::async_trait]
    impl Acknowledge for ClosedChannel {
        type Error = std::io::Error;

        async fn ack(&self) -> Result<(), Self::Error> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel closed"))
        }

        async fn reject(&self, _requeue: bool) -> Result<(), Self::Error> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel closed"))
        }
    }

    #[tokio::test]
    async fn store_error_survives_a_failed_requeue() {
        let store = InMemoryBookStore::default().fail_inserts();
        let delivery = Delivery {
            delivery_tag: 1,
            redelivered: true,
            body: body(1),
            acker: ClosedChannel,
        };

        let err = Consumer::new(store.clone(), QUEUE)
            .handle_delivery(delivery)
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), ConsumerErrorKind::Store(_)));
        assert_eq!(store.events(), vec![StoreEvent::Begin, StoreEvent::Rollback]);
    }

    #[tokio::test]
    async fn unreachable_store_requeues() {
        let store = InMemoryBookStore::default().unavailable();
        let (subscriber, delivery) = first_delivery(body(1)).await;

        let err = Consumer::new(store, QUEUE)
            .handle_delivery(delivery)
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), ConsumerErrorKind::Store(_)));
        assert_eq!(
            subscriber.settlements(),
            vec![Settlement::Reject {
                delivery_tag: 1,
                requeue: true
            }]
        );
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_loop() {
        let store = InMemoryBookStore::default();
        let subscriber = InMemorySubscriber::new([b"null".to_vec(), body(2)]);

        Consumer::new(store.clone(), QUEUE)
            .run(subscriber.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(store.books(), vec![book(2)]);
        assert_eq!(
            subscriber.settlements(),
            vec![
                Settlement::Reject {
                    delivery_tag: 1,
                    requeue: false
                },
                Settlement::Ack(2)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_closes_the_subscription() {
        let subscriber = InMemorySubscriber::new([body(1)]).keep_open();
        let store = InMemoryBookStore::default();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let subscriber = subscriber.clone();
            let cancel = cancel.clone();
            async move { Consumer::new(store, QUEUE).run(subscriber, cancel).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!subscriber.is_closed());

        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(subscriber.settlements(), vec![Settlement::Ack(1)]);
        assert!(subscriber.is_closed());
    }

    struct Unreachable;

    #[async_trait::async_trait]
    impl Subscriber for Unreachable {
        type Acker = InMemoryAcker;
        type Error = std::io::Error;

        async fn subscribe(
            &mut self,
            _queue: &str,
            _prefetch: u16,
        ) -> Result<DeliveryStream<Self::Acker, Self::Error>, Self::Error> {
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "broker unreachable",
            ))
        }

        async fn close(self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn subscription_failure_is_returned() {
        let err = Consumer::new(InMemoryBookStore::default(), QUEUE)
            .run(Unreachable, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), ConsumerErrorKind::Subscribe(_)));
    }
}
