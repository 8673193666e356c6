//! Typed publisher over a transport stack.

use tower::{Service, ServiceExt, util::BoxCloneService};

use crate::transport::{Outgoing, Transport, TransportError};

/// Publishes one kind of outbound message.
///
/// A publisher wraps a fully layered [`Transport`] (typically
/// `Transport::new(RabbitMq::connect(..).await?).layer(JsonLayer)`), so the
/// message is serialized and its queue declared by the stack underneath.
/// It is meant to be owned by a single strategy; publishes are sequential.
pub struct Publisher<M> {
    service: BoxCloneService<Outgoing<M>, (), TransportError>,
}

impl<M> Publisher<M>
where
    M: Send + 'static,
{
    pub fn new<S>(transport: Transport<S>) -> Self
    where
        Transport<S>: Service<Outgoing<M>, Response = (), Error = TransportError>
            + Clone
            + Send
            + 'static,
        <Transport<S> as Service<Outgoing<M>>>::Future: Send + 'static,
    {
        Self {
            service: BoxCloneService::new(transport),
        }
    }

    /// Publish `message` to `queue`.
    #[tracing::instrument(skip(self, message))]
    pub async fn publish(&mut self, queue: &str, message: M) -> Result<(), TransportError> {
        tracing::info!(queue, "Publishing message");
        self.service
            .ready()
            .await?
            .call(Outgoing::new(queue, message))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::BookMessage,
        transport::{InMemory, QueueOptions, RawPayload, layers::JsonLayer},
    };

    fn book() -> BookMessage {
        BookMessage {
            author_id: 7,
            title: "Book registered for author Ana".into(),
            num_pages: 120,
            category: "SCIENTIFIC".into(),
        }
    }

    #[tokio::test]
    async fn publishes_camel_case_json_to_queue() {
        let sender: InMemory<RawPayload> = InMemory::default();
        let mut publisher = Publisher::new(Transport::new(sender.clone()).layer(JsonLayer));

        publisher.publish("book_creation_queue", book()).await.unwrap();

        let sent = sender.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].queue, "book_creation_queue");
        let json: serde_json::Value = serde_json::from_slice(&sent[0].message.0).unwrap();
        assert_eq!(json["authorId"], 7);
        assert_eq!(json["numPages"], 120);
    }

    #[tokio::test]
    async fn repeated_publishes_redeclare_the_same_queue() {
        let sender: InMemory<RawPayload> = InMemory::default();
        let mut publisher = Publisher::new(Transport::new(sender.clone()).layer(JsonLayer));

        publisher.publish("books", book()).await.unwrap();
        publisher.publish("books", book()).await.unwrap();

        let declared = sender.declared_queues().await;
        assert_eq!(
            declared,
            vec![
                ("books".to_owned(), QueueOptions::default()),
                ("books".to_owned(), QueueOptions::default()),
            ]
        );
        assert_eq!(sender.sent_messages().await.len(), 2);
    }
}
