use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Mutex;
use tokio_stream::StreamExt as _;

use crate::transport::{
    Acknowledge, Delivery, DeliveryStream, Outgoing, QueueOptions, Sender, Subscriber,
};

/// In-memory sender for testing or local pipelines.
///
/// Messages are appended to a shared list instead of reaching a broker. Queue
/// declarations are recorded too, so tests can observe them.
pub struct InMemory<M> {
    sent: Arc<Mutex<Vec<Outgoing<M>>>>,
    declared: Arc<Mutex<Vec<(String, QueueOptions)>>>,
}

impl<M> InMemory<M> {
    /// Return all messages that have been "sent" and clear the internal list.
    pub async fn sent_messages(&self) -> Vec<Outgoing<M>> {
        let mut sent = self.sent.lock().await;
        std::mem::take(&mut *sent)
    }

    /// Queues declared so far, in declaration order.
    pub async fn declared_queues(&self) -> Vec<(String, QueueOptions)> {
        self.declared.lock().await.clone()
    }
}

impl<M> Clone for InMemory<M> {
    fn clone(&self) -> Self {
        Self {
            sent: Arc::clone(&self.sent),
            declared: Arc::clone(&self.declared),
        }
    }
}

impl<M> Default for InMemory<M> {
    fn default() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            declared: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait::async_trait]
impl<M> Sender<M> for InMemory<M>
where
    M: std::fmt::Debug + Send,
{
    type Error = std::io::Error;

    /// "Send" a message by declaring its queue and appending it to the list.
    #[tracing::instrument(skip_all, fields(queue = %outgoing.queue))]
    async fn send(&mut self, outgoing: Outgoing<M>) -> Result<(), Self::Error> {
        self.declared
            .lock()
            .await
            .push((outgoing.queue.clone(), QueueOptions::default()));
        tracing::debug!(msg = ?outgoing.message, "Message sent to in-memory queue");
        self.sent.lock().await.push(outgoing);
        Ok(())
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack(u64),
    Reject { delivery_tag: u64, requeue: bool },
}

/// In-memory subscriber that hands out a fixed list of message bodies.
///
/// Every delivery is settled into a shared log. The subscriber also checks
/// the prefetch bound: handing out a delivery while an earlier one is still
/// unsettled marks the subscriber as overlapped.
#[derive(Clone)]
pub struct InMemorySubscriber {
    bodies: Vec<Vec<u8>>,
    keep_open: bool,
    settlements: Arc<std::sync::Mutex<Vec<Settlement>>>,
    overlapped: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    subscribed: Arc<std::sync::Mutex<Vec<(String, u16)>>>,
}

impl InMemorySubscriber {
    pub fn new<I, B>(bodies: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        Self {
            bodies: bodies.into_iter().map(Into::into).collect(),
            keep_open: false,
            settlements: Default::default(),
            overlapped: Default::default(),
            closed: Default::default(),
            subscribed: Default::default(),
        }
    }

    /// Keep the delivery stream pending after the last body instead of ending it.
    pub fn keep_open(mut self) -> Self {
        self.keep_open = true;
        self
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        lock(&self.settlements).clone()
    }

    /// Whether a delivery was handed out before the previous one was settled.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// `(queue, prefetch)` pairs passed to [`Subscriber::subscribe`].
    pub fn subscriptions(&self) -> Vec<(String, u16)> {
        lock(&self.subscribed).clone()
    }
}

#[async_trait::async_trait]
impl Subscriber for InMemorySubscriber {
    type Acker = InMemoryAcker;
    type Error = std::io::Error;

    async fn subscribe(
        &mut self,
        queue: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream<Self::Acker, Self::Error>, Self::Error> {
        lock(&self.subscribed).push((queue.to_owned(), prefetch));

        let settlements = Arc::clone(&self.settlements);
        let overlapped = Arc::clone(&self.overlapped);
        let deliveries = std::mem::take(&mut self.bodies)
            .into_iter()
            .enumerate()
            .map(|(index, body)| (index as u64 + 1, body));

        let stream = tokio_stream::iter(deliveries).map(move |(delivery_tag, body)| {
            let unsettled = (delivery_tag - 1).saturating_sub(lock(&settlements).len() as u64);
            if unsettled >= u64::from(prefetch) {
                overlapped.store(true, Ordering::SeqCst);
            }
            Ok(Delivery {
                delivery_tag,
                redelivered: false,
                body,
                acker: InMemoryAcker {
                    delivery_tag,
                    settlements: Arc::clone(&settlements),
                },
            })
        });

        if self.keep_open {
            Ok(Box::pin(stream.chain(tokio_stream::pending())))
        } else {
            Ok(Box::pin(stream))
        }
    }

    async fn close(self) -> Result<(), Self::Error> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Acknowledger for [`InMemorySubscriber`] deliveries.
#[derive(Debug, Clone)]
pub struct InMemoryAcker {
    delivery_tag: u64,
    settlements: Arc<std::sync::Mutex<Vec<Settlement>>>,
}

#[async_trait::async_trait]
impl Acknowledge for InMemoryAcker {
    type Error = std::io::Error;

    async fn ack(&self) -> Result<(), Self::Error> {
        lock(&self.settlements).push(Settlement::Ack(self.delivery_tag));
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), Self::Error> {
        lock(&self.settlements).push(Settlement::Reject {
            delivery_tag: self.delivery_tag,
            requeue,
        });
        Ok(())
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
