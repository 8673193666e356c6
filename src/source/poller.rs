use crate::source::{DequeueOptions, NO_MESSAGE_CODES, SourceError, SourceQueue};

/// Result of a single dequeue attempt.
#[derive(Debug)]
pub enum PollOutcome {
    /// A message was dequeued; the raw JSON payload, not yet decoded.
    Message(String),
    /// Nothing became available within the wait window.
    Empty,
    /// The attempt failed.
    Fatal(SourceError),
}

/// Performs one dequeue attempt at a time against a [`SourceQueue`].
///
/// The poller knows nothing about envelopes; decoding is left to the caller.
pub struct SourcePoller<Q> {
    queue: Q,
    queue_name: String,
    options: DequeueOptions,
    no_message_codes: Vec<i32>,
}

impl<Q> SourcePoller<Q>
where
    Q: SourceQueue,
{
    /// Create a poller with the default wait and "no message" codes.
    pub fn new(queue: Q, queue_name: impl Into<String>) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            options: DequeueOptions::default(),
            no_message_codes: NO_MESSAGE_CODES.to_vec(),
        }
    }

    /// Sets how long each dequeue waits for a message.
    pub fn with_wait(mut self, wait: std::time::Duration) -> Self {
        self.options.wait = wait;
        self
    }

    /// Replaces the set of error codes treated as "no message".
    pub fn with_no_message_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.no_message_codes = codes.into_iter().collect();
        self
    }

    /// Lets `cancel` interrupt the backend while it waits for a message.
    pub fn set_cancellation(&mut self, cancel: tokio_util::sync::CancellationToken) {
        self.options.cancel = cancel;
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Dequeue once and classify the result.
    #[tracing::instrument(skip(self), fields(queue = %self.queue_name))]
    pub async fn poll(&self) -> PollOutcome {
        tracing::debug!("Starting dequeue");
        match self.queue.dequeue(&self.queue_name, &self.options).await {
            Ok(payload) if payload.trim().is_empty() => {
                PollOutcome::Fatal(SourceError::empty_payload())
            }
            Ok(payload) => {
                tracing::debug!(%payload, "Payload dequeued");
                PollOutcome::Message(payload)
            }
            Err(err) if self.is_no_message(&err) => PollOutcome::Empty,
            Err(err) => PollOutcome::Fatal(err),
        }
    }

    fn is_no_message(&self, err: &SourceError) -> bool {
        err.code()
            .is_some_and(|code| self.no_message_codes.contains(&code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SourceErrorKind, inmemory::InMemorySourceQueue};
    use std::time::Duration;

    const QUEUE: &str = "authors";

    #[tokio::test]
    async fn message_is_returned_undecoded() {
        let queue = InMemorySourceQueue::default();
        queue.push(QUEUE, "{not json").await;
        let poller = SourcePoller::new(queue, QUEUE);

        assert!(matches!(poller.poll().await, PollOutcome::Message(p) if p == "{not json"));
    }

    #[tokio::test]
    async fn no_message_codes_are_empty() {
        let queue = InMemorySourceQueue::default();
        queue.push_error(QUEUE, Some(25228)).await;
        queue.push_error(QUEUE, Some(25254)).await;
        let poller = SourcePoller::new(queue, QUEUE);

        assert!(matches!(poller.poll().await, PollOutcome::Empty));
        assert!(matches!(poller.poll().await, PollOutcome::Empty));
        // Exhausted queue times out.
        assert!(matches!(poller.poll().await, PollOutcome::Empty));
    }

    #[tokio::test]
    async fn other_errors_are_fatal() {
        let queue = InMemorySourceQueue::default();
        queue.push_error(QUEUE, Some(12541)).await;
        queue.push_error(QUEUE, None).await;
        let poller = SourcePoller::new(queue, QUEUE);

        for _ in 0..2 {
            assert!(matches!(poller.poll().await, PollOutcome::Fatal(_)));
        }
    }

    #[tokio::test]
    async fn blank_payload_is_fatal() {
        let queue = InMemorySourceQueue::default();
        queue.push(QUEUE, "   ").await;
        let poller = SourcePoller::new(queue, QUEUE);

        match poller.poll().await {
            PollOutcome::Fatal(err) => {
                assert!(matches!(err.kind(), SourceErrorKind::EmptyPayload))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn custom_codes_replace_defaults() {
        let queue = InMemorySourceQueue::default();
        queue.push_error(QUEUE, Some(25254)).await;
        let poller = SourcePoller::new(queue.clone(), QUEUE)
            .with_no_message_codes([25228])
            .with_wait(Duration::from_secs(2));

        assert!(matches!(poller.poll().await, PollOutcome::Fatal(_)));
        assert_eq!(queue.last_wait().await, Some(Duration::from_secs(2)));
    }
}
