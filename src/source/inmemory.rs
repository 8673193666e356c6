use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::Mutex, time::Instant};

use crate::{
    Envelope,
    source::{DequeueOptions, SourceError, SourceQueue},
};

#[derive(Debug)]
enum Scripted {
    Payload(String),
    Error(Option<i32>),
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Scripted>>,
    dequeues: Vec<(Instant, Duration)>,
}

/// An in-memory source queue for testing or local usage.
///
/// Each named queue holds a script of payloads and errors, returned in
/// order. Once a queue runs dry, dequeues time out immediately instead of
/// waiting. Every dequeue attempt is recorded with its (tokio) instant.
#[derive(Clone, Default)]
pub struct InMemorySourceQueue {
    state: Arc<Mutex<State>>,
}

impl InMemorySourceQueue {
    /// Append a raw payload.
    pub async fn push(&self, queue_name: &str, payload: impl Into<String>) {
        self.script(queue_name, Scripted::Payload(payload.into()))
            .await;
    }

    /// Append a serialized envelope.
    pub async fn push_envelope(&self, queue_name: &str, envelope: &Envelope) {
        let payload = serde_json::to_string(envelope).unwrap_or_default();
        self.push(queue_name, payload).await;
    }

    /// Append a store error with the given vendor code.
    pub async fn push_error(&self, queue_name: &str, code: Option<i32>) {
        self.script(queue_name, Scripted::Error(code)).await;
    }

    /// Instants at which dequeues were attempted.
    pub async fn dequeue_times(&self) -> Vec<Instant> {
        self.state
            .lock()
            .await
            .dequeues
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    /// Wait passed to the most recent dequeue.
    pub async fn last_wait(&self) -> Option<Duration> {
        self.state.lock().await.dequeues.last().map(|(_, wait)| *wait)
    }

    /// Number of scripted entries not yet dequeued.
    pub async fn pending(&self, queue_name: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue_name)
            .map_or(0, VecDeque::len)
    }

    async fn script(&self, queue_name: &str, entry: Scripted) {
        self.state
            .lock()
            .await
            .queues
            .entry(queue_name.to_owned())
            .or_default()
            .push_back(entry);
    }
}

#[async_trait]
impl SourceQueue for InMemorySourceQueue {
    async fn dequeue(
        &self,
        queue_name: &str,
        options: &DequeueOptions,
    ) -> Result<String, SourceError> {
        let mut state = self.state.lock().await;
        state.dequeues.push((Instant::now(), options.wait));

        match state
            .queues
            .get_mut(queue_name)
            .and_then(VecDeque::pop_front)
        {
            Some(Scripted::Payload(payload)) => Ok(payload),
            Some(Scripted::Error(code)) => Err(SourceError::store(
                code,
                format!("scripted failure on queue {queue_name}"),
            )),
            None => Err(SourceError::timeout()),
        }
    }
}
