use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    messages::BookMessage,
    store::{BookStore, BookTransaction, StoreError},
};

/// Operation recorded by [`InMemoryBookStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Begin,
    Insert(BookMessage),
    Commit,
    Rollback,
}

#[derive(Default)]
struct State {
    events: Vec<StoreEvent>,
    books: Vec<BookMessage>,
}

/// An in-memory book store for testing or local usage.
///
/// Every operation is appended to an event log; committed books are kept in
/// insertion order. Failures can be switched on per operation.
#[derive(Clone, Default)]
pub struct InMemoryBookStore {
    state: Arc<Mutex<State>>,
    unavailable: bool,
    fail_inserts: bool,
    fail_commits: bool,
}

impl InMemoryBookStore {
    /// Make every `begin` fail, as if the database were unreachable.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Make every insert fail.
    pub fn fail_inserts(mut self) -> Self {
        self.fail_inserts = true;
        self
    }

    /// Make every commit fail.
    pub fn fail_commits(mut self) -> Self {
        self.fail_commits = true;
        self
    }

    pub fn events(&self) -> Vec<StoreEvent> {
        self.lock().events.clone()
    }

    /// Committed books.
    pub fn books(&self) -> Vec<BookMessage> {
        self.lock().books.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BookStore for InMemoryBookStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        if self.unavailable {
            return Err(StoreError::backend("in-memory store is unavailable"));
        }
        self.lock().events.push(StoreEvent::Begin);
        Ok(InMemoryTransaction {
            store: self.clone(),
            pending: Vec::new(),
        })
    }
}

/// Transaction of an [`InMemoryBookStore`].
pub struct InMemoryTransaction {
    store: InMemoryBookStore,
    pending: Vec<BookMessage>,
}

#[async_trait]
impl BookTransaction for InMemoryTransaction {
    async fn insert_book(&mut self, book: &BookMessage) -> Result<(), StoreError> {
        if self.store.fail_inserts {
            return Err(StoreError::backend("in-memory insert failure"));
        }
        self.store
            .lock()
            .events
            .push(StoreEvent::Insert(book.clone()));
        self.pending.push(book.clone());
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        if self.store.fail_commits {
            return Err(StoreError::backend("in-memory commit failure"));
        }
        let mut state = self.store.lock();
        state.events.push(StoreEvent::Commit);
        state.books.extend(self.pending);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.store.lock().events.push(StoreEvent::Rollback);
        Ok(())
    }
}
