//! Relational store for consumed books.
//!
//! The consumer persists each [`BookMessage`] in its own transaction. The
//! store is split into two traits so the commit/rollback decision stays
//! with the caller:
//!
//! - [`BookStore`]: opens a transaction
//! - [`BookTransaction`]: inserts a row, then commits or rolls back
//!
//! [`persist_book`] implements the insert-commit-or-rollback sequence on top
//! of them.

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use tracing_error::SpanTrace;

use crate::messages::BookMessage;

/// Trait implemented by store backends.
#[async_trait::async_trait]
pub trait BookStore: Send + Sync {
    /// Transaction type produced by [`BookStore::begin`].
    type Transaction: BookTransaction;

    /// Acquire a connection and begin a transaction on it.
    async fn begin(&self) -> Result<Self::Transaction, StoreError>;
}

/// A single open transaction.
///
/// Dropping a transaction without committing must roll it back.
#[async_trait::async_trait]
pub trait BookTransaction: Send {
    /// Insert one book row.
    async fn insert_book(&mut self, book: &BookMessage) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Where a [`persist_book`] call failed.
#[derive(Debug)]
pub enum PersistError {
    /// The transaction could not be opened.
    Begin(StoreError),
    /// The insert failed and the transaction was rolled back.
    Insert(StoreError),
    /// The insert succeeded but the commit failed.
    Commit(StoreError),
}

impl PersistError {
    pub fn into_inner(self) -> StoreError {
        match self {
            PersistError::Begin(err) | PersistError::Insert(err) | PersistError::Commit(err) => {
                err
            }
        }
    }
}

/// Insert `book` in a fresh transaction.
///
/// Commits on success. On insert failure the transaction is rolled back and
/// the insert error is returned; a rollback failure is only logged.
#[tracing::instrument(skip_all, fields(author_id = book.author_id))]
pub async fn persist_book<S>(store: &S, book: &BookMessage) -> Result<(), PersistError>
where
    S: BookStore,
{
    let mut tx = store.begin().await.map_err(PersistError::Begin)?;

    if let Err(err) = tx.insert_book(book).await {
        if let Err(error) = tx.rollback().await {
            tracing::error!(%error, "Rollback failed after insert error");
        }
        return Err(PersistError::Insert(err));
    }

    tx.commit().await.map_err(PersistError::Commit)?;
    tracing::info!(title = %book.title, "Book inserted");
    Ok(())
}

/// Error returned by store operations.
#[derive(Debug)]
pub struct StoreError {
    context: SpanTrace,
    source: tower::BoxError,
}

impl StoreError {
    /// Create a backend-related store error.
    pub fn backend(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err.into(),
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Store error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
