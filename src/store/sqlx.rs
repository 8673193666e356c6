use async_trait::async_trait;
use sqlx::{
    PgPool, Postgres, Transaction,
    postgres::{PgConnectOptions, PgPoolOptions},
};

use crate::{
    messages::BookMessage,
    store::{BookStore, BookTransaction, StoreError},
};

/// Postgres-backed book store.
///
/// The pool holds at most one connection and lets it go after a short idle
/// period, so each insert effectively acquires its own connection and gives
/// it back on every exit path.
#[derive(Clone)]
pub struct SqlxBookStore {
    pool: PgPool,
}

impl SqlxBookStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and ensure the `book` table exists.
    ///
    /// Fails when the database is unreachable.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(options: PgConnectOptions) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .min_connections(0)
            .idle_timeout(std::time::Duration::from_secs(30))
            .connect_with(options)
            .await?;
        create_table(&pool).await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl BookStore for SqlxBookStore {
    type Transaction = SqlxBookTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        Ok(SqlxBookTransaction(self.pool.begin().await?))
    }
}

/// Open transaction of a [`SqlxBookStore`]. Rolls back when dropped.
pub struct SqlxBookTransaction(Transaction<'static, Postgres>);

#[async_trait]
impl BookTransaction for SqlxBookTransaction {
    #[tracing::instrument(skip_all)]
    async fn insert_book(&mut self, book: &BookMessage) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO book (author_id, title, num_pages, category) VALUES ($1, $2, $3, $4)",
        )
        .bind(book.author_id)
        .bind(&book.title)
        .bind(book.num_pages)
        .bind(&book.category)
        .execute(&mut *self.0)
        .await?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.0.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.0.rollback().await?;
        Ok(())
    }
}

/// Ensures the book table exists.
async fn create_table(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS book (
            book_id BIGSERIAL PRIMARY KEY,
            author_id BIGINT NOT NULL,
            title TEXT NOT NULL,
            num_pages INT NOT NULL,
            category TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::backend(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PersistError, persist_book};

    fn book(title: &str) -> BookMessage {
        BookMessage {
            author_id: 1,
            title: title.into(),
            num_pages: 100,
            category: "ROMANCE".into(),
        }
    }

    async fn count(pool: &PgPool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM book")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[sqlx::test]
    #[ignore = "needs a Postgres instance in DATABASE_URL"]
    async fn persisted_book_is_committed(pool: PgPool) {
        let store = SqlxBookStore::try_new((*pool.connect_options()).clone())
            .await
            .unwrap();

        persist_book(&store, &book("T")).await.unwrap();

        let title: String = sqlx::query_scalar("SELECT title FROM book")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(title, "T");
    }

    #[sqlx::test]
    #[ignore = "needs a Postgres instance in DATABASE_URL"]
    async fn failed_insert_leaves_no_row(pool: PgPool) {
        let store = SqlxBookStore::try_new((*pool.connect_options()).clone())
            .await
            .unwrap();
        sqlx::query("ALTER TABLE book ADD CONSTRAINT short_title CHECK (length(title) < 5)")
            .execute(&pool)
            .await
            .unwrap();

        let err = persist_book(&store, &book("far too long"))
            .await
            .unwrap_err();

        assert!(matches!(err, PersistError::Insert(_)));
        assert_eq!(count(&pool).await, 0);
    }

    #[sqlx::test]
    #[ignore = "needs a Postgres instance in DATABASE_URL"]
    async fn dropped_transaction_rolls_back(pool: PgPool) {
        let store = SqlxBookStore::try_new((*pool.connect_options()).clone())
            .await
            .unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_book(&book("T")).await.unwrap();
        }

        assert_eq!(count(&pool).await, 0);
    }
}
