//! Per-table message strategies.
//!
//! A strategy turns the raw payload of one envelope kind into one outbound
//! message and publishes it. There is one strategy per [`TableTag`], each
//! owning its own [`Publisher`].
//!
//! [`TableTag`]: crate::envelope::TableTag

use std::sync::Arc;

use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use tracing_error::SpanTrace;

use crate::{
    codec,
    messages::{AuthorMessage, BookMessage, Category, FavoriteAuthorMessage},
    publisher::Publisher,
    transport::TransportError,
};

/// Smallest generated page count.
pub const MIN_PAGES: i32 = 50;
/// Largest generated page count.
pub const MAX_PAGES: i32 = 200;

/// Transform-and-publish logic for one envelope kind.
#[async_trait::async_trait]
pub trait MessageStrategy: Send {
    /// Decode `payload`, transform it and publish the result.
    async fn process(&mut self, payload: &str) -> Result<(), StrategyError>;
}

/// Synthesizes books for new authors.
///
/// Page count and category are random; the generator owns its own seedable
/// RNG so separate strategies never share one.
pub struct BookGenerator {
    rng: StdRng,
}

impl BookGenerator {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic generator, for tests and reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn book_for(&mut self, author: &AuthorMessage) -> BookMessage {
        let category = Category::ALL
            .choose(&mut self.rng)
            .copied()
            .unwrap_or(Category::Romance);
        BookMessage {
            author_id: author.id,
            title: format!("Book registered for author {}", author.name),
            num_pages: self.rng.gen_range(MIN_PAGES..=MAX_PAGES),
            category: category.as_str().to_owned(),
        }
    }
}

impl Default for BookGenerator {
    fn default() -> Self {
        Self::from_entropy()
    }
}

/// Handles author envelopes: publishes a generated book for each new author.
pub struct AuthorStrategy {
    publisher: Publisher<BookMessage>,
    queue: String,
    generator: BookGenerator,
}

impl AuthorStrategy {
    pub fn new(publisher: Publisher<BookMessage>, queue: impl Into<String>) -> Self {
        Self {
            publisher,
            queue: queue.into(),
            generator: BookGenerator::from_entropy(),
        }
    }

    pub fn with_generator(mut self, generator: BookGenerator) -> Self {
        self.generator = generator;
        self
    }
}

#[async_trait::async_trait]
impl MessageStrategy for AuthorStrategy {
    #[tracing::instrument(skip_all, fields(strategy = "author"))]
    async fn process(&mut self, payload: &str) -> Result<(), StrategyError> {
        let author: AuthorMessage =
            codec::from_str(payload).map_err(StrategyError::deserialization)?;
        tracing::info!(author_id = author.id, name = %author.name, "Author received");

        let book = self.generator.book_for(&author);
        let title = book.title.clone();
        self.publisher
            .publish(&self.queue, book)
            .await
            .map_err(StrategyError::publish)?;

        tracing::info!(author_id = author.id, %title, "Book published");
        Ok(())
    }
}

/// Maps a favorite-author relation to the author it points at.
///
/// How a relation becomes an [`AuthorMessage`] is deployment-specific (it
/// usually means looking the author up somewhere), so it is supplied when the
/// router is built.
#[async_trait::async_trait]
pub trait FavoriteAuthorResolver: Send + Sync {
    async fn resolve(
        &self,
        favorite: &FavoriteAuthorMessage,
    ) -> Result<AuthorMessage, tower::BoxError>;
}

/// Resolver used when none is configured; every resolution fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

#[async_trait::async_trait]
impl FavoriteAuthorResolver for Unconfigured {
    async fn resolve(
        &self,
        favorite: &FavoriteAuthorMessage,
    ) -> Result<AuthorMessage, tower::BoxError> {
        Err(format!(
            "no favorite author resolver configured (client {}, author {})",
            favorite.client_id, favorite.favorite_author_id
        )
        .into())
    }
}

/// Handles client envelopes: publishes the client's favorite author.
pub struct ClientStrategy {
    publisher: Publisher<AuthorMessage>,
    queue: String,
    resolver: Arc<dyn FavoriteAuthorResolver>,
}

impl ClientStrategy {
    pub fn new(
        publisher: Publisher<AuthorMessage>,
        queue: impl Into<String>,
        resolver: Arc<dyn FavoriteAuthorResolver>,
    ) -> Self {
        Self {
            publisher,
            queue: queue.into(),
            resolver,
        }
    }
}

#[async_trait::async_trait]
impl MessageStrategy for ClientStrategy {
    #[tracing::instrument(skip_all, fields(strategy = "client"))]
    async fn process(&mut self, payload: &str) -> Result<(), StrategyError> {
        let favorite: FavoriteAuthorMessage =
            codec::from_str(payload).map_err(StrategyError::deserialization)?;

        let author = self
            .resolver
            .resolve(&favorite)
            .await
            .map_err(StrategyError::resolve)?;
        self.publisher
            .publish(&self.queue, author)
            .await
            .map_err(StrategyError::publish)
    }
}

/// Error returned by a strategy.
#[derive(Debug)]
pub struct StrategyError {
    context: SpanTrace,
    kind: StrategyErrorKind,
}

/// Kinds of strategy errors.
#[derive(Debug)]
pub enum StrategyErrorKind {
    /// The payload does not match the expected message shape.
    Deserialization(serde_json::Error),
    /// The favorite-author resolver failed.
    Resolve(tower::BoxError),
    /// Publishing the outbound message failed.
    Publish(TransportError),
}

impl StrategyError {
    fn deserialization(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StrategyErrorKind::Deserialization(err),
        }
    }

    fn resolve(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StrategyErrorKind::Resolve(err),
        }
    }

    fn publish(err: TransportError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StrategyErrorKind::Publish(err),
        }
    }

    pub fn kind(&self) -> &StrategyErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for StrategyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            StrategyErrorKind::Deserialization(err) => {
                writeln!(f, "Payload deserialization error: {err}")
            }
            StrategyErrorKind::Resolve(err) => {
                writeln!(f, "Favorite author resolution error: {err}")
            }
            StrategyErrorKind::Publish(err) => writeln!(f, "Publish error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for StrategyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            StrategyErrorKind::Deserialization(err) => Some(err),
            StrategyErrorKind::Resolve(err) => Some(err.as_ref()),
            StrategyErrorKind::Publish(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InMemory, RawPayload, Transport, layers::JsonLayer};

    fn author(id: i64) -> AuthorMessage {
        AuthorMessage {
            id,
            name: "Ana".into(),
            email: "ana@example.com".into(),
        }
    }

    fn sink<M: serde::Serialize + Send + 'static>() -> (InMemory<RawPayload>, Publisher<M>) {
        let sender = InMemory::default();
        let publisher = Publisher::new(Transport::new(sender.clone()).layer(JsonLayer));
        (sender, publisher)
    }

    #[test]
    fn generated_books_stay_in_bounds() {
        let categories: Vec<_> = Category::ALL.iter().map(Category::as_str).collect();
        let mut generator = BookGenerator::from_entropy();

        for id in 0..2_000 {
            let book = generator.book_for(&author(id));
            assert!((MIN_PAGES..=MAX_PAGES).contains(&book.num_pages));
            assert!(categories.contains(&book.category.as_str()));
            assert_eq!(book.author_id, id);
            assert_eq!(book.title, "Book registered for author Ana");
        }
    }

    #[test]
    fn seeded_generators_agree() {
        let mut a = BookGenerator::seeded(42);
        let mut b = BookGenerator::seeded(42);
        for id in 0..20 {
            assert_eq!(a.book_for(&author(id)), b.book_for(&author(id)));
        }
    }

    #[test]
    fn every_category_and_page_bound_is_reachable() {
        let mut generator = BookGenerator::seeded(7);
        let books: Vec<_> = (0..5_000).map(|id| generator.book_for(&author(id))).collect();

        for category in Category::ALL {
            assert!(books.iter().any(|b| b.category == category.as_str()));
        }
        assert!(books.iter().any(|b| b.num_pages == MIN_PAGES));
        assert!(books.iter().any(|b| b.num_pages == MAX_PAGES));
    }

    #[tokio::test]
    async fn author_strategy_publishes_a_book() {
        let (sender, publisher) = sink();
        let mut strategy =
            AuthorStrategy::new(publisher, "books").with_generator(BookGenerator::seeded(1));

        strategy
            .process(r#"{"Id":5,"Name":"Ana","Email":"ana@example.com"}"#)
            .await
            .unwrap();

        let sent = sender.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].queue, "books");
        let book: BookMessage = codec::from_slice(&sent[0].message.0).unwrap();
        assert_eq!(book.author_id, 5);
    }

    #[tokio::test]
    async fn author_strategy_rejects_malformed_payloads() {
        let (sender, publisher) = sink();
        let mut strategy = AuthorStrategy::new(publisher, "books");

        for payload in ["{not json", "null", r#"{"id":"x"}"#] {
            let err = strategy.process(payload).await.unwrap_err();
            assert!(matches!(
                err.kind(),
                StrategyErrorKind::Deserialization(_)
            ));
        }
        assert!(sender.sent_messages().await.is_empty());
    }

    struct Fixed;

    #[async_trait::async_trait]
    impl FavoriteAuthorResolver for Fixed {
        async fn resolve(
            &self,
            favorite: &FavoriteAuthorMessage,
        ) -> Result<AuthorMessage, tower::BoxError> {
            Ok(author(favorite.favorite_author_id))
        }
    }

    #[tokio::test]
    async fn client_strategy_publishes_the_resolved_author() {
        let (sender, publisher) = sink();
        let mut strategy = ClientStrategy::new(publisher, "favorites", Arc::new(Fixed));

        strategy
            .process(r#"{"clientId":3,"favoriteAuthorId":11}"#)
            .await
            .unwrap();

        let sent = sender.sent_messages().await;
        assert_eq!(sent[0].queue, "favorites");
        let published: AuthorMessage = codec::from_slice(&sent[0].message.0).unwrap();
        assert_eq!(published, author(11));
    }

    #[tokio::test]
    async fn unconfigured_resolver_fails_without_publishing() {
        let (sender, publisher) = sink();
        let mut strategy = ClientStrategy::new(publisher, "favorites", Arc::new(Unconfigured));

        let err = strategy
            .process(r#"{"clientId":3,"favoriteAuthorId":11}"#)
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), StrategyErrorKind::Resolve(_)));
        assert!(sender.sent_messages().await.is_empty());
    }
}
