//! Tag-to-strategy routing.

use tracing_error::SpanTrace;

use crate::{
    Envelope,
    envelope::TableTag,
    strategy::{AuthorStrategy, ClientStrategy, MessageStrategy, StrategyError},
};

/// Owns one strategy per [`TableTag`] and dispatches payloads to them.
///
/// The set of strategies is fixed at construction; a tag without a strategy
/// is reported as [`RouteErrorKind::UnsupportedTag`] and nothing is published.
pub struct StrategyRouter<A = AuthorStrategy, C = ClientStrategy> {
    author: A,
    client: C,
}

impl<A, C> StrategyRouter<A, C>
where
    A: MessageStrategy,
    C: MessageStrategy,
{
    pub fn new(author: A, client: C) -> Self {
        Self { author, client }
    }

    /// Route an envelope by its table tag.
    pub async fn route(&mut self, envelope: &Envelope) -> Result<(), RouteError> {
        self.dispatch(envelope.table, &envelope.data).await
    }

    /// Hand `payload` to the strategy registered for `tag`.
    #[tracing::instrument(skip(self, payload))]
    pub async fn dispatch(&mut self, tag: i32, payload: &str) -> Result<(), RouteError> {
        let strategy: &mut dyn MessageStrategy = match TableTag::try_from(tag) {
            Ok(TableTag::Author) => &mut self.author,
            Ok(TableTag::Client) => &mut self.client,
            Err(tag) => {
                tracing::warn!(tag, "No strategy registered for table tag");
                return Err(RouteError::unsupported(tag));
            }
        };

        strategy.process(payload).await.map_err(RouteError::strategy)
    }
}

/// Error returned by [`StrategyRouter::dispatch`].
#[derive(Debug)]
pub struct RouteError {
    context: SpanTrace,
    kind: RouteErrorKind,
}

#[derive(Debug)]
pub enum RouteErrorKind {
    /// No strategy exists for the tag.
    UnsupportedTag(i32),
    /// The selected strategy failed.
    Strategy(StrategyError),
}

impl RouteError {
    fn unsupported(tag: i32) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RouteErrorKind::UnsupportedTag(tag),
        }
    }

    fn strategy(err: StrategyError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RouteErrorKind::Strategy(err),
        }
    }

    pub fn kind(&self) -> &RouteErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RouteErrorKind::UnsupportedTag(tag) => writeln!(f, "Unsupported table tag: {tag}"),
            RouteErrorKind::Strategy(err) => writeln!(f, "Strategy error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RouteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RouteErrorKind::UnsupportedTag(_) => None,
            RouteErrorKind::Strategy(err) => Some(err),
        }
    }
}
