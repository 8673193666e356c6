use std::{error::Error, str::FromStr, sync::Arc};

use queuebridge::{
    Bridge, Consumer, Publisher, StrategyRouter, Transport,
    config::Settings,
    source::{SourcePoller, sqlx::SqlxSourceQueue},
    store::sqlx::SqlxBookStore,
    strategy::{AuthorStrategy, ClientStrategy, Unconfigured},
    transport::{
        RawPayload,
        layers::JsonLayer,
        rabbitmq::{RabbitMq, RabbitMqSubscriber},
    },
};
use sqlx::postgres::PgConnectOptions;
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const CONSUMER_TAG: &str = "queuebridge-book-consumer";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // A missing .env file is fine; the process environment is used as is.
    dotenv::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let settings = Settings::from_env()?;
    tracing::info!(broker = ?settings.broker, source = %settings.source.queue_name, "Starting");
    let database = PgConnectOptions::from_str(&settings.database_url)?;

    // One broker connection per publisher, each owned by its strategy.
    let book_sender: RabbitMq<RawPayload> = RabbitMq::connect(&settings.broker).await?;
    let favorite_sender: RabbitMq<RawPayload> = RabbitMq::connect(&settings.broker).await?;
    let router = StrategyRouter::new(
        AuthorStrategy::new(
            Publisher::new(Transport::new(book_sender.clone()).layer(JsonLayer)),
            &settings.queues.book,
        ),
        ClientStrategy::new(
            Publisher::new(Transport::new(favorite_sender.clone()).layer(JsonLayer)),
            &settings.queues.favorite_author,
            Arc::new(Unconfigured),
        ),
    );

    let source = SqlxSourceQueue::try_new(database.clone()).await?;
    let poller = SourcePoller::new(source, &settings.source.queue_name)
        .with_wait(settings.source.wait)
        .with_no_message_codes(settings.source.no_message_codes.iter().copied());

    let store = SqlxBookStore::try_new(database).await?;
    let subscriber = RabbitMqSubscriber::connect(&settings.broker, CONSUMER_TAG).await?;
    let consumer = Consumer::new(store, &settings.queues.book);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => cancel.cancel(),
                Err(error) => tracing::error!(%error, "Failed to install Ctrl+C handler"),
            }
        }
    });

    let bridge_handle = tokio::spawn(Bridge::new(poller, router).run(cancel.clone()));
    let consumer_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let result = consumer.run(subscriber, cancel.clone()).await;
            if result.is_err() {
                cancel.cancel();
            }
            result
        }
    });

    let (bridge_result, consumer_result) = tokio::join!(bridge_handle, consumer_handle);

    for sender in [book_sender, favorite_sender] {
        if let Err(error) = sender.close().await {
            tracing::warn!(%error, "Failed to close publisher connection");
        }
    }

    bridge_result?;
    consumer_result??;
    Ok(())
}
