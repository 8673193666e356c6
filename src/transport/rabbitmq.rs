use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use tokio::sync::Mutex;
use tokio_stream::StreamExt as _;

use crate::{
    config::BrokerSettings,
    transport::{
        Acknowledge, Delivery, DeliveryStream, Outgoing, QueueOptions, Sender, Subscriber,
        ToBytes, TransportError,
    },
};

const REPLY_SUCCESS: u16 = 200;

/// RabbitMQ transport sender.
///
/// Publishes to the default exchange over a single long-lived
/// `lapin::Channel`, with the target queue name as routing key.
///
/// ## Design
///
/// - The connection and channel are opened once, by [`RabbitMq::connect`],
///   and reused for every message
/// - The target queue is declared before every publish; the declaration is
///   idempotent on the broker
/// - The message payload is sent as-is through `ToBytes`, with default
///   properties and no mandatory flag
///
/// The channel sits behind an `Arc<Mutex<_>>`, so clones made by the tower
/// stack still publish one message at a time.
pub struct RabbitMq<M> {
    connection: Arc<Connection>,
    channel: Arc<Mutex<Channel>>,
    queue_options: QueueOptions,
    msg: std::marker::PhantomData<M>,
}

impl<M> Clone for RabbitMq<M> {
    fn clone(&self) -> Self {
        Self {
            connection: Arc::clone(&self.connection),
            channel: Arc::clone(&self.channel),
            queue_options: self.queue_options,
            msg: std::marker::PhantomData,
        }
    }
}

impl<M> RabbitMq<M> {
    /// Open the connection and channel.
    ///
    /// Fails with [`ChannelUnavailable`] when the broker cannot be reached;
    /// there is no retry.
    ///
    /// [`ChannelUnavailable`]: crate::TransportErrorKind::ChannelUnavailable
    #[tracing::instrument(skip_all, fields(host = %settings.host))]
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, TransportError> {
        let (connection, channel) = open_channel(settings).await?;
        Ok(Self {
            connection: Arc::new(connection),
            channel: Arc::new(Mutex::new(channel)),
            queue_options: QueueOptions::default(),
            msg: std::marker::PhantomData,
        })
    }

    /// Close the channel, then the connection.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.channel
            .lock()
            .await
            .close(REPLY_SUCCESS, "publisher closing")
            .await
            .map_err(TransportError::sender)?;
        self.connection
            .close(REPLY_SUCCESS, "publisher closing")
            .await
            .map_err(TransportError::sender)
    }
}

#[async_trait]
impl<M> Sender<M> for RabbitMq<M>
where
    M: ToBytes + Send + Sync,
{
    type Error = lapin::Error;

    /// Declare the target queue and publish the message to it.
    ///
    /// Waits for the publish to be written and for the broker confirmation
    /// when publisher confirms are enabled on the channel.
    async fn send(&mut self, outgoing: Outgoing<M>) -> Result<(), Self::Error> {
        let channel = self.channel.lock().await;
        declare(&channel, &outgoing.queue, self.queue_options).await?;
        channel
            .basic_publish(
                "",
                &outgoing.queue,
                BasicPublishOptions::default(),
                outgoing.message.to_bytes(),
                BasicProperties::default(),
            )
            .await?
            .await?;

        Ok(())
    }
}

/// RabbitMQ subscriber.
///
/// Owns its own connection and channel, separate from any publisher.
pub struct RabbitMqSubscriber {
    connection: Connection,
    channel: Channel,
    consumer_tag: String,
    subscribed: bool,
}

impl RabbitMqSubscriber {
    /// Open the connection and channel used for consuming.
    #[tracing::instrument(skip_all, fields(host = %settings.host))]
    pub async fn connect(
        settings: &BrokerSettings,
        consumer_tag: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let (connection, channel) = open_channel(settings).await?;
        Ok(Self {
            connection,
            channel,
            consumer_tag: consumer_tag.into(),
            subscribed: false,
        })
    }
}

#[async_trait]
impl Subscriber for RabbitMqSubscriber {
    type Acker = Acker;
    type Error = lapin::Error;

    /// Declare the queue, apply the prefetch bound and start consuming with
    /// manual acknowledgements.
    #[tracing::instrument(skip(self))]
    async fn subscribe(
        &mut self,
        queue: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream<Self::Acker, Self::Error>, Self::Error> {
        declare(&self.channel, queue, QueueOptions::default()).await?;
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        self.subscribed = true;

        let deliveries = consumer.map(|delivery| {
            delivery.map(|d| Delivery {
                delivery_tag: d.delivery_tag,
                redelivered: d.redelivered,
                body: d.data,
                acker: d.acker,
            })
        });
        Ok(Box::pin(deliveries))
    }

    async fn close(self) -> Result<(), Self::Error> {
        if self.subscribed {
            self.channel
                .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                .await?;
        }
        self.channel
            .close(REPLY_SUCCESS, "consumer closing")
            .await?;
        self.connection
            .close(REPLY_SUCCESS, "consumer closing")
            .await
    }
}

#[async_trait]
impl Acknowledge for Acker {
    type Error = lapin::Error;

    async fn ack(&self) -> Result<(), Self::Error> {
        Acker::ack(self, BasicAckOptions::default()).await
    }

    async fn reject(&self, requeue: bool) -> Result<(), Self::Error> {
        self.nack(BasicNackOptions {
            multiple: false,
            requeue,
        })
        .await
    }
}

async fn open_channel(settings: &BrokerSettings) -> Result<(Connection, Channel), TransportError> {
    let connection = Connection::connect(&settings.amqp_uri(), ConnectionProperties::default())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to RabbitMQ");
            TransportError::channel_unavailable(e)
        })?;
    let channel = connection.create_channel().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to open RabbitMQ channel");
        TransportError::channel_unavailable(e)
    })?;
    Ok((connection, channel))
}

async fn declare(
    channel: &Channel,
    queue: &str,
    options: QueueOptions,
) -> Result<(), lapin::Error> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: options.durable,
                exclusive: options.exclusive,
                auto_delete: options.auto_delete,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}
