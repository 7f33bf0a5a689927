use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use tracing::info;

use crate::transport::{
    Channel, Connection, DeclaredQueue, Deliveries, Delivery, ExchangeKind, QueueOptions,
};
use crate::utils::error::TransportError;

/// Queue argument naming the exchange rejected messages are republished to.
pub const DEAD_LETTER_ARGUMENT: &str = "x-dead-letter-exchange";

/// Opens a RabbitMQ connection with default properties.
pub async fn connect(uri: &str) -> Result<lapin::Connection, TransportError> {
    let conn = lapin::Connection::connect(uri, ConnectionProperties::default()).await?;
    info!("Connected to AMQP broker");
    Ok(conn)
}

/// Builds the argument table carried by every queue declaration.
pub fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(dlx) = &options.dead_letter_exchange {
        args.insert(
            ShortString::from(DEAD_LETTER_ARGUMENT),
            AMQPValue::LongString(LongString::from(dlx.as_str())),
        );
    }
    args
}

impl Connection for lapin::Connection {
    type Channel = lapin::Channel;

    async fn open_channel(&self) -> Result<lapin::Channel, TransportError> {
        Ok(self.create_channel().await?)
    }
}

impl Channel for lapin::Channel {
    type Delivery = lapin::message::Delivery;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        let options = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        self.exchange_declare(name, kind, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<DeclaredQueue, TransportError> {
        let declare = QueueDeclareOptions {
            passive: false,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            nowait: false,
        };
        let queue = self
            .queue_declare(name, declare, queue_arguments(options))
            .await?;
        Ok(DeclaredQueue {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<(), TransportError> {
        let options = BasicPublishOptions {
            mandatory: false,
            immediate: false,
        };
        let properties = BasicProperties::default().with_content_type(content_type.into());
        // Channel acceptance only; the publisher confirm is not awaited.
        let _confirm = self
            .basic_publish(exchange, routing_key, options, body, properties)
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Deliveries<lapin::message::Delivery>, TransportError> {
        let options = BasicConsumeOptions {
            no_ack: false,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await?;
        Ok(consumer.map(|item| item.map_err(consumer_error)).boxed())
    }
}

/// Consumer stream errors, with closed channel or connection states
/// reported as such so the delivery loop can stop.
fn consumer_error(error: lapin::Error) -> TransportError {
    match error {
        lapin::Error::InvalidChannelState(_) => TransportError::ChannelClosed,
        lapin::Error::InvalidConnectionState(_) => TransportError::ConnectionClosed,
        other => TransportError::Amqp(other),
    }
}

impl Delivery for lapin::message::Delivery {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    fn content_type(&self) -> Option<&str> {
        self.properties
            .content_type()
            .as_ref()
            .map(ShortString::as_str)
    }

    fn routing_key(&self) -> &str {
        self.routing_key.as_str()
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn ack(self) -> Result<(), TransportError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn nack(self, requeue: bool) -> Result<(), TransportError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}
