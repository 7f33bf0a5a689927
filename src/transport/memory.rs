use futures::StreamExt;

use crate::broker::engine::{ChannelId, ConnectionId, DeliveryTag, Outbound};
use crate::broker::{MemoryBroker, Message};
use crate::transport::{
    Channel, Connection, DeclaredQueue, Deliveries, Delivery, ExchangeKind, QueueOptions,
};
use crate::utils::error::TransportError;

/// A connection to a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    id: ConnectionId,
    broker: MemoryBroker,
}

impl MemoryConnection {
    pub(crate) fn new(id: ConnectionId, broker: MemoryBroker) -> Self {
        Self { id, broker }
    }

    /// Closes the connection, its channels and the exclusive queues it owns.
    pub fn close(&self) {
        self.broker.state().close_connection(self.id);
    }
}

impl Connection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel, TransportError> {
        let id = self.broker.state().open_channel(self.id)?;
        Ok(MemoryChannel {
            id,
            broker: self.broker.clone(),
        })
    }
}

/// A channel on a [`MemoryConnection`].
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    id: ChannelId,
    broker: MemoryBroker,
}

impl MemoryChannel {
    /// Closes the channel. Consumers on it stop and unacked messages are requeued.
    pub fn close(&self) {
        self.broker.state().close_channel(self.id);
    }
}

impl Channel for MemoryChannel {
    type Delivery = MemoryDelivery;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError> {
        self.broker.state().declare_exchange(self.id, name, kind)
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<DeclaredQueue, TransportError> {
        self.broker.state().declare_queue(self.id, name, options)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.broker
            .state()
            .bind_queue(self.id, queue, exchange, routing_key)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<(), TransportError> {
        let message = Message::new(exchange, routing_key, body, content_type);
        self.broker.state().publish(self.id, message)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Deliveries<MemoryDelivery>, TransportError> {
        let receiver = self.broker.state().consume(self.id, queue, consumer_tag)?;
        let channel = self.id;
        let broker = self.broker.clone();
        Ok(receiver
            .map(move |Outbound { tag, message }| {
                Ok::<_, TransportError>(MemoryDelivery {
                    tag,
                    channel,
                    message,
                    broker: broker.clone(),
                })
            })
            .boxed())
    }
}

/// A message delivered by the in-memory broker.
#[derive(Debug)]
pub struct MemoryDelivery {
    tag: DeliveryTag,
    channel: ChannelId,
    message: Message,
    broker: MemoryBroker,
}

impl MemoryDelivery {
    pub fn delivery_tag(&self) -> DeliveryTag {
        self.tag
    }
}

impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.body
    }

    fn content_type(&self) -> Option<&str> {
        self.message.content_type.as_deref()
    }

    fn routing_key(&self) -> &str {
        &self.message.routing_key
    }

    fn redelivered(&self) -> bool {
        self.message.redelivered
    }

    async fn ack(self) -> Result<(), TransportError> {
        self.broker.state().ack(self.channel, self.tag)
    }

    async fn nack(self, requeue: bool) -> Result<(), TransportError> {
        self.broker.state().nack(self.channel, self.tag, requeue)
    }
}
