//! The `transport` module is the seam between the pub/sub layer and a broker.
//!
//! It defines the three capabilities the pipeline needs (connection,
//! channel, delivery) as traits. `amqp` implements them for RabbitMQ through
//! `lapin`; `memory` implements them for the in-process broker in
//! [`crate::broker`].

pub mod amqp;
pub mod memory;

use std::future::Future;

use futures::stream::BoxStream;

use crate::utils::error::TransportError;

/// Stream of raw deliveries produced by [`Channel::consume`].
pub type Deliveries<D> = BoxStream<'static, Result<D, TransportError>>;

/// How an exchange routes messages to its bound queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Exact routing-key match.
    Direct,
    /// Dotted routing keys matched against `*`/`#` patterns.
    Topic,
    /// Every bound queue, key ignored.
    Fanout,
}

/// Arguments of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub dead_letter_exchange: Option<String>,
}

/// A queue as reported back by the broker after declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    /// Declared name; server-generated when an empty name was requested.
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A broker connection able to open channels.
pub trait Connection: Send + Sync {
    type Channel: Channel;

    fn open_channel(&self) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send;
}

/// A channel on a broker connection.
pub trait Channel: Send + Sync + 'static {
    type Delivery: Delivery;

    fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> impl Future<Output = Result<DeclaredQueue, TransportError>> + Send;

    fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Publishes `body` without the mandatory or immediate flags. Resolves
    /// once the channel has accepted the message, not on a broker confirm.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        content_type: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Starts a consumer in manual acknowledgement mode.
    fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> impl Future<Output = Result<Deliveries<Self::Delivery>, TransportError>> + Send;
}

/// One message handed to a consumer.
///
/// `ack` and `nack` consume the delivery, so it can be disposed at most once.
pub trait Delivery: Send + 'static {
    fn payload(&self) -> &[u8];

    fn content_type(&self) -> Option<&str>;

    fn routing_key(&self) -> &str;

    fn redelivered(&self) -> bool;

    fn ack(self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn nack(self, requeue: bool) -> impl Future<Output = Result<(), TransportError>> + Send;
}
