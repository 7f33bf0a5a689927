//! Broker engine
//!
//! This module contains the in-memory broker state responsible for:
//! - managing exchanges, queues and the bindings between them
//! - routing published messages by direct, topic or fanout rules
//! - handing messages to consumers and tracking them until acked or nacked
//! - requeueing and dead-lettering rejected messages
//!
//! Concurrency and usage notes:
//! - The API here is synchronous and designed to be held behind a lock
//!   (`Arc<Mutex<Broker>>`) by [`MemoryBroker`]. Transports take the lock for
//!   one operation at a time and never hold it across an await point.
//! - Consumers receive messages over unbounded channels, so dispatch never
//!   blocks while the lock is held.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::message::Message;
use crate::broker::topic::Exchange;
use crate::transport::memory::MemoryConnection;
use crate::transport::{DeclaredQueue, ExchangeKind, QueueOptions};
use crate::utils::error::TransportError;

pub type ConnectionId = u64;
pub type ChannelId = u64;
pub type DeliveryTag = u64;

/// A message handed to a consumer, tagged for later disposal.
#[derive(Debug)]
pub struct Outbound {
    pub tag: DeliveryTag,
    pub message: Message,
}

#[derive(Debug)]
struct Consumer {
    tag: String,
    channel: ChannelId,
    sender: UnboundedSender<Outbound>,
}

#[derive(Debug)]
struct Queue {
    options: QueueOptions,
    owner: ConnectionId,
    ready: VecDeque<Message>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    channel: ChannelId,
    message: Message,
}

/// In-memory broker state.
#[derive(Debug, Default)]
pub struct Broker {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    unacked: HashMap<DeliveryTag, Unacked>,
    connections: HashSet<ConnectionId>,
    channels: HashMap<ChannelId, ConnectionId>,
    next_id: u64,
    next_tag: DeliveryTag,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn open_connection(&mut self) -> ConnectionId {
        let id = self.next_id();
        self.connections.insert(id);
        id
    }

    /// Closes a connection with all its channels, then deletes the exclusive
    /// queues it declared. Auto-delete queues go with their last consumer,
    /// see [`Broker::close_channel`].
    pub fn close_connection(&mut self, conn: ConnectionId) {
        if !self.connections.remove(&conn) {
            return;
        }

        let channels: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, owner)| **owner == conn)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        let doomed: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == conn && q.options.exclusive)
            .map(|(name, _)| name.clone())
            .collect();
        for name in doomed {
            self.delete_queue(&name);
        }

        debug!(connection = conn, "Closed connection");
    }

    pub fn open_channel(&mut self, conn: ConnectionId) -> Result<ChannelId, TransportError> {
        if !self.connections.contains(&conn) {
            return Err(TransportError::ConnectionClosed);
        }
        let id = self.next_id();
        self.channels.insert(id, conn);
        Ok(id)
    }

    /// Closes a channel: its consumer streams end and its unacked messages
    /// go back to the head of their queues. An auto-delete queue that loses
    /// its last consumer here is deleted, whichever connection declared it.
    pub fn close_channel(&mut self, channel: ChannelId) {
        if self.channels.remove(&channel).is_none() {
            return;
        }

        let mut abandoned = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != channel);
            if queue.options.auto_delete && before > 0 && queue.consumers.is_empty() {
                abandoned.push(name.clone());
            }
        }

        let mut tags: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        // Newest first, so push_front leaves the oldest at the head.
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let mut touched = Vec::new();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                    touched.push(unacked.queue);
                }
            }
        }
        for name in abandoned {
            self.delete_queue(&name);
        }
        for name in touched {
            self.dispatch(&name);
        }
    }

    fn connection_of(&self, channel: ChannelId) -> Result<ConnectionId, TransportError> {
        self.channels
            .get(&channel)
            .copied()
            .ok_or(TransportError::ChannelClosed)
    }

    fn check_owner(queue: &Queue, name: &str, conn: ConnectionId) -> Result<(), TransportError> {
        if queue.options.exclusive && queue.owner != conn {
            return Err(TransportError::ResourceLocked(format!(
                "queue '{name}' is exclusive to another connection"
            )));
        }
        Ok(())
    }

    pub fn declare_exchange(
        &mut self,
        channel: ChannelId,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), TransportError> {
        self.connection_of(channel)?;
        match self.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(TransportError::PreconditionFailed(
                format!("exchange '{name}' already declared as {:?}", existing.kind),
            )),
            Some(_) => Ok(()),
            None => {
                self.exchanges
                    .insert(name.to_string(), Exchange::new(name, kind));
                Ok(())
            }
        }
    }

    /// Declares a queue. Re-declaring with identical options is a no-op.
    pub fn declare_queue(
        &mut self,
        channel: ChannelId,
        name: &str,
        options: &QueueOptions,
    ) -> Result<DeclaredQueue, TransportError> {
        let conn = self.connection_of(channel)?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };

        if let Some(queue) = self.queues.get(&name) {
            Self::check_owner(queue, &name, conn)?;
            if &queue.options != options {
                return Err(TransportError::PreconditionFailed(format!(
                    "queue '{name}' already declared with different arguments"
                )));
            }
            return Ok(DeclaredQueue {
                message_count: queue.ready.len() as u32,
                consumer_count: queue.consumers.len() as u32,
                name,
            });
        }

        self.queues.insert(
            name.clone(),
            Queue {
                options: options.clone(),
                owner: conn,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        debug!(queue = %name, "Declared queue");
        Ok(DeclaredQueue {
            name,
            message_count: 0,
            consumer_count: 0,
        })
    }

    pub fn bind_queue(
        &mut self,
        channel: ChannelId,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let conn = self.connection_of(channel)?;
        let target = self.queues.get(queue).ok_or_else(|| not_found("queue", queue))?;
        Self::check_owner(target, queue, conn)?;
        let exchange = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| not_found("exchange", exchange))?;
        exchange.bind(queue, routing_key);
        Ok(())
    }

    /// Routes a message through `exchange`. The empty name is the default
    /// exchange, which routes straight to the queue named by the key.
    pub fn publish(&mut self, channel: ChannelId, message: Message) -> Result<(), TransportError> {
        self.connection_of(channel)?;
        if !message.exchange.is_empty() && !self.exchanges.contains_key(&message.exchange) {
            return Err(not_found("exchange", &message.exchange));
        }
        self.route(message);
        Ok(())
    }

    fn route(&mut self, message: Message) {
        let targets = if message.exchange.is_empty() {
            if self.queues.contains_key(&message.routing_key) {
                vec![message.routing_key.clone()]
            } else {
                Vec::new()
            }
        } else {
            self.exchanges
                .get(&message.exchange)
                .map(|e| e.route(&message.routing_key))
                .unwrap_or_default()
        };

        if targets.is_empty() {
            debug!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "Dropped unroutable message"
            );
            return;
        }

        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(message.clone());
            }
            self.dispatch(&name);
        }
    }

    pub fn consume(
        &mut self,
        channel: ChannelId,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<UnboundedReceiver<Outbound>, TransportError> {
        let conn = self.connection_of(channel)?;
        let target = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| not_found("queue", queue))?;
        Self::check_owner(target, queue, conn)?;

        let (sender, receiver) = unbounded();
        target.consumers.push(Consumer {
            tag: consumer_tag.to_string(),
            channel,
            sender,
        });
        debug!(queue, consumer_tag, "Registered consumer");
        self.dispatch(queue);
        Ok(receiver)
    }

    /// Hands ready messages to the queue's consumers, round-robin.
    fn dispatch(&mut self, name: &str) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let index = queue.next_consumer % queue.consumers.len();
            let consumer = &queue.consumers[index];

            self.next_tag += 1;
            let tag = self.next_tag;
            let channel = consumer.channel;

            match consumer.sender.unbounded_send(Outbound {
                tag,
                message: message.clone(),
            }) {
                Ok(()) => {
                    self.unacked.insert(
                        tag,
                        Unacked {
                            queue: name.to_string(),
                            channel,
                            message,
                        },
                    );
                    queue.next_consumer = index + 1;
                }
                Err(_) => {
                    warn!(queue = name, consumer_tag = %consumer.tag, "Consumer went away, removing it");
                    queue.ready.push_front(message);
                    queue.consumers.remove(index);
                }
            }
        }
    }

    fn take_unacked(
        &mut self,
        channel: ChannelId,
        tag: DeliveryTag,
    ) -> Result<Unacked, TransportError> {
        self.connection_of(channel)?;
        match self.unacked.get(&tag) {
            Some(unacked) if unacked.channel == channel => {}
            _ => {
                return Err(TransportError::PreconditionFailed(format!(
                    "unknown delivery tag {tag}"
                )));
            }
        }
        self.unacked
            .remove(&tag)
            .ok_or(TransportError::ChannelClosed)
    }

    pub fn ack(&mut self, channel: ChannelId, tag: DeliveryTag) -> Result<(), TransportError> {
        self.take_unacked(channel, tag)?;
        Ok(())
    }

    /// Rejects a delivery. With `requeue` it returns to the head of its
    /// queue; otherwise it goes to the queue's dead-letter exchange, if any.
    pub fn nack(
        &mut self,
        channel: ChannelId,
        tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), TransportError> {
        let Unacked {
            queue: name,
            mut message,
            ..
        } = self.take_unacked(channel, tag)?;

        let Some(queue) = self.queues.get_mut(&name) else {
            return Ok(());
        };

        if requeue {
            message.redelivered = true;
            queue.ready.push_front(message);
            self.dispatch(&name);
            return Ok(());
        }

        match queue.options.dead_letter_exchange.clone() {
            Some(dlx) if self.exchanges.contains_key(&dlx) => {
                debug!(queue = %name, exchange = %dlx, "Dead-lettering message");
                message.exchange = dlx;
                message.redelivered = false;
                self.route(message);
            }
            _ => debug!(queue = %name, "Discarded rejected message"),
        }
        Ok(())
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for exchange in self.exchanges.values_mut() {
            exchange.unbind_queue(name);
        }
        self.unacked.retain(|_, u| u.queue != name);
        debug!(queue = name, "Deleted queue");
    }
}

fn not_found(kind: &'static str, name: &str) -> TransportError {
    TransportError::NotFound {
        kind,
        name: name.to_string(),
    }
}

/// Shared handle to an in-memory broker.
///
/// Cloning the handle shares the same broker state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Broker>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, Broker> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a new connection to this broker.
    pub fn connect(&self) -> MemoryConnection {
        let id = self.state().open_connection();
        MemoryConnection::new(id, self.clone())
    }

    /// Number of messages waiting in `queue`, not counting unacked ones.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state().queues.get(queue).map(|q| q.ready.len())
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    /// Number of messages from `queue` handed out and not yet disposed.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state()
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Bindings of `exchange` as (queue, routing key) pairs.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.state()
            .exchanges
            .get(exchange)
            .map(|e| {
                e.bindings
                    .iter()
                    .map(|b| (b.queue.clone(), b.routing_key.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}
