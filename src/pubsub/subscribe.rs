//! Subscriber and delivery pipeline.
//!
//! [`subscribe`] binds a queue, starts a manual-ack consumer on it and spawns
//! one delivery loop per call. Each delivery is decoded, passed to the
//! handler and then disposed exactly once according to the returned
//! [`AckDecision`]:
//!
//! ```text
//! Received -> Decoded -> HandlerInvoked -> Acked | NackedRequeue | NackedDiscard
//! Received -> DecodeFailed -> NackedDiscard
//! Received -> Decoded -> HandlerPanicked -> NackedDiscard
//! ```
//!
//! Decode failures, handler panics and disposition failures are logged and
//! the loop moves on to the next delivery. The loop ends when the consumer
//! stream ends or reports that its channel or connection is closed.

use std::any::Any;
use std::future::{self, Future};
use std::panic::AssertUnwindSafe;

use futures_util::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::pubsub::ack::AckDecision;
use crate::pubsub::codec::{Bincode, Codec, Json};
use crate::pubsub::queue::{QueueDurability, declare_and_bind};
use crate::transport::{Channel, Connection, Deliveries, Delivery};
use crate::utils::error::{DispositionError, SubscribeError, TransportError};

/// Receives decoded values and decides how each delivery is disposed.
///
/// Any `FnMut(T) -> AckDecision` closure is a handler. It runs inline in
/// the delivery loop, so it should return quickly. A handler that panics
/// gets its delivery discarded and keeps receiving later ones. Use [`handler_fn`] for
/// handlers that need to await, for example to publish a follow-up message.
pub trait Handler<T>: Send + 'static {
    fn handle(&mut self, value: T) -> impl Future<Output = AckDecision> + Send;
}

impl<T, F> Handler<T> for F
where
    F: FnMut(T) -> AckDecision + Send + 'static,
{
    fn handle(&mut self, value: T) -> impl Future<Output = AckDecision> + Send {
        future::ready(self(value))
    }
}

/// Handler built from a closure returning a future. See [`handler_fn`].
#[derive(Debug, Clone)]
pub struct HandlerFn<F>(F);

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn(f)
}

impl<T, F, Fut> Handler<T> for HandlerFn<F>
where
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = AckDecision> + Send,
{
    fn handle(&mut self, value: T) -> impl Future<Output = AckDecision> + Send {
        (self.0)(value)
    }
}

/// Counters reported by a delivery loop when its stream ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
    pub decode_failures: u64,
    pub handler_panics: u64,
    pub disposition_failures: u64,
}

impl DeliveryStats {
    fn record(&mut self, decision: AckDecision) {
        match decision {
            AckDecision::Ack => self.acked += 1,
            AckDecision::NackRequeue => self.requeued += 1,
            AckDecision::NackDiscard => self.discarded += 1,
        }
    }
}

/// A running subscription.
///
/// Dropping it leaves the delivery loop running. The loop stops when its
/// channel or connection is closed.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    handle: JoinHandle<DeliveryStats>,
}

impl Subscription {
    /// Name of the bound queue, as declared by the broker.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Waits for the delivery loop to end. `None` if the loop panicked.
    pub async fn closed(self) -> Option<DeliveryStats> {
        self.handle.await.ok()
    }
}

/// Binds `queue_name` to `exchange` under `routing_key`, starts consuming
/// it and spawns the delivery loop.
///
/// Returns once the consumer is registered. Setup failures are returned
/// and nothing is consumed.
pub async fn subscribe<T, C, K, H>(
    conn: &C,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    durability: QueueDurability,
    codec: K,
    handler: H,
) -> Result<Subscription, SubscribeError>
where
    T: DeserializeOwned + Send + 'static,
    C: Connection,
    K: Codec,
    H: Handler<T>,
{
    let (channel, queue) =
        declare_and_bind(conn, exchange, queue_name, routing_key, durability).await?;

    let consumer_tag = format!("{}-{}", queue.name, Uuid::new_v4());
    let deliveries = channel
        .consume(&queue.name, &consumer_tag)
        .await
        .map_err(|source| {
            error!(queue = %queue.name, error = %source, "Failed to consume messages");
            SubscribeError::Consume {
                queue: queue.name.clone(),
                source,
            }
        })?;

    info!(
        exchange,
        routing_key,
        queue = %queue.name,
        content_type = codec.content_type(),
        "Subscribed"
    );

    let name = queue.name.clone();
    let handle = tokio::spawn(async move {
        // The loop owns the channel so it stays open while consuming.
        let _channel = channel;
        run_delivery_loop(&name, deliveries, codec, handler).await
    });

    Ok(Subscription {
        queue: queue.name,
        handle,
    })
}

/// [`subscribe`] with the [`Json`] codec.
pub async fn subscribe_json<T, C, H>(
    conn: &C,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    durability: QueueDurability,
    handler: H,
) -> Result<Subscription, SubscribeError>
where
    T: DeserializeOwned + Send + 'static,
    C: Connection,
    H: Handler<T>,
{
    subscribe(
        conn,
        exchange,
        queue_name,
        routing_key,
        durability,
        Json,
        handler,
    )
    .await
}

/// [`subscribe`] with the [`Bincode`] codec.
pub async fn subscribe_bincode<T, C, H>(
    conn: &C,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    durability: QueueDurability,
    handler: H,
) -> Result<Subscription, SubscribeError>
where
    T: DeserializeOwned + Send + 'static,
    C: Connection,
    H: Handler<T>,
{
    subscribe(
        conn,
        exchange,
        queue_name,
        routing_key,
        durability,
        Bincode,
        handler,
    )
    .await
}

pub(crate) async fn run_delivery_loop<T, D, K, H>(
    queue: &str,
    mut deliveries: Deliveries<D>,
    codec: K,
    mut handler: H,
) -> DeliveryStats
where
    T: DeserializeOwned + Send + 'static,
    D: Delivery,
    K: Codec,
    H: Handler<T>,
{
    let mut stats = DeliveryStats::default();

    while let Some(next) = deliveries.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e @ (TransportError::ChannelClosed | TransportError::ConnectionClosed)) => {
                warn!(queue, error = %e, "Consumer lost its channel, stopping");
                break;
            }
            Err(e) => {
                warn!(queue, error = %e, "Consumer stream reported an error");
                continue;
            }
        };

        let decision = match codec.decode::<T>(delivery.payload()) {
            // Synchronous handlers run inside `handle`, so the call itself
            // must happen under `catch_unwind`.
            Ok(value) => match AssertUnwindSafe(async { handler.handle(value).await })
                .catch_unwind()
                .await
            {
                Ok(decision) => decision,
                Err(panic) => {
                    error!(
                        queue,
                        routing_key = delivery.routing_key(),
                        panic = panic_message(panic.as_ref()),
                        "Handler panicked, discarding delivery"
                    );
                    stats.handler_panics += 1;
                    AckDecision::NackDiscard
                }
            },
            Err(e) => {
                warn!(
                    queue,
                    routing_key = delivery.routing_key(),
                    content_type = ?delivery.content_type(),
                    error = %e,
                    "Failed to decode delivery, discarding it"
                );
                stats.decode_failures += 1;
                AckDecision::NackDiscard
            }
        };

        match dispose(delivery, decision).await {
            Ok(()) => {
                debug!(queue, %decision, "Disposed delivery");
                stats.record(decision);
            }
            Err(e) => {
                error!(queue, error = %e, "Failed to dispose delivery");
                stats.disposition_failures += 1;
            }
        }
    }

    info!(queue, ?stats, "Delivery stream closed");
    stats
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

async fn dispose<D: Delivery>(delivery: D, decision: AckDecision) -> Result<(), DispositionError> {
    let result = match decision.requeue() {
        None => delivery.ack().await,
        Some(requeue) => delivery.nack(requeue).await,
    };
    result.map_err(|source| DispositionError { decision, source })
}
