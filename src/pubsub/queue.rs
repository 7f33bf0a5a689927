use tracing::{debug, error};

use crate::transport::{Channel, Connection, DeclaredQueue, QueueOptions};
use crate::utils::error::{BindingError, BindingStep, TransportError};

/// Exchange every declared queue dead-letters rejected messages to.
pub const DEAD_LETTER_EXCHANGE: &str = "peril_dlx";

/// Whether a queue outlives its connection and the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDurability {
    /// Survives broker restarts; never auto-deleted.
    Durable,
    /// Exclusive to the declaring connection and deleted with it.
    Transient,
}

/// The broker flags a durability policy maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFlags {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl QueueDurability {
    pub fn flags(self) -> QueueFlags {
        match self {
            QueueDurability::Durable => QueueFlags {
                durable: true,
                auto_delete: false,
                exclusive: false,
            },
            QueueDurability::Transient => QueueFlags {
                durable: false,
                auto_delete: true,
                exclusive: true,
            },
        }
    }

    /// Full declaration options, including the dead-letter exchange.
    pub fn queue_options(self) -> QueueOptions {
        let QueueFlags {
            durable,
            auto_delete,
            exclusive,
        } = self.flags();
        QueueOptions {
            durable,
            auto_delete,
            exclusive,
            dead_letter_exchange: Some(DEAD_LETTER_EXCHANGE.to_string()),
        }
    }
}

/// Opens a fresh channel, declares `queue_name` with the flags of
/// `durability` and binds it to `exchange` under `routing_key`.
///
/// The returned channel is the one the queue was declared on; subscribers
/// consume from it. Nothing is retried on failure.
pub async fn declare_and_bind<C: Connection>(
    conn: &C,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    durability: QueueDurability,
) -> Result<(C::Channel, DeclaredQueue), BindingError> {
    let fail = |step: BindingStep, queue: &str, source: TransportError| {
        error!(
            exchange,
            routing_key,
            queue,
            error = %source,
            "Failed to {step}"
        );
        BindingError {
            step,
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            source,
        }
    };

    let channel = conn
        .open_channel()
        .await
        .map_err(|e| fail(BindingStep::OpenChannel, queue_name, e))?;

    let queue = channel
        .declare_queue(queue_name, &durability.queue_options())
        .await
        .map_err(|e| fail(BindingStep::DeclareQueue, queue_name, e))?;
    debug!(queue = %queue.name, ?durability, "Declared queue");

    channel
        .bind_queue(&queue.name, exchange, routing_key)
        .await
        .map_err(|e| fail(BindingStep::BindQueue, &queue.name, e))?;
    debug!(queue = %queue.name, exchange, routing_key, "Bound queue");

    Ok((channel, queue))
}
