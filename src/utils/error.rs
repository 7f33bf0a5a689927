//! The `error` module defines the error types used across `peril-pubsub`.
//!
//! Setup-time failures (`BindingError`, `PublishError`, `SubscribeError`) are
//! returned to the caller and carry the exchange and routing key involved.
//! Steady-state failures on the consume path (`DecodeError`,
//! `DispositionError`) are logged by the delivery loop and never abort it.

use std::fmt;

use thiserror::Error;

use crate::pubsub::AckDecision;

/// Failures reported by a broker transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The RabbitMQ client reported an error.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// An exchange or queue referenced by the operation does not exist.
    #[error("no {kind} named '{name}'")]
    NotFound { kind: &'static str, name: String },

    /// A queue was re-declared with arguments that differ from the existing one.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// An exclusive queue is owned by another connection.
    #[error("resource locked: {0}")]
    ResourceLocked(String),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("connection is closed")]
    ConnectionClosed,
}

/// The step of `declare_and_bind` that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingStep {
    OpenChannel,
    DeclareQueue,
    BindQueue,
}

impl fmt::Display for BindingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            BindingStep::OpenChannel => "open a channel",
            BindingStep::DeclareQueue => "declare queue",
            BindingStep::BindQueue => "bind queue",
        };
        f.write_str(step)
    }
}

/// Declaring or binding a queue failed at the broker.
#[derive(Debug, Error)]
#[error("failed to {step} '{queue}' on {exchange}@{routing_key}: {source}")]
pub struct BindingError {
    pub step: BindingStep,
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub source: TransportError,
}

/// A value could not be serialized into a message body.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to encode bincode: {0}")]
    Bincode(#[from] bincode::error::EncodeError),
}

/// A message body could not be turned back into a value.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to decode JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to decode bincode: {0}")]
    Bincode(#[from] bincode::error::DecodeError),

    #[error("{trailing} trailing byte(s) after a {consumed}-byte value")]
    TrailingBytes { consumed: usize, trailing: usize },
}

/// Publishing a message failed; nothing was retried.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode message for {exchange}@{routing_key}: {source}")]
    Encode {
        exchange: String,
        routing_key: String,
        source: EncodeError,
    },

    #[error("failed to publish message to {exchange}@{routing_key}: {source}")]
    Broker {
        exchange: String,
        routing_key: String,
        source: TransportError,
    },
}

/// Setting up a subscription failed before any message was consumed.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error("failed to consume messages from queue '{queue}': {source}")]
    Consume {
        queue: String,
        source: TransportError,
    },
}

/// The ack/nack call for a delivery was rejected by the broker.
#[derive(Debug, Error)]
#[error("failed to {decision} delivery: {source}")]
pub struct DispositionError {
    pub decision: AckDecision,
    pub source: TransportError,
}
