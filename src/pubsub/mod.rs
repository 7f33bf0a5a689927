//! The `pubsub` module is the typed messaging layer over a broker transport.
//!
//! - `queue`: declares a queue with a durability policy and binds it.
//! - `codec`: JSON and bincode serialization strategies.
//! - `publish`: encodes a value and publishes it to an exchange.
//! - `subscribe`: binds, consumes, decodes, dispatches to a handler and
//!   disposes every delivery according to the handler's [`AckDecision`].

pub mod ack;
pub mod codec;
pub mod publish;
pub mod queue;
pub mod subscribe;

pub use ack::AckDecision;
pub use codec::{Bincode, Codec, Encoded, Json};
pub use publish::{publish, publish_bincode, publish_json};
pub use queue::{DEAD_LETTER_EXCHANGE, QueueDurability, QueueFlags, declare_and_bind};
pub use subscribe::{
    DeliveryStats, Handler, HandlerFn, Subscription, handler_fn, subscribe, subscribe_bincode,
    subscribe_json,
};

#[cfg(test)]
mod tests;
