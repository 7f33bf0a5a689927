//! # peril-pubsub
//!
//! `peril-pubsub` is a typed publish/subscribe layer over an AMQP broker.
//! Application code publishes and consumes plain Rust values; the crate
//! takes care of queue declaration, serialization, the consume loop and
//! acknowledgement bookkeeping.
//!
//! ## Core Modules
//!
//! - `pubsub`: queue binding, codecs, the publisher and the delivery pipeline.
//! - `transport`: the broker traits, with RabbitMQ (`lapin`) and in-memory implementations.
//! - `broker`: an in-process AMQP-like broker used by tests and local runs.
//! - `routing`: exchange names, routing-key conventions and payload types.
//! - `config`: Handles loading and managing configuration.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod config;
pub mod pubsub;
pub mod routing;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod tests;
