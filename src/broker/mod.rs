//! The `broker` module is an in-process, AMQP-like message broker.
//!
//! It backs the test suite and local experiments with the same exchange,
//! queue, binding and acknowledgement semantics the pub/sub layer relies on
//! from RabbitMQ. Connect to it through [`MemoryBroker::connect`], which
//! returns a [`crate::transport::memory::MemoryConnection`].

pub mod engine;
pub mod message;
pub mod topic;

pub use engine::MemoryBroker;
pub use message::Message;
