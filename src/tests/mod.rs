//! End-to-end scenarios for the pub/sub layer.
//!
//! `scenarios` runs against the in-memory broker. `rabbitmq` needs a live
//! broker and is ignored unless requested.
