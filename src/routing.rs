//! Exchange names, routing-key conventions and the payload types the
//! `peril` binary exchanges.
//!
//! Keys are dotted: a fixed prefix per message category followed by the
//! identifier of the actor that produced it, e.g. `army_moves.alice`.
//! Subscribing with [`wildcard`] receives a whole category.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EXCHANGE_PERIL_DIRECT: &str = "peril_direct";
pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";
pub const EXCHANGE_PERIL_DLX: &str = crate::pubsub::DEAD_LETTER_EXCHANGE;

/// Queue collecting everything dead-lettered to [`EXCHANGE_PERIL_DLX`].
pub const DEAD_LETTER_QUEUE: &str = "peril_dlq";

pub const PAUSE_KEY: &str = "pause";
pub const ARMY_MOVES_PREFIX: &str = "army_moves";
pub const WAR_RECOGNITIONS_PREFIX: &str = "war";
pub const GAME_LOG_SLUG: &str = "game_logs";

/// `prefix.id`
pub fn routing_key(prefix: &str, id: &str) -> String {
    format!("{prefix}.{id}")
}

/// `prefix.*`, matching every single-word suffix of `prefix` on a topic exchange.
pub fn wildcard(prefix: &str) -> String {
    format!("{prefix}.*")
}

/// Pause state broadcast by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlayingState {
    pub is_paused: bool,
}

/// A line of game history, published by clients and collected by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GameLog {
    pub current_time: DateTime<Utc>,
    pub message: String,
    pub username: String,
}
