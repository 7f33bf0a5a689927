use serde::Serialize;
use tracing::{debug, error};

use crate::pubsub::codec::{Bincode, Codec, Json};
use crate::transport::Channel;
use crate::utils::error::PublishError;

/// Encodes `value` with `codec` and publishes it to `exchange` under
/// `routing_key`.
///
/// Resolves once the channel has accepted the message. Failures are
/// returned as they happen; retrying is up to the caller.
pub async fn publish<C, K, T>(
    channel: &C,
    exchange: &str,
    routing_key: &str,
    value: &T,
    codec: K,
) -> Result<(), PublishError>
where
    C: Channel,
    K: Codec,
    T: Serialize + ?Sized,
{
    let encoded = codec.encode(value).map_err(|source| {
        error!(exchange, routing_key, error = %source, "Failed to encode message");
        PublishError::Encode {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            source,
        }
    })?;

    channel
        .publish(exchange, routing_key, &encoded.body, encoded.content_type)
        .await
        .map_err(|source| {
            error!(exchange, routing_key, error = %source, "Failed to publish message");
            PublishError::Broker {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                source,
            }
        })?;

    debug!(
        exchange,
        routing_key,
        content_type = encoded.content_type,
        bytes = encoded.body.len(),
        "Published message"
    );
    Ok(())
}

/// [`publish`] with the [`Json`] codec.
pub async fn publish_json<C, T>(
    channel: &C,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PublishError>
where
    C: Channel,
    T: Serialize + ?Sized,
{
    publish(channel, exchange, routing_key, value, Json).await
}

/// [`publish`] with the [`Bincode`] codec.
pub async fn publish_bincode<C, T>(
    channel: &C,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PublishError>
where
    C: Channel,
    T: Serialize + ?Sized,
{
    publish(channel, exchange, routing_key, value, Bincode).await
}
