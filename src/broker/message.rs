/// A message held by the in-memory broker.
///
/// Messages are stored per queue once routed. A message dead-lettered or
/// requeued keeps the routing key it was originally published with.
///
/// # Fields
///
/// - `exchange` - The exchange the message was last published to.
/// - `routing_key` - The key used for routing.
/// - `body` - The encoded payload, opaque to the broker.
/// - `content_type` - Informational content-type tag set by the publisher.
/// - `redelivered` - Set once the message has been handed out and requeued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub redelivered: bool,
}

impl Message {
    pub fn new(exchange: &str, routing_key: &str, body: &[u8], content_type: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            content_type: Some(content_type.to_string()),
            redelivered: false,
        }
    }
}
