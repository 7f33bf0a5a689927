use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::subscribe::run_delivery_loop;
use super::*;
use crate::broker::MemoryBroker;
use crate::transport::{Channel, Connection, Deliveries, Delivery, ExchangeKind, QueueOptions};
use crate::utils::error::{BindingStep, DecodeError, PublishError, SubscribeError, TransportError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ArmyMove {
    player: String,
    units: Vec<u32>,
    to_location: String,
}

fn sample_move() -> ArmyMove {
    ArmyMove {
        player: "alice".to_string(),
        units: vec![1, 2, 3],
        to_location: "asia".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposal {
    Ack,
    Nack { requeue: bool },
}

type DisposalLog = Arc<Mutex<Vec<(usize, Disposal)>>>;

/// Delivery that records how it was disposed.
struct FakeDelivery {
    id: usize,
    body: Vec<u8>,
    fail: bool,
    log: DisposalLog,
}

impl FakeDelivery {
    fn record(self, disposal: Disposal) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::ChannelClosed);
        }
        self.log.lock().unwrap().push((self.id, disposal));
        Ok(())
    }
}

impl Delivery for FakeDelivery {
    fn payload(&self) -> &[u8] {
        &self.body
    }

    fn content_type(&self) -> Option<&str> {
        Some(Json::CONTENT_TYPE)
    }

    fn routing_key(&self) -> &str {
        "test.key"
    }

    fn redelivered(&self) -> bool {
        false
    }

    async fn ack(self) -> Result<(), TransportError> {
        self.record(Disposal::Ack)
    }

    async fn nack(self, requeue: bool) -> Result<(), TransportError> {
        self.record(Disposal::Nack { requeue })
    }
}

fn fake_stream(
    bodies: Vec<(Vec<u8>, bool)>,
    log: &DisposalLog,
) -> Deliveries<FakeDelivery> {
    let deliveries: Vec<Result<FakeDelivery, TransportError>> = bodies
        .into_iter()
        .enumerate()
        .map(|(id, (body, fail))| {
            Ok(FakeDelivery {
                id,
                body,
                fail,
                log: log.clone(),
            })
        })
        .collect();
    futures::stream::iter(deliveries).boxed()
}

fn json(value: &str) -> (Vec<u8>, bool) {
    (serde_json::to_vec(value).unwrap(), false)
}

#[test]
fn test_durability_flags_match_broker_contract() {
    assert_eq!(
        QueueDurability::Durable.flags(),
        QueueFlags {
            durable: true,
            auto_delete: false,
            exclusive: false,
        }
    );
    assert_eq!(
        QueueDurability::Transient.flags(),
        QueueFlags {
            durable: false,
            auto_delete: true,
            exclusive: true,
        }
    );
}

#[test]
fn test_queue_options_always_carry_dead_letter_exchange() {
    for durability in [QueueDurability::Durable, QueueDurability::Transient] {
        let options = durability.queue_options();
        assert_eq!(options.dead_letter_exchange.as_deref(), Some("peril_dlx"));
        assert_eq!(options.durable, durability.flags().durable);
    }
}

#[test]
fn test_ack_decision_requeue_mapping() {
    assert_eq!(AckDecision::Ack.requeue(), None);
    assert_eq!(AckDecision::NackRequeue.requeue(), Some(true));
    assert_eq!(AckDecision::NackDiscard.requeue(), Some(false));
    assert_eq!(AckDecision::NackDiscard.to_string(), "nack-discard");
}

#[test]
fn test_json_round_trip_and_content_type() {
    let encoded = Json.encode(&sample_move()).unwrap();
    assert_eq!(encoded.content_type, "application/json");
    let decoded: ArmyMove = Json.decode(&encoded.body).unwrap();
    assert_eq!(decoded, sample_move());
}

#[test]
fn test_bincode_round_trip_and_content_type() {
    let encoded = Bincode.encode(&sample_move()).unwrap();
    assert_eq!(encoded.content_type, "application/octet-stream");
    let decoded: ArmyMove = Bincode.decode(&encoded.body).unwrap();
    assert_eq!(decoded, sample_move());
}

#[test]
fn test_json_rejects_malformed_and_mismatched_input() {
    let err = Json.decode::<ArmyMove>(b"{\"player\":").unwrap_err();
    assert!(matches!(err, DecodeError::Json(_)));

    let err = Json.decode::<ArmyMove>(br#"{"player":1}"#).unwrap_err();
    assert!(matches!(err, DecodeError::Json(_)));
}

#[test]
fn test_bincode_rejects_truncated_input() {
    let encoded = Bincode.encode(&sample_move()).unwrap();
    let truncated = &encoded.body[..encoded.body.len() / 2];
    let err = Bincode.decode::<ArmyMove>(truncated).unwrap_err();
    assert!(matches!(err, DecodeError::Bincode(_)));
}

#[test]
fn test_bincode_rejects_trailing_bytes() {
    let mut body = Bincode.encode(&sample_move()).unwrap().body;
    body.push(0);
    let err = Bincode.decode::<ArmyMove>(&body).unwrap_err();
    assert!(matches!(err, DecodeError::TrailingBytes { trailing: 1, .. }));
}

#[tokio::test]
async fn test_each_decision_is_disposed_exactly_once() {
    let log = DisposalLog::default();
    let stream = fake_stream(vec![json("ack"), json("requeue"), json("discard")], &log);

    let handler = |value: String| match value.as_str() {
        "ack" => AckDecision::Ack,
        "requeue" => AckDecision::NackRequeue,
        _ => AckDecision::NackDiscard,
    };
    let stats = run_delivery_loop("q", stream, Json, handler).await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            (0, Disposal::Ack),
            (1, Disposal::Nack { requeue: true }),
            (2, Disposal::Nack { requeue: false }),
        ]
    );
    assert_eq!(
        stats,
        DeliveryStats {
            acked: 1,
            requeued: 1,
            discarded: 1,
            ..DeliveryStats::default()
        }
    );
}

#[tokio::test]
async fn test_decode_failure_discards_and_loop_continues() {
    let log = DisposalLog::default();
    let stream = fake_stream(vec![(b"not json".to_vec(), false), json("next")], &log);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler_seen = seen.clone();
    let handler = move |value: String| {
        handler_seen.lock().unwrap().push(value);
        AckDecision::Ack
    };
    let stats = run_delivery_loop("q", stream, Json, handler).await;

    assert_eq!(*seen.lock().unwrap(), vec!["next".to_string()]);
    assert_eq!(
        *log.lock().unwrap(),
        vec![(0, Disposal::Nack { requeue: false }), (1, Disposal::Ack)]
    );
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.acked, 1);
}

#[tokio::test]
async fn test_disposition_failure_does_not_stop_loop() {
    let log = DisposalLog::default();
    let (body, _) = json("first");
    let stream = fake_stream(vec![(body, true), json("second")], &log);

    let stats = run_delivery_loop("q", stream, Json, |_: String| AckDecision::Ack).await;

    assert_eq!(*log.lock().unwrap(), vec![(1, Disposal::Ack)]);
    assert_eq!(stats.disposition_failures, 1);
    assert_eq!(stats.acked, 1);
}

#[tokio::test]
async fn test_stream_errors_are_skipped() {
    let log = DisposalLog::default();
    let items: Vec<Result<FakeDelivery, TransportError>> = vec![
        Err(TransportError::PreconditionFailed("consumer hiccup".to_string())),
        Ok(FakeDelivery {
            id: 7,
            body: serde_json::to_vec("ok").unwrap(),
            fail: false,
            log: log.clone(),
        }),
    ];
    let stream = futures::stream::iter(items).boxed();

    let stats = run_delivery_loop("q", stream, Json, |_: String| AckDecision::Ack).await;

    assert_eq!(*log.lock().unwrap(), vec![(7, Disposal::Ack)]);
    assert_eq!(stats.acked, 1);
}

#[tokio::test]
async fn test_closed_channel_error_stops_loop() {
    let log = DisposalLog::default();
    let delivery = |id| {
        Ok(FakeDelivery {
            id,
            body: serde_json::to_vec("ok").unwrap(),
            fail: false,
            log: log.clone(),
        })
    };
    let items: Vec<Result<FakeDelivery, TransportError>> = vec![
        delivery(0),
        Err(TransportError::ConnectionClosed),
        delivery(1),
    ];
    // Never ends on its own; only the closed error can stop the loop.
    let stream = futures::stream::iter(items)
        .chain(futures::stream::pending())
        .boxed();

    let stats = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        run_delivery_loop("q", stream, Json, |_: String| AckDecision::Ack),
    )
    .await
    .expect("loop kept running after the connection closed");

    assert_eq!(*log.lock().unwrap(), vec![(0, Disposal::Ack)]);
    assert_eq!(stats.acked, 1);
}

#[tokio::test]
async fn test_handler_panic_discards_and_loop_continues() {
    let log = DisposalLog::default();
    let stream = fake_stream(vec![json("boom"), json("fine")], &log);

    let handler = |value: String| {
        if value == "boom" {
            panic!("handler blew up on {value}");
        }
        AckDecision::Ack
    };
    let stats = run_delivery_loop("q", stream, Json, handler).await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![(0, Disposal::Nack { requeue: false }), (1, Disposal::Ack)]
    );
    assert_eq!(stats.handler_panics, 1);
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.acked, 1);
}

#[tokio::test]
async fn test_async_handler_is_awaited() {
    let log = DisposalLog::default();
    let stream = fake_stream(vec![json("later")], &log);

    let handler = handler_fn(|value: String| async move {
        tokio::task::yield_now().await;
        if value == "later" {
            AckDecision::NackRequeue
        } else {
            AckDecision::Ack
        }
    });
    run_delivery_loop("q", stream, Json, handler).await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![(0, Disposal::Nack { requeue: true })]
    );
}

async fn broker_with_exchanges() -> (MemoryBroker, crate::transport::memory::MemoryChannel) {
    let broker = MemoryBroker::new();
    let admin = broker.connect();
    let channel = admin.open_channel().await.unwrap();
    channel
        .declare_exchange("peril_topic", ExchangeKind::Topic)
        .await
        .unwrap();
    channel
        .declare_exchange("peril_dlx", ExchangeKind::Fanout)
        .await
        .unwrap();
    (broker, channel)
}

#[tokio::test]
async fn test_declare_and_bind_is_idempotent() {
    let (broker, _admin) = broker_with_exchanges().await;
    let conn = broker.connect();

    let (_, first) = declare_and_bind(
        &conn,
        "peril_topic",
        "game_logs",
        "game_logs.*",
        QueueDurability::Durable,
    )
    .await
    .unwrap();
    let bindings = broker.bindings("peril_topic");

    let (_, second) = declare_and_bind(
        &conn,
        "peril_topic",
        "game_logs",
        "game_logs.*",
        QueueDurability::Durable,
    )
    .await
    .unwrap();

    assert_eq!(first, second);
    assert_eq!(broker.bindings("peril_topic"), bindings);
    assert_eq!(
        bindings,
        vec![("game_logs".to_string(), "game_logs.*".to_string())]
    );
}

#[tokio::test]
async fn test_declare_and_bind_reports_failing_step() {
    let broker = MemoryBroker::new();
    let conn = broker.connect();

    let err = declare_and_bind(
        &conn,
        "missing",
        "game_logs",
        "game_logs.*",
        QueueDurability::Durable,
    )
    .await
    .unwrap_err();

    assert_eq!(err.step, BindingStep::BindQueue);
    assert_eq!(err.exchange, "missing");
    assert_eq!(err.routing_key, "game_logs.*");
    assert!(matches!(err.source, TransportError::NotFound { .. }));
}

#[tokio::test]
async fn test_declare_and_bind_conflicting_durability_fails() {
    let (broker, _admin) = broker_with_exchanges().await;
    let conn = broker.connect();

    declare_and_bind(&conn, "peril_topic", "war", "war.*", QueueDurability::Durable)
        .await
        .unwrap();
    let err = declare_and_bind(&conn, "peril_topic", "war", "war.*", QueueDurability::Transient)
        .await
        .unwrap_err();

    assert_eq!(err.step, BindingStep::DeclareQueue);
    assert!(matches!(err.source, TransportError::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_declare_and_bind_on_closed_connection_fails_to_open_channel() {
    let broker = MemoryBroker::new();
    let conn = broker.connect();
    conn.close();

    let err = declare_and_bind(&conn, "peril_topic", "war", "war.*", QueueDurability::Durable)
        .await
        .unwrap_err();
    assert_eq!(err.step, BindingStep::OpenChannel);
}

#[tokio::test]
async fn test_publish_reports_encode_failure() {
    let (_broker, channel) = broker_with_exchanges().await;
    let mut bad_keys = HashMap::new();
    bad_keys.insert((1, 2), "json object keys must be strings");

    let err = publish_json(&channel, "peril_topic", "war.alice", &bad_keys)
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::Encode { .. }));
}

#[tokio::test]
async fn test_publish_to_missing_exchange_fails() {
    let (_broker, channel) = broker_with_exchanges().await;

    let err = publish_bincode(&channel, "nope", "war.alice", &sample_move())
        .await
        .unwrap_err();
    match err {
        PublishError::Broker {
            exchange,
            routing_key,
            ..
        } => {
            assert_eq!(exchange, "nope");
            assert_eq!(routing_key, "war.alice");
        }
        other => panic!("expected broker error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_publish_sets_content_type() {
    let (broker, channel) = broker_with_exchanges().await;
    let options = QueueOptions {
        durable: true,
        ..QueueOptions::default()
    };
    channel.declare_queue("moves", &options).await.unwrap();
    channel
        .bind_queue("moves", "peril_topic", "army_moves.*")
        .await
        .unwrap();

    publish_bincode(&channel, "peril_topic", "army_moves.alice", &sample_move())
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("moves"), Some(1));

    let mut deliveries = channel.consume("moves", "t").await.unwrap();
    let delivery = deliveries.next().await.unwrap().unwrap();
    assert_eq!(delivery.content_type(), Some("application/octet-stream"));
    assert_eq!(delivery.routing_key(), "army_moves.alice");
    let decoded: ArmyMove = Bincode.decode(delivery.payload()).unwrap();
    assert_eq!(decoded, sample_move());
    delivery.ack().await.unwrap();
}

#[tokio::test]
async fn test_subscribe_fails_before_consuming_when_binding_fails() {
    let broker = MemoryBroker::new();
    let conn = broker.connect();

    let result = subscribe_json(
        &conn,
        "missing",
        "pause.alice",
        "pause",
        QueueDurability::Transient,
        |_: String| AckDecision::Ack,
    )
    .await;

    assert!(matches!(result, Err(SubscribeError::Binding(_))));
}
