use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Serialize, Serializer};
use serde_json::json;

use super::Publisher;
use crate::broker::message::{OutboundMessage, PublishOptions};
use crate::config::TopologySettings;
use crate::connection::{ConnectionSupervisor, SupervisorConfig};
use crate::topology::Topology;
use crate::transport::memory::MemoryBroker;
use crate::transport::{CORRELATION_HEADER, Channel, Connection, Connector, Delivery};

fn publisher(broker: &MemoryBroker) -> (ConnectionSupervisor, Publisher) {
    let config = SupervisorConfig {
        url: "memory://test".to_string(),
        max_reconnect_attempts: 5,
        reconnect_delay: Duration::from_millis(5000),
    };
    let topology = Topology::from_settings(&TopologySettings::standard(), 10).unwrap();
    let supervisor = ConnectionSupervisor::new(config, Arc::new(broker.connector()), topology);
    (supervisor.clone(), Publisher::new(supervisor))
}

async fn take_one(broker: &MemoryBroker, queue: &str) -> Delivery {
    let connection = broker.connector().connect("memory://reader").await.unwrap();
    let channel = connection.create_channel().await.unwrap();
    let mut stream = channel.consume(queue, "reader").await.unwrap();
    stream.next().await.flatten().expect("a delivery")
}

struct Unserializable;

impl Serialize for Unserializable {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom("cannot serialize"))
    }
}

#[tokio::test]
async fn test_publish_when_not_ready_returns_false_without_io() {
    let broker = MemoryBroker::new();
    let (_supervisor, publisher) = publisher(&broker);

    let accepted = publisher
        .publish("reviews", "review.created", &json!({"reviewId": "r1"}), PublishOptions::default())
        .await;

    assert!(!accepted);
    assert_eq!(broker.stats().connect_attempts, 0);
    assert_eq!(broker.stats().published, 0);
}

#[tokio::test]
async fn test_publish_applies_default_options() {
    let broker = MemoryBroker::new();
    let (supervisor, publisher) = publisher(&broker);
    supervisor.connect().await.unwrap();

    let accepted = publisher
        .publish("reviews", "review.created", &json!({"reviewId": "r1"}), PublishOptions::default())
        .await;
    assert!(accepted);

    let delivery = take_one(&broker, "review_events").await;
    let body: serde_json::Value = serde_json::from_slice(&delivery.body).unwrap();
    assert_eq!(body, json!({"reviewId": "r1"}));

    let props = &delivery.properties;
    assert!(props.persistent);
    assert!(props.timestamp.unwrap() > 0);
    assert!(!props.message_id.as_deref().unwrap().is_empty());
    assert_eq!(props.content_type.as_deref(), Some("application/json"));
    assert_eq!(props.correlation_id, None);
}

#[tokio::test]
async fn test_caller_options_override_defaults() {
    let broker = MemoryBroker::new();
    let (supervisor, publisher) = publisher(&broker);
    supervisor.connect().await.unwrap();

    let options = PublishOptions {
        persistent: Some(false),
        timestamp: Some(1_725_000_000),
        message_id: Some("msg-1".to_string()),
        ..Default::default()
    }
    .with_correlation_id("corr-1")
    .with_header("x-source", "catalog");

    assert!(
        publisher
            .publish("orders", "order.created", &json!({"orderId": 7}), options)
            .await
    );

    let delivery = take_one(&broker, "order_events").await;
    let props = &delivery.properties;
    assert!(!props.persistent);
    assert_eq!(props.timestamp, Some(1_725_000_000));
    assert_eq!(props.message_id.as_deref(), Some("msg-1"));
    assert_eq!(props.correlation_id.as_deref(), Some("corr-1"));
    assert_eq!(props.headers.get(CORRELATION_HEADER).map(String::as_str), Some("corr-1"));
    assert_eq!(props.headers.get("x-source").map(String::as_str), Some("catalog"));
}

#[tokio::test]
async fn test_serialization_failure_returns_false() {
    let broker = MemoryBroker::new();
    let (supervisor, publisher) = publisher(&broker);
    supervisor.connect().await.unwrap();

    let accepted = publisher
        .publish("reviews", "review.created", &Unserializable, PublishOptions::default())
        .await;

    assert!(!accepted);
    assert_eq!(broker.stats().published, 0);
}

#[tokio::test]
async fn test_backpressure_returns_false() {
    let broker = MemoryBroker::new();
    let (supervisor, publisher) = publisher(&broker);
    supervisor.connect().await.unwrap();
    broker.set_blocked(true);

    let accepted = publisher
        .publish("users", "user.created", &json!({}), PublishOptions::default())
        .await;
    assert!(!accepted);
    assert!(supervisor.is_ready());
}

#[tokio::test]
async fn test_submission_error_returns_false() {
    let broker = MemoryBroker::new();
    let (supervisor, publisher) = publisher(&broker);
    supervisor.connect().await.unwrap();

    broker.set_publish_failure(true);
    assert!(
        !publisher
            .publish("users", "user.created", &json!({}), PublishOptions::default())
            .await
    );

    broker.set_publish_failure(false);
    assert!(
        !publisher
            .publish("no-such-exchange", "x", &json!({}), PublishOptions::default())
            .await
    );
}

#[tokio::test]
async fn test_publish_message_fans_in_review_created() {
    let broker = MemoryBroker::new();
    let (supervisor, publisher) = publisher(&broker);
    supervisor.connect().await.unwrap();

    let message = OutboundMessage {
        exchange: "reviews".to_string(),
        routing_key: "review.created".to_string(),
        payload: json!({"reviewId": "r1", "productId": "p1"}),
        options: PublishOptions::default(),
    };
    assert!(publisher.publish_message(&message).await);

    assert_eq!(broker.ready_count("review_events"), 1);
    assert_eq!(broker.ready_count("product_events"), 1);
    assert_eq!(broker.ready_count("order_events"), 0);
}
