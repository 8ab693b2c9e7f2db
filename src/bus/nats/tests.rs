use super::*;
use crate::bus::ConnectorError;
use crate::test_utils::RecordingHost;
use crate::transport::{ConnectOptions, MemoryBroker, TransportError};
use tokio_test::assert_ok;

fn connector(broker: &MemoryBroker, host: Arc<RecordingHost>) -> NatsConnector {
    NatsConnector::new(NatsSettings::default(), Arc::new(broker.clone()), host)
}

#[tokio::test]
async fn test_subscribes_on_event_name_with_group() {
    let broker = MemoryBroker::new();
    let host = Arc::new(RecordingHost::new());
    let connector = connector(&broker, host.clone());

    connector.register("order_created", "billing").await;
    connector.open().await.unwrap();
    connector.start().await.unwrap();

    assert_eq!(broker.queue_groups("order_created").await, vec!["billing"]);

    connector
        .publish("order_created", Bytes::from_static(b"{\"id\":1}"))
        .await
        .unwrap();

    let served = host.wait_for(1).await;
    assert_eq!(
        served,
        vec![(
            "order_created".to_string(),
            Bytes::from_static(b"{\"id\":1}")
        )]
    );
}

#[tokio::test]
async fn test_open_uses_configured_credentials() {
    let broker = MemoryBroker::new();
    let instance = InstanceConfig::new("nats")
        .with_setting("url", "nats://a:4222")
        .with_setting("server", "nats://b:4222")
        .with_setting("token", "s3cret");
    let connector = NatsConnector::from_instance(
        &instance,
        Arc::new(broker.clone()),
        Arc::new(RecordingHost::new()),
    )
    .unwrap();

    connector.open().await.unwrap();

    assert_eq!(
        broker.connections().await,
        vec![ConnectOptions::new("nats://b:4222").with_token("s3cret")]
    );
}

#[tokio::test]
async fn test_from_instance_rejects_non_string_setting() {
    let instance = InstanceConfig::new("nats").with_setting("url", 4222);
    let result = NatsConnector::from_instance(
        &instance,
        Arc::new(MemoryBroker::new()),
        Arc::new(RecordingHost::new()),
    );
    assert!(matches!(result, Err(ConnectorError::Config(_))));
}

#[tokio::test]
async fn test_publish_before_open_is_invalid() {
    let broker = MemoryBroker::new();
    let connector = connector(&broker, Arc::new(RecordingHost::new()));

    let result = connector.publish("x", Bytes::new()).await;

    assert_eq!(result, Err(ConnectorError::InvalidConnection));
}

#[tokio::test]
async fn test_publish_failure_is_reported() {
    let broker = MemoryBroker::new();
    let connector = connector(&broker, Arc::new(RecordingHost::new()));
    connector.open().await.unwrap();
    broker.refuse_publish(true);

    let result = connector.publish("x", Bytes::new()).await;

    assert!(matches!(
        result,
        Err(ConnectorError::Transport(TransportError::Publish(_)))
    ));
}

#[tokio::test]
async fn test_same_group_receives_each_event_once() {
    let broker = MemoryBroker::new();
    let host = Arc::new(RecordingHost::new());
    let first = connector(&broker, host.clone());
    let second = connector(&broker, host.clone());
    for connector in [&first, &second] {
        connector.register("tick", "workers").await;
        connector.open().await.unwrap();
        connector.start().await.unwrap();
    }

    for i in 0..100u32 {
        first
            .publish("tick", Bytes::from(i.to_string()))
            .await
            .unwrap();
    }

    let served = host.wait_for(100).await;
    assert_eq!(served.len(), 100);
    // Give any duplicate a chance to show up.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(host.count(), 100);
}

#[tokio::test]
async fn test_distinct_groups_each_receive() {
    let broker = MemoryBroker::new();
    let billing_host = Arc::new(RecordingHost::new());
    let audit_host = Arc::new(RecordingHost::new());
    let billing = connector(&broker, billing_host.clone());
    let audit = connector(&broker, audit_host.clone());
    billing.register("order_created", "billing").await;
    audit.register("order_created", "audit").await;
    for connector in [&billing, &audit] {
        connector.open().await.unwrap();
        connector.start().await.unwrap();
    }

    billing
        .publish("order_created", Bytes::from_static(b"1"))
        .await
        .unwrap();

    assert_eq!(billing_host.wait_for(1).await.len(), 1);
    assert_eq!(audit_host.wait_for(1).await.len(), 1);
}

#[tokio::test]
async fn test_stop_unsubscribes_and_start_resubscribes() {
    let broker = MemoryBroker::new();
    let connector = connector(&broker, Arc::new(RecordingHost::new()));
    connector.register("a", "g").await;
    connector.register("b", "g").await;
    connector.open().await.unwrap();
    connector.start().await.unwrap();

    assert_ok!(connector.stop().await);
    assert_eq!(broker.subscriber_count("a").await, 0);
    assert_eq!(broker.subscriber_count("b").await, 0);
    assert_eq!(connector.health().await.state, ConnectorState::Stopped);

    assert_ok!(connector.start().await);
    assert_eq!(broker.subscriber_count("a").await, 1);
    assert_eq!(broker.subscriber_count("b").await, 1);
}

#[tokio::test]
async fn test_failed_start_leaves_no_subscriptions() {
    let broker = MemoryBroker::new();
    let connector = connector(&broker, Arc::new(RecordingHost::new()));
    for name in ["a", "b", "c"] {
        connector.register(name, "g").await;
    }
    connector.open().await.unwrap();
    broker.fail_subscribes_after(1).await;

    assert!(connector.start().await.is_err());

    assert_eq!(connector.state().await, ConnectorState::Opened);
    for name in ["a", "b", "c"] {
        assert_eq!(broker.subscriber_count(name).await, 0);
    }
}

#[tokio::test]
async fn test_close_drops_subscriptions_and_session() {
    let broker = MemoryBroker::new();
    let connector = connector(&broker, Arc::new(RecordingHost::new()));
    connector.register("a", "g").await;
    connector.open().await.unwrap();
    connector.start().await.unwrap();

    connector.close().await;

    assert_eq!(broker.subscriber_count("a").await, 0);
    assert_eq!(connector.state().await, ConnectorState::Closed);
    assert_eq!(
        connector.publish("a", Bytes::new()).await,
        Err(ConnectorError::InvalidConnection)
    );
}
