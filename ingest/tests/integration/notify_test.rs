use std::time::Duration;

use ingest::bail;
use ingest::error::{ErrorKind, IngestResult};
use ingest::notify::{MAX_PAYLOAD_BYTES, NotificationBus, publish, publish_json};
use ingest::test_utils::database::spawn_database;
use ingest::test_utils::notify::{DEFAULT_TEST_TIMEOUT, within};
use ingest::transaction::ScopedTransaction;
use ingest_config::shared::NotificationConfig;
use ingest_telemetry::tracing::init_test_tracing;
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct AssetChanged {
    id: i64,
    status: String,
}

#[tokio::test(flavor = "multi_thread")]
async fn notifications_arrive_in_publish_order() {
    init_test_tracing();
    let database = spawn_database().await;
    let pool = database.open_pool(1).await;
    let bus = NotificationBus::connect(&database.config, NotificationConfig::default())
        .await
        .unwrap();

    let mut subscription = bus.subscribe("asset_changes").await.unwrap();
    assert_eq!(subscription.channel(), "asset_changes");

    let conn = pool.acquire_default().await.unwrap();
    for i in 0..100 {
        publish(conn.client(), "asset_changes", &i.to_string())
            .await
            .unwrap();
    }
    conn.release();

    let mut last_sequence = 0;
    for i in 0..100 {
        let event = within(DEFAULT_TEST_TIMEOUT, subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.channel, "asset_changes");
        assert_eq!(event.payload, i.to_string());
        assert!(event.sequence > last_sequence);
        last_sequence = event.sequence;
    }

    bus.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn every_subscriber_of_a_channel_gets_each_event() {
    init_test_tracing();
    let database = spawn_database().await;
    let bus = NotificationBus::connect(&database.config, NotificationConfig::default())
        .await
        .unwrap();

    let mut first = bus.subscribe("sites").await.unwrap();
    let mut second = bus.subscribe("sites").await.unwrap();
    let mut other = bus.subscribe("assets").await.unwrap();
    assert_eq!(bus.subscriber_count("sites"), 2);

    bus.publish("sites", "north").await.unwrap();
    bus.publish("assets", "SN-00000001").await.unwrap();

    for subscription in [&mut first, &mut second] {
        let event = within(DEFAULT_TEST_TIMEOUT, subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload, "north");
    }
    let event = within(DEFAULT_TEST_TIMEOUT, other.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.channel, "assets");
    assert_eq!(event.payload, "SN-00000001");

    drop(second);
    assert_eq!(bus.subscriber_count("sites"), 1);

    bus.publish("sites", "south").await.unwrap();
    let event = within(DEFAULT_TEST_TIMEOUT, first.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.payload, "south");

    bus.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn notifications_follow_transaction_outcome() {
    init_test_tracing();
    let database = spawn_database().await;
    let pool = database.open_pool(1).await;
    let bus = NotificationBus::connect(&database.config, NotificationConfig::default())
        .await
        .unwrap();
    let mut subscription = bus.subscribe("asset_changes").await.unwrap();

    let mut conn = pool.acquire_default().await.unwrap();
    let rolled_back: IngestResult<()> = ScopedTransaction::run(&mut conn, async |tx| {
        publish(tx, "asset_changes", "rolled back").await?;
        bail!(ErrorKind::InvalidData, "Abort the transaction");
    })
    .await;
    assert!(rolled_back.is_err());

    let change = AssetChanged {
        id: 7,
        status: "retired".into(),
    };
    ScopedTransaction::run(&mut conn, async |tx| {
        publish_json(tx, "asset_changes", &change).await?;
        Ok(())
    })
    .await
    .unwrap();
    conn.release();

    let event = within(DEFAULT_TEST_TIMEOUT, subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.payload_json::<AssetChanged>().unwrap(), change);

    bus.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_payloads_are_rejected() {
    init_test_tracing();
    let database = spawn_database().await;
    let bus = NotificationBus::connect(&database.config, NotificationConfig::default())
        .await
        .unwrap();
    let mut subscription = bus.subscribe("payloads").await.unwrap();

    let err = bus
        .publish("payloads", &"x".repeat(MAX_PAYLOAD_BYTES))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);

    let largest = "x".repeat(MAX_PAYLOAD_BYTES - 1);
    bus.publish("payloads", &largest).await.unwrap();
    let event = within(DEFAULT_TEST_TIMEOUT, subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.payload.len(), MAX_PAYLOAD_BYTES - 1);

    let err = bus.subscribe("").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);

    bus.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_subscriber_is_ended_without_affecting_others() {
    init_test_tracing();
    let database = spawn_database().await;
    let config = NotificationConfig {
        queue_capacity: 4,
        max_block_ms: 200,
    };
    let bus = NotificationBus::connect(&database.config, config)
        .await
        .unwrap();

    let mut slow = bus.subscribe("readings").await.unwrap();
    let mut fast = bus.subscribe("readings").await.unwrap();

    let reader = tokio::spawn(async move {
        let mut payloads = Vec::new();
        while payloads.len() < 20 {
            match fast.recv().await {
                Some(Ok(event)) => payloads.push(event.payload),
                other => panic!("fast subscriber ended early: {other:?}"),
            }
        }
        payloads
    });

    for i in 0..20 {
        bus.publish("readings", &i.to_string()).await.unwrap();
    }

    let payloads = within(DEFAULT_TEST_TIMEOUT, reader).await.unwrap();
    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(payloads, expected);

    // Give the slow subscriber's queue time to stay full past the block limit.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut received = 0;
    let terminal = loop {
        match within(DEFAULT_TEST_TIMEOUT, slow.recv()).await {
            Some(Ok(_)) => received += 1,
            Some(Err(err)) => break err,
            None => panic!("slow subscriber ended without an error"),
        }
    };
    assert_eq!(received, 4);
    assert_eq!(terminal.kind(), ErrorKind::SubscriberOverflow);
    assert!(slow.recv().await.is_none());

    bus.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn full_queue_holds_back_delivery_without_buffering() {
    init_test_tracing();
    let database = spawn_database().await;
    let pool = database.open_pool(1).await;
    let config = NotificationConfig {
        queue_capacity: 2,
        max_block_ms: 30_000,
    };
    let bus = NotificationBus::connect(&database.config, config)
        .await
        .unwrap();
    let mut subscription = bus.subscribe("readings").await.unwrap();

    let conn = pool.acquire_default().await.unwrap();
    for i in 0..500 {
        publish(conn.client(), "readings", &i.to_string())
            .await
            .unwrap();
    }
    conn.release();

    // Nothing reads for a while; the rest stays with the server.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(subscription.pending(), 2);

    for i in 0..500 {
        let event = within(DEFAULT_TEST_TIMEOUT, subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload, i.to_string());
        assert!(subscription.pending() <= 2);
    }

    bus.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_the_bus_ends_subscriptions() {
    init_test_tracing();
    let database = spawn_database().await;
    let bus = NotificationBus::connect(&database.config, NotificationConfig::default())
        .await
        .unwrap();
    let mut subscription = bus.subscribe("sites").await.unwrap();

    bus.publish("sites", "before close").await.unwrap();
    let event = within(DEFAULT_TEST_TIMEOUT, subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.payload, "before close");

    bus.close().await;
    assert!(bus.is_closed());
    assert!(within(DEFAULT_TEST_TIMEOUT, subscription.recv()).await.is_none());

    let err = bus.subscribe("sites").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = bus.publish("sites", "after close").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_listening_connection_ends_subscriptions_with_error() {
    init_test_tracing();
    let database = spawn_database().await;
    let pool = database.open_pool(1).await;
    let bus = NotificationBus::connect(&database.config, NotificationConfig::default())
        .await
        .unwrap();
    let mut subscription = bus.subscribe("sites").await.unwrap();

    // A notification sent by the bus itself reveals its backend pid.
    bus.publish("sites", "whoami").await.unwrap();
    let event = within(DEFAULT_TEST_TIMEOUT, subscription.recv())
        .await
        .unwrap()
        .unwrap();

    let conn = pool.acquire_default().await.unwrap();
    conn.client()
        .execute("select pg_terminate_backend($1)", &[&event.process_id])
        .await
        .unwrap();
    conn.release();

    let err = within(DEFAULT_TEST_TIMEOUT, subscription.recv())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    assert!(subscription.recv().await.is_none());

    let err = bus.subscribe("sites").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
}
