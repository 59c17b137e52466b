//! Disconnect, reconnect and teardown behavior.

mod common;

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use common::*;
use futures_util::future;
use rtm_client::{
    transport::{mock::mock_connector, BackendDriver, Connector},
    Client, ClientError, ClientOptions, ConnectionError, DeliveryMode, RoleSecretAuthDelegate,
};
use serde_json::json;

#[tokio::test]
async fn reconnect_restores_the_subscription() {
    let (connector, mut servers) = mock_connector();
    let (events, mut rx) = events();
    let client = Client::with_connector(Arc::new(connector), fast_options());

    client.start().unwrap();
    let mut server = accept(&mut servers).await;

    client
        .subscribe(
            "ch",
            DeliveryMode::Reliable,
            Some(Box::new(SubObserver { tag: "s", events })),
            None,
        )
        .unwrap();

    let subscribe = next_request(&mut server).await;
    server.reply_ok(&subscribe, Some(json!({"position": "1:0"})));
    wait_for(&mut rx, "s:subscribed").await;

    server.send_subscription_data("ch", Some("2:0"), vec![json!("a")]);
    assert_eq!(next_event(&mut rx).await, r#"s:data:["a"]"#);

    // the transport dies; the supervisor reconnects and silently
    // re-subscribes from the last seen position
    server.drop_connection();
    let mut server = accept(&mut servers).await;

    let resubscribe = next_request(&mut server).await;
    assert_eq!(resubscribe.action, "rtm/subscribe");
    let body = resubscribe.body.as_ref().unwrap();
    assert_eq!(body.get("position"), Some(&json!("2:0")));
    server.reply_ok(&resubscribe, Some(json!({"position": "2:0"})));

    wait_for(&mut rx, "s:subscribed").await;
    server.send_subscription_data("ch", Some("3:0"), vec![json!("b")]);

    // the same observer instance sees "b" exactly once
    assert_eq!(next_event(&mut rx).await, r#"s:data:["b"]"#);

    client.dispose().await;
}

#[tokio::test]
async fn reconnect_replays_auth_before_subscriptions() {
    let (connector, mut servers) = mock_connector();
    let (events, mut rx) = events();
    let client = Client::with_connector(Arc::new(connector), fast_options());

    client.start().unwrap();
    let mut server = accept(&mut servers).await;

    let delegate = Arc::new(RoleSecretAuthDelegate::new("role", "sekret"));
    client.authenticate(delegate).unwrap();

    let handshake = next_request(&mut server).await;
    server.reply_ok(&handshake, Some(json!({"data": {"nonce": "one"}})));
    let authenticate = next_request(&mut server).await;
    server.reply_ok(&authenticate, Some(json!({})));

    client
        .subscribe(
            "ch",
            DeliveryMode::Simple,
            Some(Box::new(SubObserver { tag: "s", events })),
            None,
        )
        .unwrap();
    let subscribe = next_request(&mut server).await;
    server.reply_ok(&subscribe, Some(json!({})));
    wait_for(&mut rx, "s:subscribed").await;

    server.drop_connection();
    let mut server = accept(&mut servers).await;

    // the retained delegate is replayed first, with a fresh nonce
    let handshake = next_request(&mut server).await;
    assert_eq!(handshake.action, "auth/handshake");
    server.reply_ok(&handshake, Some(json!({"data": {"nonce": "two"}})));
    let authenticate = next_request(&mut server).await;
    assert_eq!(authenticate.action, "auth/authenticate");
    server.reply_ok(&authenticate, Some(json!({})));

    // only then are subscriptions restored
    let resubscribe = next_request(&mut server).await;
    assert_eq!(resubscribe.action, "rtm/subscribe");
    server.reply_ok(&resubscribe, Some(json!({})));
    wait_for(&mut rx, "s:subscribed").await;

    client.dispose().await;
}

/// Records attempt times and always refuses, so back-off is observable.
struct FailingConnector {
    attempts: Arc<Mutex<Vec<Instant>>>,
}

#[async_trait]
impl Connector for FailingConnector {
    async fn connect(&self) -> Result<BackendDriver, ConnectionError> {
        self.attempts.lock().unwrap().push(Instant::now());
        Err(ConnectionError::UnexpectedClose)
    }
}

#[tokio::test]
async fn backoff_doubles_and_the_threshold_stops_retrying() {
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let (events, mut rx) = events();
    let options = ClientOptions {
        reconnect_interval: Duration::from_millis(40),
        fail_count_threshold: Some(4),
        observer: Some(Box::new(StateObserver { events })),
        ..Default::default()
    };
    let client = Client::with_connector(
        Arc::new(FailingConnector { attempts: attempts.clone() }),
        options,
    );

    client.start().unwrap();
    wait_for(&mut rx, "stopped").await;

    let attempts = attempts.lock().unwrap();
    assert_eq!(attempts.len(), 4, "threshold bounds the attempt count");

    let gaps: Vec<Duration> =
        attempts.windows(2).map(|pair| pair[1].duration_since(pair[0])).collect();
    // nominal gaps are 80ms, 160ms, 320ms; allow generous scheduling slack
    // but insist each is at least as long as its predecessor
    assert!(gaps[0] >= Duration::from_millis(60), "first gap too short: {gaps:?}");
    assert!(gaps[1] >= gaps[0], "delays must not shrink: {gaps:?}");
    assert!(gaps[2] >= gaps[1], "delays must not shrink: {gaps:?}");
    assert!(gaps[2] >= Duration::from_millis(240), "third gap too short: {gaps:?}");
    drop(attempts);

    // a failed-out client is merely Stopped; it can be started again
    assert!(client.start().is_ok());
    client.dispose().await;
}

/// Accepts the connect but never resolves, pinning the event loop so the
/// queue can fill up.
struct StalledConnector;

#[async_trait]
impl Connector for StalledConnector {
    async fn connect(&self) -> Result<BackendDriver, ConnectionError> {
        future::pending().await
    }
}

#[tokio::test]
async fn queue_full_rejects_user_actions_but_not_signals() {
    let options = ClientOptions { max_queue_size: 2, ..Default::default() };
    let client = Client::with_connector(Arc::new(StalledConnector), options);

    client.start().unwrap();
    // give the loop a moment to enter the (stalled) connect
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.publish("ch", json!(1)).unwrap();
    client.publish("ch", json!(2)).unwrap();
    let err = client.publish("ch", json!(3)).unwrap_err();
    assert!(matches!(err, ClientError::QueueFull));

    // internal traffic is exempt from the bound: stop/dispose still enqueue
    client.stop().unwrap();
}

#[tokio::test]
async fn dispose_is_idempotent_and_concurrent() {
    let (connector, mut servers) = mock_connector();
    let client = Client::with_connector(Arc::new(connector), ClientOptions::default());

    client.start().unwrap();
    let _server = accept(&mut servers).await;

    let a = client.clone();
    let b = client.clone();
    tokio::join!(a.dispose(), b.dispose());
    client.dispose().await;

    assert!(matches!(client.publish("ch", json!(1)), Err(ClientError::Disposed)));
    assert!(matches!(client.start(), Err(ClientError::Disposed)));
}

#[tokio::test]
async fn stop_winds_the_connection_down() {
    let (connector, mut servers) = mock_connector();
    let (events, mut rx) = events();
    let options = ClientOptions {
        observer: Some(Box::new(StateObserver { events })),
        ..fast_options()
    };
    let client = Client::with_connector(Arc::new(connector), options);

    client.start().unwrap();
    wait_for(&mut rx, "connected").await;
    let mut server = accept(&mut servers).await;

    client.stop().unwrap();
    tokio::time::timeout(STEP, server.until_shutdown()).await.unwrap();

    // the backend going away completes the stop; no reconnect follows
    drop(server);
    wait_for(&mut rx, "stopped").await;

    client.dispose().await;
    wait_for(&mut rx, "disposed").await;
}
