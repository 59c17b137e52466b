//! Shared plumbing for the integration tests: event-collecting observers
//! and timeout-wrapped helpers around the mock transport.
#![allow(dead_code)]

use std::time::Duration;

use futures_channel::mpsc;
use futures_util::StreamExt;
use rtm_client::{
    transport::mock::MockServer, ClientObserver, ClientOptions, ErrorBody, Pdu,
    SubscriptionData, SubscriptionObserver,
};

pub const STEP: Duration = Duration::from_secs(2);

/// Options tuned so reconnect tests finish in milliseconds.
pub fn fast_options() -> ClientOptions {
    ClientOptions {
        reconnect_interval: Duration::from_millis(20),
        max_reconnect_interval: Duration::from_secs(2),
        auth_replay_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

#[derive(Clone)]
pub struct Events {
    tx: mpsc::UnboundedSender<String>,
}

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        let _ = self.tx.unbounded_send(event.into());
    }
}

pub fn events() -> (Events, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded();
    (Events { tx }, rx)
}

/// Waits for the next recorded event, failing the test after [`STEP`].
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(STEP, rx.next())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream ended")
}

/// Skips events until `needle` shows up.
pub async fn wait_for(rx: &mut mpsc::UnboundedReceiver<String>, needle: &str) {
    loop {
        let event = next_event(rx).await;
        if event == needle {
            return;
        }
    }
}

pub async fn accept(servers: &mut mpsc::UnboundedReceiver<MockServer>) -> MockServer {
    tokio::time::timeout(STEP, servers.next())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

pub async fn next_request(server: &mut MockServer) -> Pdu {
    tokio::time::timeout(STEP, server.next_request())
        .await
        .expect("timed out waiting for a request")
        .expect("client hung up")
}

/// A subscription observer that records everything it sees.
pub struct SubObserver {
    pub tag: &'static str,
    pub events: Events,
}

impl SubscriptionObserver for SubObserver {
    fn on_created(&mut self) {
        self.events.push(format!("{}:created", self.tag));
    }
    fn on_deleted(&mut self) {
        self.events.push(format!("{}:deleted", self.tag));
    }
    fn on_enter_subscribed(&mut self) {
        self.events.push(format!("{}:subscribed", self.tag));
    }
    fn on_enter_failed(&mut self, reason: &str) {
        self.events.push(format!("{}:failed:{reason}", self.tag));
    }
    fn on_subscription_data(&mut self, data: &SubscriptionData) {
        let messages = serde_json::to_string(&data.messages).unwrap();
        self.events.push(format!("{}:data:{messages}", self.tag));
    }
    fn on_subscription_error(&mut self, error: &ErrorBody) {
        self.events.push(format!("{}:error:{}", self.tag, error.error));
    }
}

/// A client observer that records supervisor state changes.
pub struct StateObserver {
    pub events: Events,
}

impl ClientObserver for StateObserver {
    fn on_enter_connecting(&mut self) {
        self.events.push("connecting");
    }
    fn on_enter_connected(&mut self) {
        self.events.push("connected");
    }
    fn on_enter_awaiting(&mut self) {
        self.events.push("awaiting");
    }
    fn on_enter_stopped(&mut self) {
        self.events.push("stopped");
    }
    fn on_enter_disposed(&mut self) {
        self.events.push("disposed");
    }
    fn on_fast_forward(&mut self, channel: &str) {
        self.events.push(format!("fast_forward:{channel}"));
    }
    fn on_internal_error(&mut self, payload: &str) {
        self.events.push(format!("internal_error:{payload}"));
    }
}
