//! Mock transport used in test environments.
//!
//! [`MockConnector`] satisfies the [`Connector`] seam with channel-backed
//! backends: every connect attempt produces a [`MockServer`] through which a
//! test plays the service — inspecting dispatched PDUs, answering them, and
//! dropping the "socket" to exercise reconnect paths.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures_channel::mpsc;
use futures_util::StreamExt;
use rtm_core::types::{actions, Pdu};
use serde_json::{json, Value};

use super::{BackendDriver, Connector};
use crate::{error::ConnectionError, transport::backend::BackendPeer};

/// Build a connector plus the stream of server handles it will produce, one
/// per connect attempt.
pub fn mock_connector() -> (MockConnector, mpsc::UnboundedReceiver<MockServer>) {
    let (servers, rx) = mpsc::unbounded();
    (MockConnector { servers, fail_next: Arc::new(AtomicUsize::new(0)) }, rx)
}

/// A scripted stand-in for the websocket connector.
#[derive(Clone)]
pub struct MockConnector {
    servers: mpsc::UnboundedSender<MockServer>,
    fail_next: Arc<AtomicUsize>,
}

impl MockConnector {
    /// Make the next `n` connect attempts fail before one succeeds.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<BackendDriver, ConnectionError> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ConnectionError::UnexpectedClose);
        }
        let (driver, peer) = BackendDriver::pair();
        let server = MockServer { peer: Some(peer) };
        self.servers.unbounded_send(server).map_err(|_| ConnectionError::DeadChannel)?;
        Ok(driver)
    }
}

/// One accepted "connection", seen from the server's side.
pub struct MockServer {
    peer: Option<BackendPeer>,
}

impl MockServer {
    fn peer(&self) -> &BackendPeer {
        self.peer.as_ref().expect("mock connection already dropped")
    }

    fn peer_mut(&mut self) -> &mut BackendPeer {
        self.peer.as_mut().expect("mock connection already dropped")
    }

    /// The next PDU the client dispatched, in order.
    pub async fn next_request(&mut self) -> Option<Pdu> {
        self.peer_mut().outbound.next().await
    }

    /// Push an unsolicited PDU at the client.
    pub fn send(&self, pdu: Pdu) {
        let _ = self.peer().inbound.unbounded_send(pdu);
    }

    /// Acknowledge `request` positively, echoing its id.
    pub fn reply_ok(&self, request: &Pdu, body: Option<Value>) {
        self.send(Pdu { action: actions::ok(&request.action), id: request.id, body });
    }

    /// Acknowledge `request` negatively, echoing its id.
    pub fn reply_error(&self, request: &Pdu, error: &str, reason: &str) {
        self.send(Pdu {
            action: actions::error(&request.action),
            id: request.id,
            body: Some(json!({ "error": error, "reason": reason })),
        });
    }

    /// Deliver channel data to a subscription.
    pub fn send_subscription_data(
        &self,
        subscription_id: &str,
        position: Option<&str>,
        messages: Vec<Value>,
    ) {
        let mut body = json!({
            "subscription_id": subscription_id,
            "messages": messages,
        });
        if let Some(position) = position {
            body["position"] = json!(position);
        }
        self.send(Pdu::request(actions::SUBSCRIPTION_DATA, body));
    }

    /// Deliver an unsolicited channel error.
    pub fn send_subscription_error(&self, subscription_id: &str, error: &str, reason: &str) {
        self.send(Pdu::request(
            actions::SUBSCRIPTION_ERROR,
            json!({ "subscription_id": subscription_id, "error": error, "reason": reason }),
        ));
    }

    /// Deliver a fast-forward notice for a subscription.
    pub fn send_fast_forward(&self, subscription_id: &str) {
        self.send(Pdu::request(
            actions::SUBSCRIPTION_INFO,
            json!({ "subscription_id": subscription_id, "info": "fast_forward" }),
        ));
    }

    /// Simulate a terminal transport failure.
    pub fn drop_connection(&mut self) {
        if let Some(peer) = self.peer.take() {
            let _ = peer.error.send(());
        }
    }

    /// Resolves when the client winds this connection down intentionally
    /// (or abandons it entirely).
    pub async fn until_shutdown(&mut self) {
        let _ = (&mut self.peer_mut().shutdown).await;
    }
}
