//! The request/reply + event-stream primitive over one websocket.
//!
//! A [`Connection`] is only useful while its transport stays up: it owns
//! the request-id counter, the pending-continuation map and the auth
//! sub-state-machine, and routes every inbound PDU either to a continuation
//! (by id) or to its [`ConnectionDelegate`]. It performs no recovery — when
//! the transport dies, the owner drops the `Connection` (discarding pending
//! continuations) and builds a new one. The auto-reconnecting behavior
//! lives in [`crate::Client`].

mod auth;
pub(crate) use auth::AuthReply;
pub use auth::AuthCallback;

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures_channel::{mpsc, oneshot};
use rtm_core::{
    auth::{AuthDelegate, AuthError, AuthOutcome},
    types::{actions, ErrorBody, Pdu, SubscriptionData},
};
use serde_json::{json, Map, Value};
use tracing::{debug, error, trace};

use crate::{
    error::{ConnectionError, ProtocolViolation},
    transport::BackendDriver,
};

/// Default high-watermark of the pending-continuation map; above it,
/// continuation-bearing requests incur a short delay before being sent.
pub const DEFAULT_PENDING_WATERMARK: usize = 20_000;

const THROTTLE_DELAY: Duration = Duration::from_millis(1);

/// A reply callback. Invoked once per reply PDU; replies whose action ends
/// in `/data` keep the continuation registered for follow-ups.
pub type Continuation = Box<dyn FnMut(Pdu) + Send>;

/// Unsolicited traffic sink. The client supervisor implements this by
/// enqueueing internal actions; connection closure itself is signaled by
/// the backend's error channel rather than a callback.
pub trait ConnectionDelegate: Send {
    fn on_subscription_data(&mut self, data: SubscriptionData);
    fn on_subscription_error(&mut self, channel: &str, error: ErrorBody);
    fn on_fast_forward(&mut self, channel: &str);
    fn on_internal_error(&mut self, message: &str);
}

pub struct Connection {
    // PDUs to encode and put on the wire
    dispatcher: mpsc::UnboundedSender<Pdu>,
    shutdown: Option<oneshot::Sender<()>>,
    next_id: u64,
    pending: HashMap<u64, Continuation>,
    pending_watermark: usize,
    auth: auth::AuthFlow,
    delegate: Box<dyn ConnectionDelegate>,
}

impl Connection {
    /// Wrap a backend driver. Returns the connection plus the inbound PDU
    /// stream and the transport-error signal, which the owner must poll and
    /// feed back through [`Connection::route`].
    pub fn new(
        driver: BackendDriver,
        delegate: Box<dyn ConnectionDelegate>,
    ) -> (Self, mpsc::UnboundedReceiver<Pdu>, oneshot::Receiver<()>) {
        Self::with_watermark(driver, delegate, DEFAULT_PENDING_WATERMARK)
    }

    pub fn with_watermark(
        driver: BackendDriver,
        delegate: Box<dyn ConnectionDelegate>,
        pending_watermark: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Pdu>, oneshot::Receiver<()>) {
        let (to_handle, error, dispatcher, shutdown) = driver.into_parts();
        let conn = Self {
            dispatcher,
            shutdown: Some(shutdown),
            next_id: 0,
            pending: HashMap::new(),
            pending_watermark,
            auth: auth::AuthFlow::default(),
            delegate,
        };
        (conn, to_handle, error)
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn dispatch(&mut self, pdu: Pdu) -> Result<(), ConnectionError> {
        trace!(action = pdu.action, id = pdu.id, "dispatching request");
        self.dispatcher.unbounded_send(pdu).map_err(|_| ConnectionError::DeadChannel)
    }

    /// Send a PDU for an arbitrary `action`. The escape hatch every other
    /// operation is built on; useful for protocol additions the SDK does
    /// not know about yet.
    pub async fn action(
        &mut self,
        action: &str,
        body: Value,
        continuation: Option<Continuation>,
    ) -> Result<(), ConnectionError> {
        let mut pdu = Pdu::request(action, body);
        if let Some(continuation) = continuation {
            // throttle if waiting for many acks already
            if self.pending.len() >= self.pending_watermark {
                debug!(action, "throttling request");
                tokio::time::sleep(THROTTLE_DELAY).await;
            }
            let id = self.take_id();
            pdu.id = Some(id);
            self.pending.insert(id, continuation);
        }
        self.dispatch(pdu)
    }

    pub async fn publish(
        &mut self,
        channel: &str,
        message: Value,
        continuation: Option<Continuation>,
    ) -> Result<(), ConnectionError> {
        self.action(
            actions::PUBLISH,
            json!({ "channel": channel, "message": message }),
            continuation,
        )
        .await
    }

    /// Subscribe under `subscription_id`. When `args` carries a `filter`,
    /// the body identifies the subscription by `subscription_id`; otherwise
    /// the id is the channel name and travels as `channel`.
    pub async fn subscribe(
        &mut self,
        subscription_id: &str,
        args: Map<String, Value>,
        continuation: Option<Continuation>,
    ) -> Result<(), ConnectionError> {
        let key = if args.contains_key("filter") { "subscription_id" } else { "channel" };
        let mut body = args;
        body.insert(key.to_string(), Value::String(subscription_id.to_string()));
        self.action(actions::SUBSCRIBE, Value::Object(body), continuation).await
    }

    pub async fn unsubscribe(
        &mut self,
        subscription_id: &str,
        continuation: Option<Continuation>,
    ) -> Result<(), ConnectionError> {
        self.action(
            actions::UNSUBSCRIBE,
            json!({ "subscription_id": subscription_id }),
            continuation,
        )
        .await
    }

    pub async fn read(
        &mut self,
        channel: &str,
        args: Option<Map<String, Value>>,
        continuation: Option<Continuation>,
    ) -> Result<(), ConnectionError> {
        let mut body = args.unwrap_or_default();
        body.insert("channel".to_string(), Value::String(channel.to_string()));
        self.action(actions::READ, Value::Object(body), continuation).await
    }

    pub async fn write(
        &mut self,
        channel: &str,
        value: Value,
        continuation: Option<Continuation>,
    ) -> Result<(), ConnectionError> {
        self.action(actions::WRITE, json!({ "channel": channel, "message": value }), continuation)
            .await
    }

    pub async fn delete(
        &mut self,
        channel: &str,
        continuation: Option<Continuation>,
    ) -> Result<(), ConnectionError> {
        self.action(actions::DELETE, json!({ "channel": channel }), continuation).await
    }

    /// Channel search for a prefix. The server streams zero or more
    /// `rtm/search/data` PDUs before the closing `rtm/search/ok`; the
    /// continuation sees each of them.
    pub async fn search(
        &mut self,
        prefix: &str,
        continuation: Continuation,
    ) -> Result<(), ConnectionError> {
        self.action(actions::SEARCH, json!({ "prefix": prefix }), Some(continuation)).await
    }

    /// Start an authentication flow. Exactly one flow may be in flight per
    /// connection; an overlapping request fails fast through its callback.
    pub fn authenticate(
        &mut self,
        delegate: Arc<dyn AuthDelegate>,
        callback: AuthCallback,
    ) -> Result<(), ConnectionError> {
        if !self.auth.is_idle() {
            callback(AuthOutcome::Error(AuthError::AlreadyInProgress));
            return Ok(());
        }
        let body = json!({ "method": delegate.method(), "data": delegate.handshake_data() });
        let id = self.take_id();
        self.dispatch(Pdu::with_id(actions::AUTH_HANDSHAKE, id, body))?;
        self.auth.begin(delegate, callback);
        Ok(())
    }

    /// Route one inbound PDU.
    ///
    /// Continuations and delegate callbacks fire from inside this call. A
    /// returned violation means the connection must be abandoned; pending
    /// continuations are then discarded silently when it is dropped.
    pub fn route(&mut self, pdu: Pdu) -> Result<(), ProtocolViolation> {
        if pdu.action.is_empty() {
            return Err(ProtocolViolation::MissingAction);
        }

        match pdu.action.as_str() {
            actions::SUBSCRIPTION_DATA => {
                let data = parse_body::<SubscriptionData>(&pdu)?;
                self.delegate.on_subscription_data(data);
                return Ok(());
            }
            actions::SUBSCRIPTION_ERROR => {
                let body = parse_body::<ErrorBody>(&pdu)?;
                let channel = body.subscription_id.clone().unwrap_or_default();
                self.delegate.on_subscription_error(&channel, body);
                return Ok(());
            }
            actions::SUBSCRIPTION_INFO => {
                let body = pdu.body.as_ref().ok_or_else(|| missing_body(&pdu))?;
                if body.get("info").and_then(Value::as_str) == Some("fast_forward") {
                    let channel =
                        body.get("subscription_id").and_then(Value::as_str).unwrap_or_default();
                    self.delegate.on_fast_forward(channel);
                } else {
                    debug!(?body, "ignoring unknown subscription info");
                }
                return Ok(());
            }
            _ => {}
        }

        if pdu.body.is_none() && !pdu.may_omit_body() {
            return Err(missing_body(&pdu));
        }

        if pdu.action.starts_with("auth/") {
            self.route_auth(pdu);
            return Ok(());
        }

        match pdu.id.and_then(|id| self.pending.remove(&id).map(|cont| (id, cont))) {
            Some((id, mut continuation)) => {
                let keep = pdu.is_data();
                continuation(pdu);
                if keep {
                    self.pending.insert(id, continuation);
                }
                Ok(())
            }
            None => {
                if pdu.action == actions::GENERAL_ERROR {
                    return Err(ProtocolViolation::GeneralError {
                        payload: pdu.body.map(|b| b.to_string()).unwrap_or_default(),
                    });
                }
                trace!(action = pdu.action, id = pdu.id, "reply matches no continuation");
                Ok(())
            }
        }
    }

    fn route_auth(&mut self, pdu: Pdu) {
        let reply = AuthReply::from_pdu(&pdu);
        match self.auth.advance(reply) {
            auth::AuthStep::SendAuthenticate { method, credentials } => {
                let body = json!({ "method": method, "credentials": credentials });
                let id = self.take_id();
                if self.dispatch(Pdu::with_id(actions::AUTH_AUTHENTICATE, id, body)).is_err() {
                    self.auth.abort(AuthError::Rejected("connection lost".to_string()));
                }
            }
            auth::AuthStep::Settled => {}
            auth::AuthStep::Unexpected => {
                error!(action = pdu.action, "unexpected auth reply while not authenticating");
                self.delegate.on_internal_error(&format!(
                    "unexpected auth reply: {}",
                    pdu.action
                ));
            }
        }
    }

    /// Ask the backend to stop. Harmless if the transport is already gone.
    pub fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

fn missing_body(pdu: &Pdu) -> ProtocolViolation {
    ProtocolViolation::MissingBody { action: pdu.action.clone() }
}

fn parse_body<T: serde::de::DeserializeOwned>(pdu: &Pdu) -> Result<T, ProtocolViolation> {
    let body = pdu.body.clone().ok_or_else(|| missing_body(pdu))?;
    serde_json::from_value(body).map_err(|_| missing_body(pdu))
}
