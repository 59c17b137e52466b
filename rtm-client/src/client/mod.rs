//! The public, auto-recovering client handle.

mod action;
mod internal;
mod machine;
mod queue;

pub use machine::ClientState;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures_channel::{mpsc, oneshot};
use rtm_core::{
    auth::{AuthDelegate, AuthOutcome},
    codec::CodecKind,
    endpoint::Endpoint,
    types::{ErrorBody, Pdu, ReadOkBody},
};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use self::{
    action::Action,
    internal::{InternalClient, Shared},
    queue::{action_queue, ActionSender},
};
use crate::{
    error::{ClientError, ErrorReply},
    observer::{ClientObserver, SubscriptionObserver},
    subscription::DeliveryMode,
    transport::{ConnectionDetails, Connector, Proxy, WsConnector, DEFAULT_PING_INTERVAL},
};

/// Tuning knobs for [`Client`]. `Default` matches the hosted service's
/// expectations; most applications only ever set `observer`.
pub struct ClientOptions {
    /// Wire encoding, negotiated at construction.
    pub codec: CodecKind,
    /// Give up (drop to Stopped) after this many consecutive failed
    /// connect attempts. `None` retries forever.
    pub fail_count_threshold: Option<u32>,
    /// First reconnect back-off interval; doubles per failed attempt.
    pub reconnect_interval: Duration,
    /// Back-off cap.
    pub max_reconnect_interval: Duration,
    /// Replay successful authentications after a reconnect.
    pub restore_auth_on_reconnect: bool,
    /// Soft bound of the action queue; user actions beyond it fail with
    /// [`ClientError::QueueFull`].
    pub max_queue_size: usize,
    /// Pending-continuation count above which requests are throttled.
    pub pending_watermark: usize,
    /// Liveness ping cadence.
    pub ping_interval: Duration,
    /// Optional `(host, port)` HTTPS proxy.
    pub https_proxy: Option<Proxy>,
    /// Capacity of the offline queue holding user actions issued while
    /// disconnected; the oldest entries are dropped on overflow.
    pub offline_queue_size: usize,
    /// Patience per retained auth delegate during post-reconnect replay.
    pub auth_replay_timeout: Duration,
    /// Client state observer.
    pub observer: Option<Box<dyn ClientObserver>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            codec: CodecKind::default(),
            fail_count_threshold: None,
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(300),
            restore_auth_on_reconnect: true,
            max_queue_size: 20_000,
            pending_watermark: crate::connection::DEFAULT_PENDING_WATERMARK,
            ping_interval: DEFAULT_PING_INTERVAL,
            https_proxy: None,
            offline_queue_size: 1_000,
            auth_replay_timeout: Duration::from_secs(10),
            observer: None,
        }
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("codec", &self.codec)
            .field("fail_count_threshold", &self.fail_count_threshold)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("max_reconnect_interval", &self.max_reconnect_interval)
            .field("restore_auth_on_reconnect", &self.restore_auth_on_reconnect)
            .field("max_queue_size", &self.max_queue_size)
            .finish_non_exhaustive()
    }
}

/// A cloneable handle to one auto-recovering client.
///
/// Every method is a thin producer into the client's action queue; the
/// event-loop task owns all state and runs the observers. While the handle
/// is held and started, publishes, subscriptions, authentications and K/V
/// operations survive disconnects.
///
/// ```no_run
/// use rtm_client::{Client, DeliveryMode};
/// # async fn t() {
/// let client = Client::new("wss://rtm.example.com", "appkey").unwrap();
/// client.start().unwrap();
/// client.subscribe("greetings", DeliveryMode::Reliable, None, None).unwrap();
/// client.publish("greetings", serde_json::json!({"hello": "world"})).unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    actions: ActionSender,
    shared: Arc<Shared>,
    dispose_requested: Arc<AtomicBool>,
    loop_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Client {
    /// Validate the credentials and spawn the event loop. The client
    /// starts out Stopped; call [`Client::start`] to connect.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(endpoint: &str, appkey: &str) -> Result<Self, ClientError> {
        Self::with_options(endpoint, appkey, ClientOptions::default())
    }

    pub fn with_options(
        endpoint: &str,
        appkey: &str,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let endpoint = Endpoint::new(endpoint, appkey)?;
        let mut details = ConnectionDetails::new(endpoint, options.codec);
        details.proxy = options.https_proxy.clone();
        details.ping_interval = options.ping_interval;
        Ok(Self::with_connector(Arc::new(WsConnector::new(details)), options))
    }

    /// Run against a custom [`Connector`] — the seam tests use to swap in
    /// [`crate::transport::mock::MockConnector`].
    pub fn with_connector(connector: Arc<dyn Connector>, options: ClientOptions) -> Self {
        let (actions, receiver) = action_queue(options.max_queue_size);
        let shared = Arc::new(Shared::new());
        let internal = InternalClient::new(connector, options, actions.clone(), shared.clone());
        let loop_handle = internal.spawn(receiver);
        Self {
            actions,
            shared,
            dispose_requested: Arc::new(AtomicBool::new(false)),
            loop_handle: Arc::new(Mutex::new(Some(loop_handle))),
        }
    }

    fn ensure_live(&self) -> Result<(), ClientError> {
        if self.dispose_requested.load(Ordering::Acquire) {
            return Err(ClientError::Disposed);
        }
        Ok(())
    }

    // -- lifecycle ----------------------------------------------------------

    /// Begin connecting (and reconnecting, forever by default).
    pub fn start(&self) -> Result<(), ClientError> {
        self.ensure_live()?;
        self.actions.send(Action::Start)
    }

    /// Drop the connection and stay Stopped until the next `start`.
    /// Pending user actions are held in the offline queue meanwhile.
    pub fn stop(&self) -> Result<(), ClientError> {
        self.ensure_live()?;
        self.actions.send(Action::Stop)
    }

    /// Tear the client down for good. Idempotent and safe to call from
    /// several handles concurrently; actions enqueued before the dispose
    /// are still processed.
    pub async fn dispose(&self) {
        if !self.dispose_requested.swap(true, Ordering::AcqRel) {
            let _ = self.actions.send(Action::Dispose);
        }
        let handle = self.loop_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Whether the supervisor currently sits in Connected.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// The most recent failed connect attempt's error, if any.
    pub fn last_connecting_error(&self) -> Option<String> {
        self.shared.last_connecting_error.lock().unwrap().clone()
    }

    // -- pub/sub ------------------------------------------------------------

    /// Publish fire-and-forget. Queued offline while disconnected.
    pub fn publish(&self, channel: &str, message: Value) -> Result<(), ClientError> {
        self.ensure_live()?;
        self.actions.send(Action::Publish {
            channel: channel.to_string(),
            message,
            ack: None,
        })
    }

    /// Publish and wait for the acknowledgement; returns the stream
    /// position the message landed at, when the server reports one.
    pub async fn publish_ack(
        &self,
        channel: &str,
        message: Value,
        timeout: Duration,
    ) -> Result<Option<String>, ClientError> {
        self.ensure_live()?;
        let (ack, rx) = oneshot::channel();
        self.actions.send(Action::Publish {
            channel: channel.to_string(),
            message,
            ack: Some(ack),
        })?;
        let pdu = await_ack(rx, timeout).await?;
        Ok(pdu.position().map(str::to_string))
    }

    /// Subscribe `subscription_id` with the given delivery mode.
    ///
    /// If a subscription already exists under this id, the new observer and
    /// args are latched and applied through a full unsubscribe/subscribe
    /// cycle — no overlapping subscribes are ever sent.
    ///
    /// `args` may carry `filter`, `history`, `period` and `position`;
    /// `fast_forward` and `channel` are derived by the client and rejected
    /// here.
    pub fn subscribe(
        &self,
        subscription_id: &str,
        mode: DeliveryMode,
        observer: Option<Box<dyn SubscriptionObserver>>,
        args: Option<Map<String, Value>>,
    ) -> Result<(), ClientError> {
        self.ensure_live()?;
        if let Some(args) = &args {
            for reserved in ["fast_forward", "channel"] {
                if args.contains_key(reserved) {
                    return Err(ClientError::ReservedSubscribeArg(reserved));
                }
            }
        }
        self.actions.send(Action::Subscribe {
            id: subscription_id.to_string(),
            mode,
            observer,
            args,
        })
    }

    /// Unsubscribe; completion is visible through the subscription
    /// observer (`on_leave_subscribed`, then `on_deleted`).
    pub fn unsubscribe(&self, subscription_id: &str) -> Result<(), ClientError> {
        self.ensure_live()?;
        self.actions.send(Action::Unsubscribe { id: subscription_id.to_string() })
    }

    // -- key/value ----------------------------------------------------------

    pub fn read(&self, channel: &str) -> Result<(), ClientError> {
        self.ensure_live()?;
        self.actions.send(Action::Read { channel: channel.to_string(), args: None, ack: None })
    }

    /// Read the last written value; `Value::Null` when the channel is
    /// empty.
    pub async fn read_ack(&self, channel: &str, timeout: Duration) -> Result<Value, ClientError> {
        self.ensure_live()?;
        let (ack, rx) = oneshot::channel();
        self.actions.send(Action::Read {
            channel: channel.to_string(),
            args: None,
            ack: Some(ack),
        })?;
        let pdu = await_ack(rx, timeout).await?;
        let body: ReadOkBody = pdu
            .body
            .map(|body| serde_json::from_value(body))
            .transpose()
            .ok()
            .flatten()
            .unwrap_or(ReadOkBody { message: Value::Null, position: None });
        Ok(body.message)
    }

    pub fn write(&self, channel: &str, value: Value) -> Result<(), ClientError> {
        self.ensure_live()?;
        self.actions.send(Action::Write { channel: channel.to_string(), value, ack: None })
    }

    pub async fn write_ack(
        &self,
        channel: &str,
        value: Value,
        timeout: Duration,
    ) -> Result<Option<String>, ClientError> {
        self.ensure_live()?;
        let (ack, rx) = oneshot::channel();
        self.actions.send(Action::Write {
            channel: channel.to_string(),
            value,
            ack: Some(ack),
        })?;
        let pdu = await_ack(rx, timeout).await?;
        Ok(pdu.position().map(str::to_string))
    }

    pub fn delete(&self, channel: &str) -> Result<(), ClientError> {
        self.ensure_live()?;
        self.actions.send(Action::Delete { channel: channel.to_string(), ack: None })
    }

    pub async fn delete_ack(&self, channel: &str, timeout: Duration) -> Result<(), ClientError> {
        self.ensure_live()?;
        let (ack, rx) = oneshot::channel();
        self.actions.send(Action::Delete { channel: channel.to_string(), ack: Some(ack) })?;
        await_ack(rx, timeout).await?;
        Ok(())
    }

    // -- auth & misc --------------------------------------------------------

    /// Authenticate fire-and-forget; queued offline while disconnected.
    /// On success the delegate is retained and silently replayed after
    /// reconnects (unless `restore_auth_on_reconnect` is off).
    pub fn authenticate(&self, delegate: Arc<dyn AuthDelegate>) -> Result<(), ClientError> {
        self.ensure_live()?;
        self.actions.send(Action::Authenticate { delegate, ack: None })
    }

    /// Authenticate and wait for the outcome.
    pub async fn authenticate_ack(
        &self,
        delegate: Arc<dyn AuthDelegate>,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        self.ensure_live()?;
        let (ack, rx) = oneshot::channel();
        self.actions.send(Action::Authenticate { delegate, ack: Some(ack) })?;
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(ClientError::AckTimeout),
            Ok(Err(_)) => Err(ClientError::AckDropped),
            Ok(Ok(AuthOutcome::Done)) => Ok(()),
            Ok(Ok(AuthOutcome::Error(e))) => Err(ClientError::Auth(e)),
        }
    }

    /// Channel search. The returned stream yields every reply PDU: zero or
    /// more `rtm/search/data` followed by the closing `rtm/search/ok`.
    /// Requires a live connection.
    pub fn search(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<Pdu>, ClientError> {
        self.ensure_live()?;
        let (results, rx) = mpsc::unbounded();
        self.actions.send(Action::Search { prefix: prefix.to_string(), results })?;
        Ok(rx)
    }
}

/// The one generic wait-on-ack wrapper behind every `*_ack` method. A
/// timeout abandons the wait only; the request itself is never cancelled
/// and its effects may still happen.
async fn await_ack(rx: oneshot::Receiver<Pdu>, timeout: Duration) -> Result<Pdu, ClientError> {
    match tokio::time::timeout(timeout, rx).await {
        Err(_) => Err(ClientError::AckTimeout),
        Ok(Err(_)) => Err(ClientError::AckDropped),
        Ok(Ok(pdu)) => {
            if pdu.is_error_reply() {
                let body = pdu.error_body().unwrap_or(ErrorBody {
                    error: "unknown".to_string(),
                    reason: None,
                    subscription_id: None,
                });
                Err(ClientError::ErrorReply(ErrorReply {
                    action: pdu.action,
                    error: body.error,
                    reason: body.reason,
                }))
            } else {
                Ok(pdu)
            }
        }
    }
}
