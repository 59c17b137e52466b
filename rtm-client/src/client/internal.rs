//! The event-loop task behind the [`Client`](super::Client) facade.
//!
//! One task owns everything mutable: the supervisor state, the current
//! connection, the subscription map and the offline queue. It pops exactly
//! one work item at a time — an inbound PDU, a transport error, or a queued
//! action — so the whole client is logically single-threaded and every
//! observer callback runs here.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use futures_channel::{mpsc, oneshot};
use futures_util::{select_biased, StreamExt};
use rtm_core::{
    auth::{AuthDelegate, AuthOutcome},
    types::{ErrorBody, Pdu, SubscriptionData},
};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::{
    action::{AckSender, Action},
    machine::{self, ClientEffect, ClientEvent, ClientGuards, ClientState},
    queue::{ActionReceiver, ActionSender},
    ClientOptions,
};
use crate::{
    connection::{Connection, ConnectionDelegate, Continuation},
    observer::{ClientObserver, SubscriptionObserver},
    subscription::{DeliveryMode, Request, Subscription},
    transport::Connector,
};

/// Shared pieces the facade reads without going through the queue.
pub(crate) struct Shared {
    pub connected: AtomicBool,
    pub last_connecting_error: Mutex<Option<String>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self { connected: AtomicBool::new(false), last_connecting_error: Mutex::new(None) }
    }
}

/// Pending auth replay after a reconnect.
struct AuthReplay {
    remaining: VecDeque<Arc<dyn AuthDelegate>>,
}

enum Work {
    Inbound(Option<Pdu>),
    ConnError,
    Action(Option<Action>),
}

/// Posts unsolicited connection traffic into the action queue. Closure of
/// the connection itself is signaled through the backend's error channel.
struct QueueDelegate {
    tx: ActionSender,
}

impl ConnectionDelegate for QueueDelegate {
    fn on_subscription_data(&mut self, data: SubscriptionData) {
        self.tx.send_internal(Action::ChannelData { data });
    }

    fn on_subscription_error(&mut self, channel: &str, error: ErrorBody) {
        self.tx.send_internal(Action::ChannelError { channel: channel.to_string(), body: error });
    }

    fn on_fast_forward(&mut self, channel: &str) {
        self.tx.send_internal(Action::FastForward { channel: channel.to_string() });
    }

    fn on_internal_error(&mut self, message: &str) {
        self.tx.send_internal(Action::InternalError { message: message.to_string() });
    }
}

pub(crate) struct InternalClient {
    connector: Arc<dyn Connector>,
    options: ClientOptions,
    queue_tx: ActionSender,
    shared: Arc<Shared>,

    state: ClientState,
    fail_count: u32,
    last_attempt: Option<Instant>,
    reconnect_timer: Option<JoinHandle<()>>,

    connection: Option<Connection>,
    inbound: Option<mpsc::UnboundedReceiver<Pdu>>,
    conn_error: Option<oneshot::Receiver<()>>,

    subscriptions: HashMap<String, Subscription>,
    observer: Option<Box<dyn ClientObserver>>,

    offline: VecDeque<Action>,
    auth_delegates: Vec<Arc<dyn AuthDelegate>>,
    replay: Option<AuthReplay>,
    replay_generation: u64,

    done: bool,
}

impl InternalClient {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        mut options: ClientOptions,
        queue_tx: ActionSender,
        shared: Arc<Shared>,
    ) -> Self {
        let observer = options.observer.take();
        Self {
            connector,
            options,
            queue_tx,
            shared,
            state: ClientState::Stopped,
            fail_count: 0,
            last_attempt: None,
            reconnect_timer: None,
            connection: None,
            inbound: None,
            conn_error: None,
            subscriptions: HashMap::new(),
            observer,
            offline: VecDeque::new(),
            auth_delegates: Vec::new(),
            replay: None,
            replay_generation: 0,
            done: false,
        }
    }

    pub(crate) fn spawn(mut self, mut actions: ActionReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let work = match (self.inbound.as_mut(), self.conn_error.as_mut()) {
                    (Some(inbound), Some(mut conn_error)) => {
                        // handle transport traffic before new user actions
                        select_biased! {
                            pdu = inbound.next() => Work::Inbound(pdu),
                            _ = conn_error => Work::ConnError,
                            action = actions.next() => Work::Action(action),
                        }
                    }
                    _ => Work::Action(actions.next().await),
                };

                match work {
                    Work::Inbound(Some(pdu)) => self.handle_inbound(pdu).await,
                    Work::Inbound(None) | Work::ConnError => {
                        debug!("transport reported closure");
                        self.advance(ClientEvent::ConnectionClosed).await;
                    }
                    Work::Action(Some(action)) => self.handle_action(action).await,
                    // every handle is gone; nothing can reach us anymore
                    Work::Action(None) => self.advance(ClientEvent::Dispose).await,
                }

                if self.done {
                    break;
                }
            }
            debug!("event loop finished");
        })
    }

    fn guards(&self) -> ClientGuards {
        let attempts_left = match self.options.fail_count_threshold {
            Some(threshold) => self.fail_count + 1 < threshold,
            None => true,
        };
        ClientGuards { attempts_left }
    }

    fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    // -- supervisor ---------------------------------------------------------

    async fn advance(&mut self, event: ClientEvent) {
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            let (next, effects) = machine::step(self.state, event, self.guards());
            trace!(from = ?self.state, to = ?next, ?event, "supervisor transition");

            let from = self.state;
            if next != from {
                self.fire_leave(from);
                self.state = next;
                self.fire_enter(next);
            }

            for effect in effects {
                match effect {
                    ClientEffect::Connect => {
                        let followup = self.do_connect().await;
                        events.push_back(followup);
                    }
                    ClientEffect::ForgetConnection => self.forget_connection(),
                    ClientEffect::StartDisconnect => {
                        if let Some(connection) = &mut self.connection {
                            connection.shutdown();
                        }
                    }
                    ClientEffect::ScheduleReconnect => self.schedule_reconnect(),
                    ClientEffect::CancelReconnect => self.cancel_reconnect(),
                    ClientEffect::ResetFailCount => self.fail_count = 0,
                    ClientEffect::IncrementFailCount => self.fail_count += 1,
                    ClientEffect::EnterConnected => self.begin_connected_entry().await,
                    ClientEffect::ExitLoop => self.done = true,
                }
            }
        }
    }

    async fn do_connect(&mut self) -> ClientEvent {
        self.last_attempt = Some(Instant::now());
        match self.connector.connect().await {
            Ok(driver) => {
                let delegate = Box::new(QueueDelegate { tx: self.queue_tx.clone() });
                let (connection, inbound, conn_error) =
                    Connection::with_watermark(driver, delegate, self.options.pending_watermark);
                self.connection = Some(connection);
                self.inbound = Some(inbound);
                self.conn_error = Some(conn_error);
                *self.shared.last_connecting_error.lock().unwrap() = None;
                ClientEvent::ConnectingComplete
            }
            Err(e) => {
                error!(err = %e, "connect attempt failed");
                *self.shared.last_connecting_error.lock().unwrap() = Some(e.to_string());
                ClientEvent::ConnectingFailed
            }
        }
    }

    /// Abandon the connection. Pending continuations die with it; the
    /// subscriptions fall back to Unsubscribed without sending anything.
    fn forget_connection(&mut self) {
        self.replay = None;
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown();
        }
        self.inbound = None;
        self.conn_error = None;

        let ids: Vec<String> = self.subscriptions.keys().cloned().collect();
        for id in ids {
            if let Some(subscription) = self.subscriptions.get_mut(&id) {
                subscription.disconnect();
            }
            self.reap(&id);
        }
    }

    fn schedule_reconnect(&mut self) {
        self.cancel_reconnect();

        let full = machine::backoff(
            self.options.reconnect_interval,
            self.options.max_reconnect_interval,
            self.fail_count,
        );
        let elapsed =
            self.last_attempt.map(|at| at.elapsed()).unwrap_or_default();
        let delay = full.saturating_sub(elapsed);
        warn!(?delay, fail_count = self.fail_count, "reconnecting after back-off");

        let tx = self.queue_tx.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tx.send_internal(Action::Tick);
        }));
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    // -- Connected entry ----------------------------------------------------

    async fn begin_connected_entry(&mut self) {
        if self.options.restore_auth_on_reconnect && !self.auth_delegates.is_empty() {
            debug!(count = self.auth_delegates.len(), "restoring authentications");
            self.replay = Some(AuthReplay {
                remaining: self.auth_delegates.iter().cloned().collect(),
            });
            self.kick_replay();
        } else {
            self.finish_connected_entry().await;
        }
    }

    /// Start authenticating the front of the replay queue; each step gets
    /// its own generation so stale deadline ticks are ignored.
    fn kick_replay(&mut self) {
        self.replay_generation += 1;
        let generation = self.replay_generation;

        let Some(delegate) = self.replay.as_ref().and_then(|r| r.remaining.front().cloned())
        else {
            return;
        };

        if let Some(connection) = &mut self.connection {
            let tx = self.queue_tx.clone();
            let callback: crate::connection::AuthCallback = Box::new(move |outcome| {
                tx.send_internal(Action::AuthReplayOutcome { generation, outcome });
            });
            // a send failure here means the transport is already dying; its
            // error channel will wake us
            let _ = connection.authenticate(delegate, callback);
        }

        let tx = self.queue_tx.clone();
        let deadline = self.options.auth_replay_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            tx.send_internal(Action::AuthReplayOutcome {
                generation,
                outcome: AuthOutcome::Error(rtm_core::auth::AuthError::TimedOut),
            });
        });
    }

    async fn handle_replay_outcome(&mut self, generation: u64, outcome: AuthOutcome) {
        if self.replay.is_none() || generation != self.replay_generation {
            trace!(generation, "ignoring stale auth replay outcome");
            return;
        }
        match outcome {
            AuthOutcome::Done => {
                let finished = match self.replay.as_mut() {
                    Some(replay) => {
                        replay.remaining.pop_front();
                        replay.remaining.is_empty()
                    }
                    None => return,
                };
                if finished {
                    self.replay = None;
                    self.finish_connected_entry().await;
                } else {
                    self.kick_replay();
                }
            }
            AuthOutcome::Error(e) => {
                error!(err = %e, "failed to restore authentication; reconnecting");
                self.replay = None;
                if let Some(connection) = &mut self.connection {
                    connection.shutdown();
                }
                self.advance(ClientEvent::ConnectionClosed).await;
            }
        }
    }

    async fn finish_connected_entry(&mut self) {
        let ids: Vec<String> = self.subscriptions.keys().cloned().collect();
        for id in ids {
            let requests = match self.subscriptions.get_mut(&id) {
                Some(subscription) => subscription.connect(),
                None => continue,
            };
            self.dispatch_requests(&id, requests).await;
        }

        debug!(count = self.offline.len(), "draining offline queue");
        while let Some(action) = self.offline.pop_front() {
            self.queue_tx.send_internal(action);
        }
    }

    // -- inbound ------------------------------------------------------------

    async fn handle_inbound(&mut self, pdu: Pdu) {
        let Some(connection) = &mut self.connection else { return };
        if let Err(violation) = connection.route(pdu) {
            error!(err = %violation, "protocol violation; abandoning connection");
            self.fire_internal_error(&violation.to_string());
            if let Some(connection) = &mut self.connection {
                connection.shutdown();
            }
            self.advance(ClientEvent::ConnectionClosed).await;
        }
    }

    // -- actions ------------------------------------------------------------

    async fn handle_action(&mut self, action: Action) {
        trace!(action = action.name(), "handling action");
        match action {
            Action::Start => self.advance(ClientEvent::Start).await,
            Action::Stop => self.advance(ClientEvent::Stop).await,
            Action::Dispose => self.advance(ClientEvent::Dispose).await,
            Action::Tick => self.advance(ClientEvent::Tick).await,

            Action::Publish { channel, message, ack } => {
                if self.is_connected() {
                    let continuation = ack.map(ack_continuation);
                    if let Some(connection) = &mut self.connection {
                        let _ = connection.publish(&channel, message, continuation).await;
                    }
                } else {
                    self.push_offline(Action::Publish { channel, message, ack });
                }
            }
            Action::Read { channel, args, ack } => {
                if self.is_connected() {
                    let continuation = ack.map(ack_continuation);
                    if let Some(connection) = &mut self.connection {
                        let _ = connection.read(&channel, args, continuation).await;
                    }
                } else {
                    self.push_offline(Action::Read { channel, args, ack });
                }
            }
            Action::Write { channel, value, ack } => {
                if self.is_connected() {
                    let continuation = ack.map(ack_continuation);
                    if let Some(connection) = &mut self.connection {
                        let _ = connection.write(&channel, value, continuation).await;
                    }
                } else {
                    self.push_offline(Action::Write { channel, value, ack });
                }
            }
            Action::Delete { channel, ack } => {
                if self.is_connected() {
                    let continuation = ack.map(ack_continuation);
                    if let Some(connection) = &mut self.connection {
                        let _ = connection.delete(&channel, continuation).await;
                    }
                } else {
                    self.push_offline(Action::Delete { channel, ack });
                }
            }
            Action::Authenticate { delegate, ack } => {
                if self.is_connected() {
                    self.start_authentication(delegate, ack);
                } else {
                    self.push_offline(Action::Authenticate { delegate, ack });
                }
            }
            Action::Search { prefix, results } => {
                if self.is_connected() {
                    if let Some(connection) = &mut self.connection {
                        let continuation: Continuation = Box::new(move |pdu| {
                            let _ = results.unbounded_send(pdu);
                        });
                        let _ = connection.search(&prefix, continuation).await;
                    }
                } else {
                    self.fire_internal_error("search requires a connection");
                }
            }

            Action::Subscribe { id, mode, observer, args } => {
                self.do_subscribe(id, mode, observer, args).await;
            }
            Action::Unsubscribe { id } => {
                let requests = match self.subscriptions.get_mut(&id) {
                    Some(subscription) => subscription.unsubscribe(),
                    None => {
                        error!(id, "trying to unsubscribe from an unknown channel");
                        return;
                    }
                };
                self.reap(&id);
                self.dispatch_requests(&id, requests).await;
            }

            Action::ChannelData { data } => match self.subscriptions.get_mut(&data.subscription_id)
            {
                Some(subscription) => subscription.on_subscription_data(&data),
                None => error!(id = data.subscription_id, "data for an unknown subscription"),
            },
            Action::ChannelError { channel, body } => {
                error!(channel, error = body.error, "channel error");
                let requests = match self.subscriptions.get_mut(&channel) {
                    Some(subscription) => subscription.on_channel_error(&body),
                    None => return,
                };
                self.reap(&channel);
                self.dispatch_requests(&channel, requests).await;
            }
            Action::FastForward { channel } => {
                if let Some(observer) = &mut self.observer {
                    observer.on_fast_forward(&channel);
                }
            }
            Action::InternalError { message } => self.fire_internal_error(&message),

            Action::SubscribeAck { id, pdu } => self.handle_subscribe_ack(id, pdu).await,
            Action::UnsubscribeAck { id, pdu } => self.handle_unsubscribe_ack(id, pdu).await,
            Action::AuthResult { delegate, outcome, ack } => {
                if outcome == AuthOutcome::Done
                    && !self.auth_delegates.iter().any(|known| Arc::ptr_eq(known, &delegate))
                {
                    self.auth_delegates.push(delegate);
                }
                if let Some(ack) = ack {
                    let _ = ack.send(outcome);
                }
            }
            Action::AuthReplayOutcome { generation, outcome } => {
                self.handle_replay_outcome(generation, outcome).await;
            }
        }
    }

    fn start_authentication(
        &mut self,
        delegate: Arc<dyn AuthDelegate>,
        ack: Option<oneshot::Sender<AuthOutcome>>,
    ) {
        let Some(connection) = &mut self.connection else { return };
        let tx = self.queue_tx.clone();
        let retained = delegate.clone();
        let callback: crate::connection::AuthCallback = Box::new(move |outcome| {
            tx.send_internal(Action::AuthResult { delegate: retained, outcome, ack });
        });
        let _ = connection.authenticate(delegate, callback);
    }

    async fn do_subscribe(
        &mut self,
        id: String,
        mode: DeliveryMode,
        observer: Option<Box<dyn SubscriptionObserver>>,
        args: Option<Map<String, Value>>,
    ) {
        let requests = match self.subscriptions.get_mut(&id) {
            Some(existing) => {
                debug!(id, "subscription exists; queueing a cycle");
                existing.resubscribe(args, observer)
            }
            None => {
                let mut subscription = Subscription::new(id.clone(), mode, args, observer);
                let requests =
                    if self.is_connected() { subscription.connect() } else { Vec::new() };
                self.subscriptions.insert(id.clone(), subscription);
                requests
            }
        };
        self.dispatch_requests(&id, requests).await;
    }

    async fn handle_subscribe_ack(&mut self, id: String, pdu: Pdu) {
        let Some(subscription) = self.subscriptions.get_mut(&id) else {
            trace!(id, "subscribe ack for a dropped subscription");
            return;
        };
        let requests = match pdu.action.as_str() {
            "rtm/subscribe/ok" => {
                subscription.on_subscribe_ok(pdu.position().map(str::to_string))
            }
            "rtm/subscribe/error" => {
                let reason = pdu
                    .error_body()
                    .map(|body| body.describe())
                    .unwrap_or_else(|| "subscribe failed".to_string());
                error!(id, reason, "subscription error");
                subscription.on_subscribe_error(reason)
            }
            other => {
                self.fire_internal_error(&format!("unexpected subscribe ack: {other}"));
                return;
            }
        };
        self.reap(&id);
        self.dispatch_requests(&id, requests).await;
    }

    async fn handle_unsubscribe_ack(&mut self, id: String, pdu: Pdu) {
        let Some(subscription) = self.subscriptions.get_mut(&id) else {
            trace!(id, "unsubscribe ack for a dropped subscription");
            return;
        };
        let requests = match pdu.action.as_str() {
            "rtm/unsubscribe/ok" => subscription.on_unsubscribe_ok(),
            "rtm/unsubscribe/error" => subscription.on_unsubscribe_error(),
            other => {
                self.fire_internal_error(&format!("unexpected unsubscribe ack: {other}"));
                return;
            }
        };
        self.reap(&id);
        self.dispatch_requests(&id, requests).await;
    }

    /// Send the requests a subscription emitted, wiring their acks back
    /// into the queue.
    async fn dispatch_requests(&mut self, id: &str, requests: Vec<Request>) {
        for request in requests {
            let Some(connection) = &mut self.connection else { return };
            match request {
                Request::Subscribe(args) => {
                    let tx = self.queue_tx.clone();
                    let sid = id.to_string();
                    let continuation: Continuation = Box::new(move |pdu| {
                        tx.send_internal(Action::SubscribeAck { id: sid.clone(), pdu });
                    });
                    let _ = connection.subscribe(id, args, Some(continuation)).await;
                }
                Request::Unsubscribe => {
                    let tx = self.queue_tx.clone();
                    let sid = id.to_string();
                    let continuation: Continuation = Box::new(move |pdu| {
                        tx.send_internal(Action::UnsubscribeAck { id: sid.clone(), pdu });
                    });
                    let _ = connection.unsubscribe(id, Some(continuation)).await;
                }
            }
        }
    }

    fn reap(&mut self, id: &str) {
        if self.subscriptions.get(id).is_some_and(Subscription::is_deleted) {
            debug!(id, "dropping deleted subscription");
            self.subscriptions.remove(id);
        }
    }

    fn push_offline(&mut self, action: Action) {
        if self.offline.len() >= self.options.offline_queue_size {
            // oldest entries give way, like a ring
            self.offline.pop_front();
        }
        self.offline.push_back(action);
    }

    fn fire_internal_error(&mut self, message: &str) {
        error!(message, "internal error");
        if let Some(observer) = &mut self.observer {
            observer.on_internal_error(message);
        }
    }

    fn fire_enter(&mut self, state: ClientState) {
        if state == ClientState::Connected {
            self.shared.connected.store(true, Ordering::Release);
        }
        let Some(observer) = &mut self.observer else { return };
        match state {
            ClientState::Stopped => observer.on_enter_stopped(),
            ClientState::Connecting => observer.on_enter_connecting(),
            ClientState::Connected => observer.on_enter_connected(),
            ClientState::Awaiting => observer.on_enter_awaiting(),
            ClientState::Stopping => observer.on_enter_stopping(),
            ClientState::Disposed => observer.on_enter_disposed(),
        }
    }

    fn fire_leave(&mut self, state: ClientState) {
        if state == ClientState::Connected {
            self.shared.connected.store(false, Ordering::Release);
        }
        let Some(observer) = &mut self.observer else { return };
        match state {
            ClientState::Stopped => observer.on_leave_stopped(),
            ClientState::Connecting => observer.on_leave_connecting(),
            ClientState::Connected => observer.on_leave_connected(),
            ClientState::Awaiting => observer.on_leave_awaiting(),
            ClientState::Stopping => observer.on_leave_stopping(),
            ClientState::Disposed => {}
        }
    }
}

fn ack_continuation(ack: AckSender) -> Continuation {
    let mut ack = Some(ack);
    Box::new(move |pdu| {
        if let Some(ack) = ack.take() {
            let _ = ack.send(pdu);
        }
    })
}
