//! Per-channel subscription tracking.
//!
//! A [`Subscription`] pairs the pure transition table in [`machine`] with
//! the mutable pieces: the stored position, the observer, and the retarget
//! slot used for observer swaps. It is owned and driven by the client's
//! event loop; the requests it emits are sent by the loop over the current
//! connection.

pub mod machine;

pub use machine::State;

use machine::{Effect, Event, Guards, Intent};
use rtm_core::types::{ErrorBody, SubscriptionData};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::observer::SubscriptionObserver;

/// How messages reach the subscriber across gaps and reconnects.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The server fast-forwards over gaps; the client does not track
    /// position. Easiest, loses messages silently on overflow.
    Simple,
    /// Position tracking plus fast-forward: resubscription resumes from
    /// the last seen position, and gaps skip ahead rather than failing.
    Reliable,
    /// Position tracking only: a gap surfaces as a fatal `out_of_sync`
    /// channel error instead of silently skipping.
    Advanced,
}

impl DeliveryMode {
    pub fn tracks_position(&self) -> bool {
        matches!(self, DeliveryMode::Reliable | DeliveryMode::Advanced)
    }

    pub fn requests_fast_forward(&self) -> bool {
        matches!(self, DeliveryMode::Simple | DeliveryMode::Reliable)
    }
}

/// A wire request the state machine wants sent.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Request {
    Subscribe(Map<String, Value>),
    Unsubscribe,
}

pub struct Subscription {
    id: String,
    delivery_mode: DeliveryMode,
    state: State,
    intent: Intent,
    connected: bool,
    args: Map<String, Value>,
    position: Option<String>,
    observer: Option<Box<dyn SubscriptionObserver>>,
    // retarget slot: swapped in on the next subscribe cycle
    next_observer: Option<Box<dyn SubscriptionObserver>>,
    next_args: Option<Map<String, Value>>,
    last_error: Option<String>,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        delivery_mode: DeliveryMode,
        args: Option<Map<String, Value>>,
        observer: Option<Box<dyn SubscriptionObserver>>,
    ) -> Self {
        Self {
            id,
            delivery_mode,
            state: State::Unsubscribed,
            intent: Intent::Linked,
            connected: false,
            args: args.unwrap_or_default(),
            position: None,
            observer,
            next_observer: None,
            next_args: None,
            last_error: None,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.state == State::Deleted
    }

    pub(crate) fn position(&self) -> Option<&str> {
        self.position.as_deref()
    }

    fn guards(&self) -> Guards {
        Guards {
            connected: self.connected,
            intent: self.intent,
            fatal_on_out_of_sync: self.delivery_mode.tracks_position()
                && !self.delivery_mode.requests_fast_forward(),
        }
    }

    /// The args for the next subscribe request: fast-forward per delivery
    /// mode, the user args, and the stored position.
    fn build_subscribe_args(&self) -> Map<String, Value> {
        let mut args = Map::new();
        if self.delivery_mode.requests_fast_forward() {
            args.insert("fast_forward".to_string(), Value::Bool(true));
        }
        for (k, v) in &self.args {
            args.insert(k.clone(), v.clone());
        }
        if let Some(position) = &self.position {
            args.insert("position".to_string(), Value::String(position.clone()));
        }
        args
    }

    // -- lifecycle inputs ---------------------------------------------------

    pub(crate) fn connect(&mut self) -> Vec<Request> {
        self.connected = true;
        self.advance(Event::Connect)
    }

    pub(crate) fn disconnect(&mut self) -> Vec<Request> {
        self.connected = false;
        self.advance(Event::Disconnect)
    }

    /// A user subscribe on an existing subscription: latch the new
    /// observer/args into the retarget slot and queue a full
    /// unsubscribe/subscribe cycle. Never issues overlapping subscribes.
    pub(crate) fn resubscribe(
        &mut self,
        args: Option<Map<String, Value>>,
        observer: Option<Box<dyn SubscriptionObserver>>,
    ) -> Vec<Request> {
        debug!(id = self.id, "retargeting subscription");
        if let Some(mut stale) = self.next_observer.take() {
            stale.on_deleted();
        }
        self.next_observer = observer;
        self.next_args = args;
        self.intent = Intent::Cycle;
        self.advance(Event::ModeChange)
    }

    pub(crate) fn unsubscribe(&mut self) -> Vec<Request> {
        debug!(id = self.id, "unsubscribing");
        self.intent = Intent::Unlinked;
        self.advance(Event::ModeChange)
    }

    pub(crate) fn on_subscribe_ok(&mut self, position: Option<String>) -> Vec<Request> {
        self.advance(Event::SubscribeOk { position })
    }

    pub(crate) fn on_subscribe_error(&mut self, reason: String) -> Vec<Request> {
        self.advance(Event::SubscribeError { reason })
    }

    pub(crate) fn on_unsubscribe_ok(&mut self) -> Vec<Request> {
        self.advance(Event::UnsubscribeOk)
    }

    pub(crate) fn on_unsubscribe_error(&mut self) -> Vec<Request> {
        self.advance(Event::UnsubscribeError)
    }

    pub(crate) fn on_channel_error(&mut self, body: &ErrorBody) -> Vec<Request> {
        if !matches!(self.state, State::Failed | State::Deleted) {
            if let Some(observer) = &mut self.observer {
                observer.on_subscription_error(body);
            }
        }
        self.advance(Event::ChannelError { error: body.error.clone(), reason: body.reason.clone() })
    }

    /// Channel data is accepted while Subscribed or Unsubscribing; a failed
    /// subscription takes no more messages.
    pub(crate) fn on_subscription_data(&mut self, data: &SubscriptionData) {
        if !matches!(self.state, State::Subscribed | State::Unsubscribing) {
            trace!(id = self.id, state = ?self.state, "dropping data outside delivery states");
            return;
        }
        if self.delivery_mode.tracks_position() {
            if let Some(position) = &data.position {
                self.position = Some(position.clone());
            }
        }
        if let Some(observer) = &mut self.observer {
            observer.on_subscription_data(data);
        }
    }

    // -- machinery ----------------------------------------------------------

    fn advance(&mut self, event: Event) -> Vec<Request> {
        let mut requests = Vec::new();
        self.advance_inner(event, &mut requests);
        requests
    }

    fn advance_inner(&mut self, event: Event, requests: &mut Vec<Request>) {
        let step = machine::step(self.state, &event, self.guards());
        trace!(id = self.id, from = ?self.state, to = ?step.next, ?event, "transition");

        let from = self.state;
        if step.next != from {
            self.fire_leave(from);
        }
        for effect in &step.effects {
            self.apply(effect, requests);
        }
        self.state = step.next;
        if step.next != from {
            self.fire_enter(step.next);
        }
        if step.revisit {
            self.advance_inner(Event::ModeChange, requests);
        }
    }

    fn apply(&mut self, effect: &Effect, requests: &mut Vec<Request>) {
        match effect {
            Effect::SendSubscribe => {
                requests.push(Request::Subscribe(self.build_subscribe_args()));
            }
            Effect::SendUnsubscribe => requests.push(Request::Unsubscribe),
            Effect::UpdatePosition(position) => {
                if self.delivery_mode.tracks_position() {
                    self.position = Some(position.clone());
                }
            }
            Effect::ClearPosition => self.position = None,
            Effect::LatchError(reason) => self.last_error = Some(reason.clone()),
            Effect::CompleteCycle => self.complete_cycle(),
            Effect::AbandonCycle => self.abandon_cycle(),
            Effect::FireDeleted => {
                if let Some(mut observer) = self.observer.take() {
                    observer.on_deleted();
                }
            }
        }
    }

    /// Swap the retarget slot in. The old observer is told it is gone, the
    /// latched one that it now exists.
    fn complete_cycle(&mut self) {
        if let Some(args) = self.next_args.take() {
            self.args = args;
            self.position = None;
        }
        if let Some(mut old) = self.observer.take() {
            old.on_deleted();
        }
        if let Some(mut new) = self.next_observer.take() {
            new.on_created();
            self.observer = Some(new);
        }
        self.intent = Intent::Linked;
    }

    fn abandon_cycle(&mut self) {
        if self.intent == Intent::Cycle {
            if let Some(mut stale) = self.next_observer.take() {
                stale.on_deleted();
            }
            self.next_args = None;
            self.intent = Intent::Linked;
        }
    }

    fn fire_enter(&mut self, state: State) {
        let reason = self.last_error.clone();
        let Some(observer) = &mut self.observer else { return };
        match state {
            State::Unsubscribed => observer.on_enter_unsubscribed(),
            State::Subscribing => observer.on_enter_subscribing(),
            State::Subscribed => observer.on_enter_subscribed(),
            State::Unsubscribing => observer.on_enter_unsubscribing(),
            State::Failed => observer.on_enter_failed(reason.as_deref().unwrap_or("unknown")),
            State::Deleted => {}
        }
    }

    fn fire_leave(&mut self, state: State) {
        let Some(observer) = &mut self.observer else { return };
        match state {
            State::Unsubscribed => observer.on_leave_unsubscribed(),
            State::Subscribing => observer.on_leave_subscribing(),
            State::Subscribed => observer.on_leave_subscribed(),
            State::Unsubscribing => observer.on_leave_unsubscribing(),
            State::Failed => observer.on_leave_failed(),
            State::Deleted => {}
        }
    }
}
