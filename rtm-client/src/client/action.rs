//! Tagged actions flowing through the client's queue.
//!
//! The public facade is a thin producer of the user variants; everything
//! else is an internal signal posted by continuations, the connection
//! delegate, timers or the supervisor itself.

use std::sync::Arc;

use futures_channel::{mpsc, oneshot};
use rtm_core::{
    auth::{AuthDelegate, AuthOutcome},
    types::{ErrorBody, Pdu, SubscriptionData},
};
use serde_json::{Map, Value};

use crate::{observer::SubscriptionObserver, subscription::DeliveryMode};

/// One-shot acknowledgement channel for `*_ack` wrappers.
pub(crate) type AckSender = oneshot::Sender<Pdu>;

pub(crate) enum Action {
    // -- user actions (bounded) --------------------------------------------
    Publish {
        channel: String,
        message: Value,
        ack: Option<AckSender>,
    },
    Subscribe {
        id: String,
        mode: DeliveryMode,
        observer: Option<Box<dyn SubscriptionObserver>>,
        args: Option<Map<String, Value>>,
    },
    Authenticate {
        delegate: Arc<dyn AuthDelegate>,
        ack: Option<oneshot::Sender<AuthOutcome>>,
    },
    Read {
        channel: String,
        args: Option<Map<String, Value>>,
        ack: Option<AckSender>,
    },
    Write {
        channel: String,
        value: Value,
        ack: Option<AckSender>,
    },
    Delete {
        channel: String,
        ack: Option<AckSender>,
    },

    // -- unbounded user requests -------------------------------------------
    Start,
    Stop,
    Dispose,
    Unsubscribe {
        id: String,
    },
    Search {
        prefix: String,
        results: mpsc::UnboundedSender<Pdu>,
    },

    // -- internal signals ---------------------------------------------------
    ChannelData {
        data: SubscriptionData,
    },
    ChannelError {
        channel: String,
        body: ErrorBody,
    },
    FastForward {
        channel: String,
    },
    InternalError {
        message: String,
    },
    SubscribeAck {
        id: String,
        pdu: Pdu,
    },
    UnsubscribeAck {
        id: String,
        pdu: Pdu,
    },
    AuthResult {
        delegate: Arc<dyn AuthDelegate>,
        outcome: AuthOutcome,
        ack: Option<oneshot::Sender<AuthOutcome>>,
    },
    AuthReplayOutcome {
        generation: u64,
        outcome: AuthOutcome,
    },
    Tick,
}

impl Action {
    /// Only these count against the queue's soft bound.
    pub(crate) fn is_user_action(&self) -> bool {
        matches!(
            self,
            Action::Publish { .. }
                | Action::Subscribe { .. }
                | Action::Authenticate { .. }
                | Action::Read { .. }
                | Action::Write { .. }
                | Action::Delete { .. }
        )
    }

    /// Name used in trace logs.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Action::Publish { .. } => "publish",
            Action::Subscribe { .. } => "subscribe",
            Action::Authenticate { .. } => "authenticate",
            Action::Read { .. } => "read",
            Action::Write { .. } => "write",
            Action::Delete { .. } => "delete",
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Dispose => "dispose",
            Action::Unsubscribe { .. } => "unsubscribe",
            Action::Search { .. } => "search",
            Action::ChannelData { .. } => "channel-data",
            Action::ChannelError { .. } => "channel-error",
            Action::FastForward { .. } => "fast-forward",
            Action::InternalError { .. } => "internal-error",
            Action::SubscribeAck { .. } => "subscribe-ack",
            Action::UnsubscribeAck { .. } => "unsubscribe-ack",
            Action::AuthResult { .. } => "auth-result",
            Action::AuthReplayOutcome { .. } => "auth-replay-outcome",
            Action::Tick => "tick",
        }
    }
}
