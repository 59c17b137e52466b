#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::type_complexity)]

//! An auto-recovering client for the RTM publish/subscribe and key/value
//! service.
//!
//! The entry point is [`Client`]: a cloneable handle whose publishes,
//! subscriptions, authentications and K/V operations survive disconnects.
//! Everything the handle does is funneled through a bounded action queue
//! into one event-loop task that owns the connection and both state
//! machines; observer callbacks run on that task.
//!
//! The lower layers are public too: [`connection::Connection`] is the
//! single-socket request/reply primitive with no recovery behavior, and
//! [`transport`] holds the websocket backend plus a channel-backed mock for
//! tests.

pub mod connection;
pub mod subscription;
pub mod transport;

mod client;
pub use client::{Client, ClientOptions, ClientState};

mod observer;
pub use observer::{ClientObserver, SubscriptionObserver};

mod error;
pub use error::{ClientError, ConnectionError, ErrorReply, ProtocolViolation};

pub use subscription::DeliveryMode;

// convenience re-exports of the protocol-level types the public API speaks
pub use rtm_core::{
    auth::{AuthDelegate, AuthOutcome, RoleSecretAuthDelegate},
    codec::CodecKind,
    endpoint::Endpoint,
    types::{ErrorBody, Pdu, SubscriptionData},
};
