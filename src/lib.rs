#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Auto-recovering RTM client SDK.
//!
//! A client library for the hosted RTM publish/subscribe and key/value
//! service, speaking framed PDUs over a single persistent WebSocket. The
//! high-level [`Client`](client::Client) hides connection loss from
//! application code: while a handle is held, publishes, subscriptions,
//! authentications and K/V operations survive disconnects and are restored
//! after reconnects.
//!
//! ## Quickstart: `prelude`
//!
//! ```no_run
//! use rtm::prelude::*;
//! use serde_json::json;
//!
//! # async fn t() {
//! let client = Client::new("wss://rtm.example.com", "<appkey>").unwrap();
//! client.start().unwrap();
//!
//! struct Printer;
//! impl SubscriptionObserver for Printer {
//!     fn on_subscription_data(&mut self, data: &SubscriptionData) {
//!         for message in &data.messages {
//!             println!("got {message}");
//!         }
//!     }
//! }
//!
//! client.subscribe("greetings", DeliveryMode::Reliable, Some(Box::new(Printer)), None).unwrap();
//! client.publish("greetings", json!({"hello": "world"})).unwrap();
//! # }
//! ```
//!
//! # Quick explanation of each module in ascending order of abstraction
//!
//! ## `core`
//!
//! Everything describable without a socket: the PDU envelope and its typed
//! bodies, the JSON/CBOR frame codecs, endpoint normalization and the
//! role-secret authentication primitives.
//!
//! ## `client`
//!
//! The stateful layers: the websocket transport backend, the single-socket
//! [`Connection`](client::connection::Connection) primitive, the
//! per-channel subscription state machine, and the auto-recovering
//! [`Client`](client::Client) supervisor with its action queue and event
//! loop.

pub use rtm_client as client;
pub use rtm_core as core;

/// Easy imports of the most common types and traits.
pub mod prelude {
    pub use super::client::{
        AuthDelegate, AuthOutcome, Client, ClientError, ClientObserver, ClientOptions,
        ClientState, CodecKind, DeliveryMode, ErrorBody, Pdu, RoleSecretAuthDelegate,
        SubscriptionData, SubscriptionObserver,
    };
}
