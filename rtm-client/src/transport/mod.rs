//! The frame transport: one websocket, owned by a spawned backend task.
//!
//! [`WsBackend`] owns the socket and is driven through the channel bundle in
//! [`BackendDriver`]; the connection layer never touches the socket itself.
//! [`Connector`] is the seam the supervisor uses to obtain a fresh backend
//! per connect attempt, and [`mock`] provides a channel-backed connector so
//! tests can play the server.

mod backend;
pub use backend::{BackendDriver, BackendPeer, WsBackend};

pub mod mock;

mod proxy;
pub(crate) use proxy::connect_via_proxy;

use std::time::Duration;

use async_trait::async_trait;
use rtm_core::{codec::CodecKind, endpoint::Endpoint};

use crate::error::ConnectionError;

/// Default cadence of application-level liveness pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);

/// An HTTPS proxy to tunnel through (`CONNECT host:port`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
}

impl Proxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

/// Everything needed to (re)establish one websocket connection.
#[derive(Clone, Debug)]
pub struct ConnectionDetails {
    pub endpoint: Endpoint,
    pub codec: CodecKind,
    pub proxy: Option<Proxy>,
    pub ping_interval: Duration,
}

impl ConnectionDetails {
    pub fn new(endpoint: Endpoint, codec: CodecKind) -> Self {
        Self { endpoint, codec, proxy: None, ping_interval: DEFAULT_PING_INTERVAL }
    }
}

/// Produces a fresh, spawned backend per connection attempt.
///
/// The supervisor calls this once on every entry to Connecting; tests swap
/// in [`mock::MockConnector`] to stand up a scripted server instead.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BackendDriver, ConnectionError>;
}

/// The production connector: dials the endpoint (optionally through an
/// HTTPS proxy) and spawns a [`WsBackend`] for the resulting socket.
#[derive(Clone, Debug)]
pub struct WsConnector {
    details: ConnectionDetails,
}

impl WsConnector {
    pub fn new(details: ConnectionDetails) -> Self {
        Self { details }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<BackendDriver, ConnectionError> {
        let (backend, driver) = WsBackend::connect(&self.details).await?;
        backend.spawn();
        Ok(driver)
    }
}
