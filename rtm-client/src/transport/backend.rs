use futures_channel::{mpsc, oneshot};
use futures_util::{select, sink::SinkExt, stream::StreamExt, FutureExt};
use rtm_core::{
    codec::{CodecKind, Frame},
    types::Pdu,
};
use tokio_tungstenite::{tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, trace};

use super::{connect_via_proxy, ConnectionDetails};
use crate::error::ConnectionError;

type InternalStream =
    futures_util::stream::Fuse<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

type WsStreamItem = Result<Message, tokio_tungstenite::tungstenite::Error>;

/// `BackendDriver` drives a specific `WsBackend`. It can be used to dispatch
/// PDUs, receive decoded inbound PDUs, observe terminal errors, and shut the
/// backend down.
pub struct BackendDriver {
    // Decoded PDUs from the backend, received via WS
    pub to_handle: mpsc::UnboundedReceiver<Pdu>,
    // Notification from the backend of a terminal error
    pub error: oneshot::Receiver<()>,

    // PDUs that the backend should encode and dispatch
    pub dispatcher: mpsc::UnboundedSender<Pdu>,
    // Notify the backend of intentional shutdown
    shutdown: oneshot::Sender<()>,
}

impl BackendDriver {
    pub fn shutdown(self) {
        // don't care if it fails, as that means the backend is gone anyway
        let _ = self.shutdown.send(());
    }

    /// Decompose into the raw channel ends, for owners that need to poll
    /// the pieces separately.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedReceiver<Pdu>,
        oneshot::Receiver<()>,
        mpsc::UnboundedSender<Pdu>,
        oneshot::Sender<()>,
    ) {
        (self.to_handle, self.error, self.dispatcher, self.shutdown)
    }

    /// The raw channel ends, so a non-socket backend (tests, in-process
    /// servers) can stand in for a [`WsBackend`].
    pub fn pair() -> (Self, BackendPeer) {
        let (handler, to_handle) = mpsc::unbounded();
        let (dispatcher, to_dispatch) = mpsc::unbounded();
        let (error_tx, error_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        (
            BackendDriver {
                to_handle,
                error: error_rx,
                dispatcher,
                shutdown: shutdown_tx,
            },
            BackendPeer {
                inbound: handler,
                error: error_tx,
                outbound: to_dispatch,
                shutdown: shutdown_rx,
            },
        )
    }
}

/// The far side of a [`BackendDriver::pair`].
pub struct BackendPeer {
    /// Push server-originated PDUs toward the connection.
    pub inbound: mpsc::UnboundedSender<Pdu>,
    /// Fire to simulate a terminal transport error.
    pub error: oneshot::Sender<()>,
    /// PDUs the connection dispatched.
    pub outbound: mpsc::UnboundedReceiver<Pdu>,
    /// Completes when the connection shuts the backend down.
    pub shutdown: oneshot::Receiver<()>,
}

/// `WsBackend` owns the socket: it encodes outbound PDUs, decodes inbound
/// frames, and keeps the connection alive with periodic pings.
///
/// A ping is sent every `ping_interval`; if the previous ping was never
/// answered (by a Pong or by any data frame) when the next tick fires, the
/// server is considered gone and the backend halts with an error. Decode
/// failures, write failures and server-initiated closes halt it too; every
/// halt except an intentional shutdown fires the `error` oneshot.
pub struct WsBackend {
    server: InternalStream,
    codec: CodecKind,
    ping_interval: std::time::Duration,
    // set when a ping is in flight, cleared by pong or data
    awaiting_pong: bool,

    // channel to the connection, through which to send decoded PDUs
    handler: mpsc::UnboundedSender<Pdu>,
    // notify the connection of an error causing this task to halt
    error: oneshot::Sender<()>,

    // channel of PDUs to encode and dispatch
    to_dispatch: mpsc::UnboundedReceiver<Pdu>,
    // notification from the connection of intentional shutdown
    shutdown: oneshot::Receiver<()>,
}

impl WsBackend {
    pub async fn connect(
        details: &ConnectionDetails,
    ) -> Result<(Self, BackendDriver), ConnectionError> {
        let ws = match &details.proxy {
            Some(proxy) => connect_via_proxy(details, proxy).await?,
            None => tokio_tungstenite::connect_async(details.endpoint.as_str()).await?.0,
        };
        Ok(Self::new(ws.fuse(), details.codec, details.ping_interval))
    }

    pub fn new(
        server: InternalStream,
        codec: CodecKind,
        ping_interval: std::time::Duration,
    ) -> (Self, BackendDriver) {
        let (handler, to_handle) = mpsc::unbounded();
        let (dispatcher, to_dispatch) = mpsc::unbounded();
        let (error_tx, error_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        (
            WsBackend {
                server,
                codec,
                ping_interval,
                awaiting_pong: false,
                handler,
                error: error_tx,
                to_dispatch,
                shutdown: shutdown_rx,
            },
            BackendDriver {
                to_handle,
                error: error_rx,
                dispatcher,
                shutdown: shutdown_tx,
            },
        )
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        // any traffic from the server proves it is alive
        self.awaiting_pong = false;
        match self.codec.decode(frame) {
            Ok(pdu) => {
                trace!(action = pdu.action, "received pdu");
                self.handler.unbounded_send(pdu).map_err(|_| ConnectionError::DeadChannel)
            }
            Err(e) => {
                error!(err = %e, "failed to decode frame");
                Err(e.into())
            }
        }
    }

    fn handle(&mut self, item: WsStreamItem) -> Result<(), ConnectionError> {
        match item {
            Ok(item) => match item {
                Message::Text(t) => self.handle_frame(Frame::Text(t)),
                Message::Binary(buf) => self.handle_frame(Frame::Binary(buf)),
                // tungstenite answers pings for us
                Message::Ping(_) => Ok(()),
                Message::Pong(_) => {
                    self.awaiting_pong = false;
                    Ok(())
                }
                Message::Frame(_) => Ok(()),
                Message::Close(frame) => {
                    if let Some(frame) = frame {
                        error!(%frame, "server sent a close frame");
                    }
                    Err(ConnectionError::UnexpectedClose)
                }
            },
            Err(e) => {
                error!(err = %e, "error response from WS");
                Err(e.into())
            }
        }
    }

    pub fn spawn(mut self) {
        let fut = async move {
            let mut err = false;
            loop {
                let keepalive = tokio::time::sleep(self.ping_interval).fuse();
                tokio::pin!(keepalive);

                select! {
                    _ = keepalive => {
                        if self.awaiting_pong {
                            error!("server has not answered the previous ping");
                            err = true;
                            break
                        }
                        if let Err(e) = self.server.send(Message::Ping(vec![])).await {
                            error!(err = %e, "WS connection error");
                            err = true;
                            break
                        }
                        self.awaiting_pong = true;
                    }
                    resp = self.server.next() => {
                        match resp {
                            Some(item) => {
                                err = self.handle(item).is_err();
                                if err { break }
                            },
                            None => {
                                error!("WS server has gone away");
                                err = true;
                                break
                            },
                        }
                    }
                    // we've received a new dispatch, so we encode and send it
                    // via websocket
                    pdu = self.to_dispatch.next() => {
                        match pdu {
                            Some(pdu) => {
                                let msg = match self.codec.encode(&pdu) {
                                    Ok(Frame::Text(t)) => Message::Text(t),
                                    Ok(Frame::Binary(b)) => Message::Binary(b),
                                    Err(e) => {
                                        error!(err = %e, "failed to encode pdu");
                                        err = true;
                                        break
                                    }
                                };
                                if let Err(e) = self.server.send(msg).await {
                                    error!(err = %e, "WS connection error");
                                    err = true;
                                    break
                                }
                            },
                            // dispatcher has gone away
                            None => {
                                break
                            },
                        }
                    },
                    // break on shutdown recv, or on shutdown recv error
                    _ = &mut self.shutdown => {
                        debug!("backend shutting down");
                        break
                    },
                }
            }
            if err {
                let _ = self.error.send(());
            }
        };

        tokio::spawn(fut);
    }
}
