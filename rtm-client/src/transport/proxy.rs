//! HTTPS proxy tunneling.
//!
//! The proxy is handed a plain `CONNECT host:port`; once it answers 2xx the
//! websocket handshake (and TLS, for `wss`) runs over the tunneled stream.

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::{ConnectionDetails, Proxy};
use crate::error::ConnectionError;

const MAX_RESPONSE_LEN: usize = 8 * 1024;

#[cfg(any(feature = "rustls", feature = "openssl"))]
pub(crate) async fn connect_via_proxy(
    details: &ConnectionDetails,
    proxy: &Proxy,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, ConnectionError> {
    let stream = open_tunnel(details, proxy).await?;
    let (ws, _) =
        tokio_tungstenite::client_async_tls(details.endpoint.as_str(), stream).await?;
    Ok(ws)
}

#[cfg(not(any(feature = "rustls", feature = "openssl")))]
pub(crate) async fn connect_via_proxy(
    details: &ConnectionDetails,
    proxy: &Proxy,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, ConnectionError> {
    let _ = open_tunnel(details, proxy).await?;
    Err(ConnectionError::Proxy("built without TLS support".to_string()))
}

async fn open_tunnel(
    details: &ConnectionDetails,
    proxy: &Proxy,
) -> Result<TcpStream, ConnectionError> {
    let host = details
        .endpoint
        .host()
        .ok_or_else(|| ConnectionError::Proxy("endpoint has no host".to_string()))?
        .to_string();
    let port = details.endpoint.port();

    debug!(proxy.host, proxy.port, host, port, "opening proxy tunnel");
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;

    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    // read until the end of the response headers
    let mut response = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ConnectionError::Proxy("proxy closed the connection".to_string()));
        }
        response.extend_from_slice(&buf[..n]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if response.len() > MAX_RESPONSE_LEN {
            return Err(ConnectionError::Proxy("oversized CONNECT response".to_string()));
        }
    }

    let head = String::from_utf8_lossy(&response);
    let status_line = head.lines().next().unwrap_or_default();
    // e.g. "HTTP/1.1 200 Connection established"
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if !status.starts_with('2') {
        return Err(ConnectionError::Proxy(format!("proxy refused tunnel: {status_line}")));
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtm_core::{codec::CodecKind, endpoint::Endpoint};
    use tokio::net::TcpListener;

    fn details() -> ConnectionDetails {
        let endpoint = Endpoint::new("ws://upstream.example.com:8080", "k").unwrap();
        ConnectionDetails::new(endpoint, CodecKind::Json)
    }

    #[tokio::test]
    async fn issues_connect_for_the_endpoint_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await.unwrap();
            req
        });

        let proxy = Proxy::new("127.0.0.1", addr.port());
        let stream = open_tunnel(&details(), &proxy).await.unwrap();
        drop(stream);

        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT upstream.example.com:8080 HTTP/1.1\r\n"));
        assert!(request.contains("Host: upstream.example.com:8080"));
    }

    #[tokio::test]
    async fn refused_tunnel_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await.unwrap();
        });

        let proxy = Proxy::new("127.0.0.1", addr.port());
        let err = open_tunnel(&details(), &proxy).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Proxy(_)));
    }
}
