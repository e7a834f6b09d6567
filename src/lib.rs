//! rfc 6455 websocket protocol engine
//!
//! the crate covers the full protocol surface: the http upgrade
//! handshake on both sides, the frame codec with masking, message
//! assembly with incremental utf-8 validation, ping/pong and the close
//! handshake. transports stay abstract: anything `AsyncRead +
//! AsyncWrite` works, with [`ClientBuilder::connect`] and
//! [`start_server`] provided for the common tcp (and, behind the
//! `tls_rustls` feature, tls) case.

#![warn(missing_docs)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

pub use http;

/// frame en/decoding over a byte stream
pub mod codec;
/// message assembly, state machine and the connection facade
pub mod connection;
/// websocket error definitions
pub mod errors;
/// websocket transport unit
pub mod frame;
/// handshake wire logic & close code rules
pub mod protocol;
/// plaintext/tls stream union
pub mod stream;

mod utf8;

pub use codec::{FrameConfig, Role};
pub use connection::{Connection, ConnectionState, Message, DEFAULT_CLOSE_TIMEOUT};
pub use errors::{ProtocolError, WsError};
pub use stream::WsStream;

use crate::protocol::Mode;

fn check_uri(uri: &http::Uri) -> Result<Mode, WsError> {
    match uri.scheme_str() {
        Some(scheme) => match scheme.to_lowercase().as_str() {
            "ws" => Ok(Mode::Ws),
            "wss" => Ok(Mode::Wss),
            s => Err(WsError::InvalidUri(format!("unknown scheme {s}"))),
        },
        None => Err(WsError::InvalidUri("missing scheme".into())),
    }
}

/// helper builder to construct websocket client
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    protocols: Vec<String>,
    origin: Option<String>,
    headers: HashMap<String, String>,
    config: FrameConfig,
    close_timeout: Duration,
    connect_timeout: Option<Duration>,
    keepalive_interval: Option<Duration>,
    #[cfg(feature = "tls_rustls")]
    tls_config: Option<std::sync::Arc<tokio_rustls::rustls::ClientConfig>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            protocols: vec![],
            origin: None,
            headers: HashMap::new(),
            config: FrameConfig::default(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            connect_timeout: None,
            keepalive_interval: None,
            #[cfg(feature = "tls_rustls")]
            tls_config: None,
        }
    }
}

impl ClientBuilder {
    /// create builder with default config
    pub fn new() -> Self {
        Default::default()
    }

    /// add a subprotocol to offer, in preference order
    pub fn protocol(mut self, protocol: String) -> Self {
        self.protocols.push(protocol);
        self
    }

    /// set offered subprotocols
    ///
    /// **NOTE** it will clear protocols set by `protocol` method
    pub fn protocols(self, protocols: Vec<String>) -> Self {
        Self { protocols, ..self }
    }

    /// set the origin header sent with the upgrade request
    pub fn origin(mut self, origin: String) -> Self {
        self.origin = Some(origin);
        self
    }

    /// add initial request header
    pub fn header<K: ToString, V: ToString>(mut self, name: K, value: V) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    /// set initial request headers
    ///
    /// **NOTE** it will clear header set by previous `header` method
    pub fn headers(self, headers: HashMap<String, String>) -> Self {
        Self { headers, ..self }
    }

    /// set frame limits
    pub fn config(self, config: FrameConfig) -> Self {
        Self { config, ..self }
    }

    /// set the close handshake timeout
    pub fn close_timeout(self, close_timeout: Duration) -> Self {
        Self {
            close_timeout,
            ..self
        }
    }

    /// bound the whole connect, dial plus handshake
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// ping the peer after this much inbound silence while receiving
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// custom tls client configuration for wss targets
    #[cfg(feature = "tls_rustls")]
    pub fn tls_config(mut self, config: std::sync::Arc<tokio_rustls::rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// dial the uri and perform the protocol handshake
    ///
    /// `ws://` dials plain tcp (default port 80), `wss://` wraps the
    /// socket in tls first (default port 443)
    pub async fn connect(&self, uri: http::Uri) -> Result<Connection<WsStream<TcpStream>>, WsError> {
        match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.connect_inner(&uri))
                .await
                .map_err(|_| WsError::ConnectionFailed("connect timed out".into()))?,
            None => self.connect_inner(&uri).await,
        }
    }

    async fn connect_inner(
        &self,
        uri: &http::Uri,
    ) -> Result<Connection<WsStream<TcpStream>>, WsError> {
        let mode = check_uri(uri)?;
        let host = uri
            .host()
            .ok_or_else(|| WsError::InvalidUri("missing host".into()))?
            .to_string();
        let port = uri.port_u16().unwrap_or_else(|| mode.default_port());
        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;
        let remote = tcp.peer_addr().ok();
        let stream = self.wrap_stream(tcp, &mode, &host).await?;
        let mut conn = self.connect_on(uri.clone(), stream).await?;
        conn.set_remote_address(remote);
        Ok(conn)
    }

    #[cfg(feature = "tls_rustls")]
    async fn wrap_stream(
        &self,
        tcp: TcpStream,
        mode: &Mode,
        host: &str,
    ) -> Result<WsStream<TcpStream>, WsError> {
        match mode {
            Mode::Ws => Ok(WsStream::Plain(tcp)),
            Mode::Wss => {
                let tls = stream::wrap_tls(tcp, host, self.tls_config.clone()).await?;
                Ok(WsStream::Tls(tls.into()))
            }
        }
    }

    #[cfg(not(feature = "tls_rustls"))]
    async fn wrap_stream(
        &self,
        tcp: TcpStream,
        mode: &Mode,
        _host: &str,
    ) -> Result<WsStream<TcpStream>, WsError> {
        match mode {
            Mode::Ws => Ok(WsStream::Plain(tcp)),
            Mode::Wss => Err(WsError::InvalidUri(
                "wss scheme requires the tls_rustls feature".into(),
            )),
        }
    }

    /// perform the protocol handshake over a caller supplied transport
    ///
    /// this is the injection point for custom transports; `connect`
    /// is a thin tcp/tls wrapper around it
    pub async fn connect_on<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        uri: http::Uri,
        mut stream: S,
    ) -> Result<Connection<S>, WsError> {
        let mode = check_uri(&uri)?;
        let shake = protocol::req_handshake(
            &mut stream,
            &uri,
            &mode,
            &self.protocols,
            self.origin.as_deref(),
            &self.headers,
        )
        .await?;
        tracing::debug!(status = %shake.response.status(), "upgrade response accepted");
        let mut conn =
            Connection::with_remaining(stream, Role::Client, self.config.clone(), shake.remain);
        conn.set_close_timeout(self.close_timeout);
        conn.set_keepalive_interval(self.keepalive_interval);
        conn.set_subprotocol(shake.subprotocol);
        Ok(conn)
    }
}

/// helper struct to config & construct websocket server
#[derive(Clone, Default)]
pub struct ServerBuilder {
    protocols: Vec<String>,
    config: FrameConfig,
    close_timeout: Option<Duration>,
    keepalive_interval: Option<Duration>,
    #[cfg(feature = "tls_rustls")]
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("ServerBuilder");
        s.field("protocols", &self.protocols)
            .field("config", &self.config)
            .field("close_timeout", &self.close_timeout)
            .field("keepalive_interval", &self.keepalive_interval);
        #[cfg(feature = "tls_rustls")]
        s.field("tls_acceptor", &self.tls_acceptor.is_some());
        s.finish()
    }
}

impl ServerBuilder {
    /// create builder with default config
    pub fn new() -> Self {
        Default::default()
    }

    /// set supported subprotocols, matched against client offers
    pub fn protocols(self, protocols: Vec<String>) -> Self {
        Self { protocols, ..self }
    }

    /// set frame limits
    pub fn config(self, config: FrameConfig) -> Self {
        Self { config, ..self }
    }

    /// set the close handshake timeout
    pub fn close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = Some(close_timeout);
        self
    }

    /// ping idle peers after this much inbound silence
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// serve tls instead of plaintext
    #[cfg(feature = "tls_rustls")]
    pub fn tls_acceptor(mut self, acceptor: tokio_rustls::TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// wait for a protocol handshake on the stream and answer it
    pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        mut stream: S,
    ) -> Result<Connection<S>, WsError> {
        let shake = protocol::handle_handshake(&mut stream, &self.protocols).await?;
        tracing::debug!(path = %shake.path, "accepted websocket connection");
        let mut conn =
            Connection::with_remaining(stream, Role::Server, self.config.clone(), shake.remain);
        if let Some(timeout) = self.close_timeout {
            conn.set_close_timeout(timeout);
        }
        conn.set_keepalive_interval(self.keepalive_interval);
        conn.set_subprotocol(shake.subprotocol);
        Ok(conn)
    }

    /// bind a listener and run one task per accepted connection
    ///
    /// each socket gets the handshake and then the handler future;
    /// handshake failures are logged and the socket dropped. the
    /// returned handle stops the listener, running connections finish
    /// on their own.
    pub async fn serve<F, Fut>(
        self,
        handler: F,
        host: &str,
        port: u16,
    ) -> Result<ServerHandle, WsError>
    where
        F: Fn(Connection<WsStream<TcpStream>>) -> Fut + Clone + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;
        tracing::info!(%local_addr, "websocket server listening");
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let (tcp, addr) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                tracing::warn!(error = %e, "accept failed");
                                continue;
                            }
                        };
                        tracing::debug!(%addr, "incoming connection");
                        let builder = self.clone();
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            builder.handle_socket(handler, tcp, addr).await;
                        });
                    }
                }
            }
            tracing::info!("websocket server stopped");
        });
        Ok(ServerHandle {
            local_addr,
            shutdown,
            task,
        })
    }

    async fn handle_socket<F, Fut>(&self, handler: F, tcp: TcpStream, addr: SocketAddr)
    where
        F: Fn(Connection<WsStream<TcpStream>>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        #[cfg(feature = "tls_rustls")]
        let stream = match &self.tls_acceptor {
            Some(acceptor) => match acceptor.accept(tcp).await {
                Ok(tls) => WsStream::Tls(tls.into()),
                Err(e) => {
                    tracing::warn!(error = %e, "tls accept failed");
                    return;
                }
            },
            None => WsStream::Plain(tcp),
        };
        #[cfg(not(feature = "tls_rustls"))]
        let stream = WsStream::Plain(tcp);
        match self.accept(stream).await {
            Ok(mut conn) => {
                conn.set_remote_address(Some(addr));
                handler(conn).await;
            }
            Err(e) => tracing::debug!(error = %e, "handshake failed"),
        }
    }
}

/// running server bound to a local address
///
/// dropping the handle stops the accept loop; keep it alive for the
/// lifetime of the server
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// stop accepting connections and wait for the loop to exit
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

/// bind `host:port` and hand every upgraded connection to `handler`
///
/// shorthand for [`ServerBuilder::serve`] with default options
pub async fn start_server<F, Fut>(handler: F, host: &str, port: u16) -> Result<ServerHandle, WsError>
where
    F: Fn(Connection<WsStream<TcpStream>>) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    ServerBuilder::new().serve(handler, host, port).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_scheme_check() {
        let ws: http::Uri = "ws://example.com/chat".parse().unwrap();
        assert_eq!(check_uri(&ws).unwrap(), Mode::Ws);
        let wss: http::Uri = "wss://example.com".parse().unwrap();
        assert_eq!(check_uri(&wss).unwrap(), Mode::Wss);
        let https: http::Uri = "https://example.com".parse().unwrap();
        assert!(matches!(check_uri(&https), Err(WsError::InvalidUri(_))));
        let bare: http::Uri = "/only/a/path".parse().unwrap();
        assert!(matches!(check_uri(&bare), Err(WsError::InvalidUri(_))));
    }

    #[test]
    fn default_ports_follow_scheme() {
        assert_eq!(Mode::Ws.default_port(), 80);
        assert_eq!(Mode::Wss.default_port(), 443);
    }
}
