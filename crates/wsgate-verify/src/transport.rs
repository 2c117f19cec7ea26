//! Streaming transport seam and its WebSocket implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The server answered the upgrade with a non-101 status.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("connection closed before a response arrived")]
    Closed,

    #[error("tls setup failed: {0}")]
    Tls(String),
}

impl TransportError {
    /// Failures expected while a freshly deployed endpoint is still being
    /// provisioned.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Rejected(_) | TransportError::Connect(_))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(&self, url: &str) -> TransportResult<Box<dyn StreamConnection>>;
}

#[async_trait]
pub trait StreamConnection: Send {
    async fn send_text(&mut self, text: &str) -> TransportResult<()>;

    /// Next text frame. Control frames are consumed transparently.
    async fn recv_text(&mut self) -> TransportResult<String>;

    async fn close(&mut self) -> TransportResult<()>;
}

// ── WebSocket ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub handshake_timeout: Duration,
    pub close_timeout: Duration,
    /// Keepalive pings while waiting for a frame; `None` disables them.
    pub ping_interval: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            ping_interval: Some(Duration::from_secs(20)),
        }
    }
}

/// WebSocket client transport over tokio-tungstenite with rustls.
pub struct TungsteniteTransport {
    config: TransportConfig,
    tls: Arc<rustls::ClientConfig>,
}

impl TungsteniteTransport {
    /// Create a transport that trusts the Mozilla root certificate store.
    pub fn new(config: TransportConfig) -> TransportResult<Self> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self {
            config,
            tls: Arc::new(tls),
        })
    }
}

#[async_trait]
impl StreamTransport for TungsteniteTransport {
    async fn connect(&self, url: &str) -> TransportResult<Box<dyn StreamConnection>> {
        let handshake = tokio_tungstenite::connect_async_tls_with_config(
            url,
            None,
            true,
            Some(Connector::Rustls(self.tls.clone())),
        );

        let (stream, response) = match tokio::time::timeout(self.config.handshake_timeout, handshake)
            .await
        {
            Err(_) => {
                return Err(TransportError::Connect(format!(
                    "handshake timed out after {:?}",
                    self.config.handshake_timeout
                )));
            }
            Ok(Err(tungstenite::Error::Http(response))) => {
                return Err(TransportError::Rejected(format!("status {}", response.status())));
            }
            Ok(Err(tungstenite::Error::Url(e))) => {
                return Err(TransportError::InvalidUrl(e.to_string()));
            }
            Ok(Err(tungstenite::Error::HttpFormat(e))) => {
                return Err(TransportError::InvalidUrl(e.to_string()));
            }
            Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
            Ok(Ok(pair)) => pair,
        };

        debug!(%url, status = %response.status(), "websocket connected");
        Ok(Box::new(TungsteniteConnection {
            stream,
            config: self.config.clone(),
            closed: false,
        }))
    }
}

struct TungsteniteConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    config: TransportConfig,
    closed: bool,
}

enum Next {
    Frame(Option<Result<Message, tungstenite::Error>>),
    Ping,
}

impl TungsteniteConnection {
    async fn next_event(&mut self, ticker: Option<&mut Interval>) -> Next {
        match ticker {
            Some(ticker) => tokio::select! {
                frame = self.stream.next() => Next::Frame(frame),
                _ = ticker.tick() => Next::Ping,
            },
            None => Next::Frame(self.stream.next().await),
        }
    }
}

#[async_trait]
impl StreamConnection for TungsteniteConnection {
    async fn send_text(&mut self, text: &str) -> TransportResult<()> {
        self.stream
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv_text(&mut self) -> TransportResult<String> {
        let mut ticker = self
            .config
            .ping_interval
            .map(|every| tokio::time::interval_at(Instant::now() + every, every));

        loop {
            match self.next_event(ticker.as_mut()).await {
                Next::Ping => {
                    self.stream
                        .send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| TransportError::Send(e.to_string()))?;
                }
                Next::Frame(None) | Next::Frame(Some(Ok(Message::Close(_)))) => {
                    self.closed = true;
                    return Err(TransportError::Closed);
                }
                Next::Frame(Some(Err(e))) => return Err(TransportError::Receive(e.to_string())),
                Next::Frame(Some(Ok(Message::Text(text)))) => return Ok(text),
                Next::Frame(Some(Ok(Message::Binary(bytes)))) => {
                    return String::from_utf8(bytes)
                        .map_err(|e| TransportError::Receive(e.to_string()));
                }
                Next::Frame(Some(Ok(_))) => continue,
            }
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match tokio::time::timeout(self.config.close_timeout, self.stream.close(None)).await {
            Ok(Ok(())) | Ok(Err(tungstenite::Error::ConnectionClosed)) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Send(e.to_string())),
            Err(_) => {
                debug!(timeout = ?self.config.close_timeout, "close handshake timed out");
                Ok(())
            }
        }
    }
}
