//! SIP transport layer - handles UDP, TCP and TLS
//!
//! Every listen endpoint feeds one mpsc channel of [`IncomingMessage`]s.
//! Stream transports keep a connection table keyed by peer address so that
//! responses and in-dialog requests reuse the connection the peer opened.

use super::message::{SipError, SipMessage};
use crate::infrastructure::metrics;
use bytes::{Buf, Bytes, BytesMut};
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, error, info, warn};

/// Largest message accepted on any transport
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

const INITIAL_BIND_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BIND_BACKOFF: Duration = Duration::from_secs(30);

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Tls => "TLS",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportProtocol::Udp => 5060,
            TransportProtocol::Tcp => 5060,
            TransportProtocol::Tls => 5061,
        }
    }

    /// Reliable transports need no retransmission absorption after ACK
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportProtocol::Udp)
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportProtocol {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(TransportProtocol::Udp),
            "TCP" => Ok(TransportProtocol::Tcp),
            "TLS" => Ok(TransportProtocol::Tls),
            other => Err(SipError::TransportError(format!(
                "Unsupported transport: {}",
                other
            ))),
        }
    }
}

/// One configured listen address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenEndpoint {
    pub protocol: TransportProtocol,
    pub address: SocketAddr,
}

impl ListenEndpoint {
    pub fn new(protocol: TransportProtocol, address: SocketAddr) -> Self {
        Self { protocol, address }
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.protocol, self.address)
    }
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
    pub protocol: TransportProtocol,
}

impl OutgoingMessage {
    pub fn new(data: Bytes, destination: SocketAddr, protocol: TransportProtocol) -> Self {
        Self {
            data,
            destination,
            protocol,
        }
    }
}

/// Outbound side of the transport layer
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send a message
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;
}

/// Stream framing errors; any of them closes the connection
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message exceeds {0} bytes")]
    TooLarge(usize),

    #[error("Invalid Content-Length: {0}")]
    InvalidContentLength(String),
}

/// A frame cut from a stream transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipFrame {
    Message(Bytes),
    KeepaliveRequest,
    KeepaliveResponse,
}

/// Frames SIP messages on stream transports by header terminator and
/// Content-Length
#[derive(Debug, Default)]
pub struct SipCodec;

impl SipCodec {
    pub fn new() -> Self {
        Self
    }

    fn content_length(headers: &[u8]) -> Result<usize, CodecError> {
        let text = String::from_utf8_lossy(headers);
        for line in text.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
                let value = value.trim();
                return value
                    .parse::<usize>()
                    .map_err(|_| CodecError::InvalidContentLength(value.to_string()));
            }
        }
        Ok(0)
    }
}

impl Decoder for SipCodec {
    type Item = SipFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.starts_with(KEEPALIVE_REQUEST) {
            src.advance(KEEPALIVE_REQUEST.len());
            return Ok(Some(SipFrame::KeepaliveRequest));
        }
        if src.starts_with(KEEPALIVE_RESPONSE) {
            src.advance(KEEPALIVE_RESPONSE.len());
            return Ok(Some(SipFrame::KeepaliveResponse));
        }

        if let Some(headers_end) = src.windows(4).position(|w| w == b"\r\n\r\n") {
            let header_len = headers_end + 4;
            let total_len = header_len + Self::content_length(&src[..header_len])?;
            if total_len > MAX_MESSAGE_SIZE {
                return Err(CodecError::TooLarge(MAX_MESSAGE_SIZE));
            }
            if src.len() >= total_len {
                return Ok(Some(SipFrame::Message(src.split_to(total_len).freeze())));
            }
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        if src.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::TooLarge(MAX_MESSAGE_SIZE));
        }
        Ok(None)
    }
}

type ConnectionTable = DashMap<SocketAddr, mpsc::Sender<Bytes>>;

/// UDP, TCP and TLS listeners sharing one inbound channel
pub struct SipTransport {
    incoming: mpsc::Sender<IncomingMessage>,
    /// First bound UDP socket, used for every outbound datagram
    udp_socket: RwLock<Option<Arc<UdpSocket>>>,
    connections: Arc<ConnectionTable>,
}

impl SipTransport {
    pub fn new(incoming: mpsc::Sender<IncomingMessage>) -> Self {
        Self {
            incoming,
            udp_socket: RwLock::new(None),
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Number of open stream connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Bind one endpoint and start serving it. Returns the bound address.
    pub async fn bind(
        &self,
        endpoint: &ListenEndpoint,
        tls: Option<&TlsAcceptor>,
    ) -> Result<SocketAddr, SipError> {
        match endpoint.protocol {
            TransportProtocol::Udp => {
                let socket = UdpSocket::bind(endpoint.address).await.map_err(|e| {
                    SipError::TransportError(format!("Failed to bind UDP socket: {}", e))
                })?;
                let local = socket.local_addr().map_err(|e| {
                    SipError::TransportError(format!("Failed to read UDP address: {}", e))
                })?;
                let socket = Arc::new(socket);

                let mut current = self.udp_socket.write().await;
                if current.is_none() {
                    *current = Some(socket.clone());
                }
                drop(current);

                let tx = self.incoming.clone();
                tokio::spawn(async move {
                    Self::receive_loop(socket, tx).await;
                });

                info!("UDP transport listening on {}", local);
                Ok(local)
            }
            TransportProtocol::Tcp | TransportProtocol::Tls => {
                let acceptor = match endpoint.protocol {
                    TransportProtocol::Tls => Some(tls.cloned().ok_or_else(|| {
                        SipError::TransportError(
                            "TLS endpoint configured without a certificate".to_string(),
                        )
                    })?),
                    _ => None,
                };

                let listener = TcpListener::bind(endpoint.address).await.map_err(|e| {
                    SipError::TransportError(format!(
                        "Failed to bind {} socket: {}",
                        endpoint.protocol, e
                    ))
                })?;
                let local = listener.local_addr().map_err(|e| {
                    SipError::TransportError(format!("Failed to read listener address: {}", e))
                })?;

                let tx = self.incoming.clone();
                let connections = self.connections.clone();
                tokio::spawn(async move {
                    Self::accept_loop(listener, acceptor, tx, connections).await;
                });

                info!("{} transport listening on {}", endpoint.protocol, local);
                Ok(local)
            }
        }
    }

    /// Bind an endpoint in the background, retrying with exponential backoff
    /// until it succeeds. Other endpoints are unaffected by its failures.
    pub fn spawn_endpoint(
        self: &Arc<Self>,
        endpoint: ListenEndpoint,
        tls: Option<TlsAcceptor>,
    ) -> JoinHandle<()> {
        let transport = self.clone();
        tokio::spawn(async move {
            let mut backoff = INITIAL_BIND_BACKOFF;
            loop {
                match transport.bind(&endpoint, tls.as_ref()).await {
                    Ok(_) => return,
                    Err(e) => {
                        error!(
                            "Endpoint {} failed to bind: {}; retrying in {:?}",
                            endpoint, e, backoff
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BIND_BACKOFF);
                    }
                }
            }
        })
    }

    /// Parse and deliver one message. Returns false once the channel is closed.
    async fn deliver(
        tx: &mpsc::Sender<IncomingMessage>,
        data: &[u8],
        source: SocketAddr,
        protocol: TransportProtocol,
    ) -> bool {
        match SipMessage::parse(data) {
            Ok(message) => {
                let incoming = IncomingMessage {
                    message,
                    source,
                    protocol,
                };
                if let Err(e) = tx.send(incoming).await {
                    error!("Failed to send incoming message to channel: {}", e);
                    return false;
                }
                true
            }
            Err(e) => {
                warn!(
                    "Dropping malformed message from {} via {}: {}",
                    source, protocol, e
                );
                metrics::record_malformed(protocol.as_str());
                true
            }
        }
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    let data = &buf[..size];
                    // CRLF keepalive
                    if data.iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }
                    debug!("Received {} bytes from {} via UDP", size, source);
                    if !Self::deliver(&tx, data, source, TransportProtocol::Udp).await {
                        break;
                    }
                }
                Err(e) => {
                    // ICMP errors surface here; the socket itself stays usable
                    warn!("Failed to receive UDP packet: {}", e);
                }
            }
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
        tx: mpsc::Sender<IncomingMessage>,
        connections: Arc<ConnectionTable>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    let tx = tx.clone();
                    let connections = connections.clone();
                    match acceptor.clone() {
                        Some(acceptor) => {
                            tokio::spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        Self::attach(
                                            tls_stream,
                                            peer,
                                            TransportProtocol::Tls,
                                            tx,
                                            connections,
                                        );
                                    }
                                    Err(e) => warn!("TLS handshake with {} failed: {}", peer, e),
                                }
                            });
                        }
                        None => {
                            Self::attach(stream, peer, TransportProtocol::Tcp, tx, connections);
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Register a stream connection and start its reader and writer tasks
    fn attach<S>(
        stream: S,
        peer: SocketAddr,
        protocol: TransportProtocol,
        tx: mpsc::Sender<IncomingMessage>,
        connections: Arc<ConnectionTable>,
    ) -> mpsc::Sender<Bytes>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::channel(256);
        connections.insert(peer, out_tx.clone());

        tokio::spawn(Self::write_loop(write_half, out_rx, peer));
        tokio::spawn(Self::read_loop(
            read_half,
            peer,
            protocol,
            tx,
            connections,
            out_tx.clone(),
        ));
        out_tx
    }

    async fn write_loop<S>(
        mut write_half: WriteHalf<S>,
        mut outgoing: mpsc::Receiver<Bytes>,
        peer: SocketAddr,
    ) where
        S: AsyncRead + AsyncWrite + Send,
    {
        while let Some(data) = outgoing.recv().await {
            if let Err(e) = write_half.write_all(&data).await {
                warn!("Failed to write to {}: {}", peer, e);
                break;
            }
        }
        let _ = write_half.shutdown().await;
    }

    async fn read_loop<S>(
        read_half: ReadHalf<S>,
        peer: SocketAddr,
        protocol: TransportProtocol,
        tx: mpsc::Sender<IncomingMessage>,
        connections: Arc<ConnectionTable>,
        out_tx: mpsc::Sender<Bytes>,
    ) where
        S: AsyncRead + AsyncWrite + Send,
    {
        let mut frames = FramedRead::new(read_half, SipCodec::new());

        while let Some(frame) = frames.next().await {
            match frame {
                Ok(SipFrame::Message(data)) => {
                    debug!("Received {} bytes from {} via {}", data.len(), peer, protocol);
                    if !Self::deliver(&tx, &data, peer, protocol).await {
                        break;
                    }
                }
                Ok(SipFrame::KeepaliveRequest) => {
                    let _ = out_tx.send(Bytes::from_static(KEEPALIVE_RESPONSE)).await;
                }
                Ok(SipFrame::KeepaliveResponse) => {}
                Err(CodecError::Io(e)) => {
                    debug!("Connection from {} failed: {}", peer, e);
                    break;
                }
                Err(e) => {
                    warn!("Closing {} connection from {}: {}", protocol, peer, e);
                    metrics::record_malformed(protocol.as_str());
                    break;
                }
            }
        }

        connections.remove_if(&peer, |_, sender| sender.same_channel(&out_tx));
        debug!("{} connection from {} closed", protocol, peer);
    }
}

#[async_trait::async_trait]
impl Transport for SipTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        debug!(
            "Sending {} bytes to {} via {}",
            message.data.len(),
            message.destination,
            message.protocol
        );

        if message.protocol == TransportProtocol::Udp {
            let socket = self
                .udp_socket
                .read()
                .await
                .clone()
                .ok_or_else(|| SipError::TransportError("No UDP socket bound".to_string()))?;
            socket
                .send_to(&message.data, message.destination)
                .await
                .map_err(|e| {
                    SipError::TransportError(format!("Failed to send UDP packet: {}", e))
                })?;
            return Ok(());
        }

        let existing = self
            .connections
            .get(&message.destination)
            .map(|entry| entry.value().clone());
        if let Some(sender) = existing {
            if sender.send(message.data.clone()).await.is_ok() {
                return Ok(());
            }
            self.connections
                .remove_if(&message.destination, |_, s| s.same_channel(&sender));
        }

        if message.protocol == TransportProtocol::Tls {
            return Err(SipError::TransportError(format!(
                "No TLS connection to {}",
                message.destination
            )));
        }

        let stream = TcpStream::connect(message.destination).await.map_err(|e| {
            SipError::TransportError(format!(
                "Failed to connect to {}: {}",
                message.destination, e
            ))
        })?;
        let sender = Self::attach(
            stream,
            message.destination,
            TransportProtocol::Tcp,
            self.incoming.clone(),
            self.connections.clone(),
        );
        sender.send(message.data).await.map_err(|_| {
            SipError::TransportError(format!("Connection to {} closed", message.destination))
        })
    }
}
