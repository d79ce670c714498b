//! Shared fixtures for router scenarios

#![allow(dead_code)]

use sipcore::domain::access_control::{AccessConfig, AccessGuard, FloodConfig};
use sipcore::domain::location::LocationService;
use sipcore::domain::subscriber::Subscriber;
use sipcore::infrastructure::persistence::{InMemoryLocationRepository, InMemorySubscriberRepository};
use sipcore::infrastructure::protocols::sip::{
    DigestAuth, IncomingMessage, OutgoingMessage, Registrar, RegistrarConfig, Relay, RelayConfig,
    RequestRouter, RouterConfig, SipError, SipMessage, SipRequest, SipResponse, TransactionLayer,
    Transport, TransportProtocol,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const DOMAIN: &str = "example.com";
pub const PROXY_HOST: &str = "203.0.113.1";

/// Transport that keeps everything it is asked to send
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<OutgoingMessage>>,
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        self.sent.lock().await.push(message);
        Ok(())
    }
}

impl RecordingTransport {
    pub async fn last_response(&self) -> Option<SipResponse> {
        self.sent
            .lock()
            .await
            .iter()
            .rev()
            .find_map(|m| SipResponse::parse(&m.data).ok())
    }

    pub async fn sent_requests(&self) -> Vec<(SipRequest, SocketAddr)> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|m| !m.data.starts_with(b"SIP/"))
            .filter_map(|m| SipRequest::parse(&m.data).ok().map(|r| (r, m.destination)))
            .collect()
    }
}

pub struct Proxy {
    pub router: Arc<RequestRouter>,
    pub transport: Arc<RecordingTransport>,
    pub location: Arc<LocationService>,
    pub transactions: Arc<TransactionLayer>,
}

/// Router over in-memory stores; with `subscribers` REGISTER is challenged
pub async fn proxy(subscribers: Option<Vec<Subscriber>>) -> Proxy {
    let transport = Arc::new(RecordingTransport::default());
    let transactions = Arc::new(TransactionLayer::default());
    let location = Arc::new(LocationService::new(Arc::new(
        InMemoryLocationRepository::new(),
    )));
    let access = Arc::new(AccessGuard::new(AccessConfig {
        flood: FloodConfig {
            enabled: false,
            ..FloodConfig::default()
        },
        ..AccessConfig::default()
    }));

    let mut registrar = Registrar::new(location.clone(), RegistrarConfig::default())
        .with_access_guard(access.clone());
    if let Some(subscribers) = subscribers {
        let repository = Arc::new(InMemorySubscriberRepository::new());
        for subscriber in subscribers {
            repository.add(subscriber).await;
        }
        registrar = registrar.with_auth(Arc::new(DigestAuth::new(
            DOMAIN,
            repository,
            Duration::from_secs(300),
        )));
    }

    let relay = Arc::new(Relay::new(
        transport.clone(),
        transactions.clone(),
        RelayConfig {
            advertised_host: PROXY_HOST.to_string(),
            local_domains: vec![DOMAIN.to_string()],
            ..RelayConfig::default()
        },
    ));
    let router = Arc::new(RequestRouter::new(
        RouterConfig::default(),
        access,
        transactions.clone(),
        Arc::new(registrar),
        relay,
    ));

    Proxy {
        router,
        transport,
        location,
        transactions,
    }
}

pub fn incoming(text: &str, source: SocketAddr) -> IncomingMessage {
    IncomingMessage {
        message: SipMessage::parse(text.as_bytes()).expect("test message parses"),
        source,
        protocol: TransportProtocol::Udp,
    }
}

/// REGISTER for `user` binding `contact`
pub fn register(
    user: &str,
    contact: &str,
    call_id: &str,
    cseq: u32,
    expires: u32,
    authorization: Option<&str>,
) -> String {
    let authorization = authorization
        .map(|a| format!("Authorization: {}\r\n", a))
        .unwrap_or_default();
    format!(
        "REGISTER sip:{DOMAIN} SIP/2.0\r\n\
         Via: SIP/2.0/UDP 192.0.2.10:5060;branch=z9hG4bK{call_id}{cseq}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:{user}@{DOMAIN}>;tag=reg\r\n\
         To: <sip:{user}@{DOMAIN}>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} REGISTER\r\n\
         Contact: <{contact}>\r\n\
         Expires: {expires}\r\n\
         {authorization}\
         Content-Length: 0\r\n\r\n"
    )
}

pub fn invite(user: &str, branch: &str) -> String {
    format!(
        "INVITE sip:{user}@{DOMAIN} SIP/2.0\r\n\
         Via: SIP/2.0/UDP 192.0.2.20:5060;branch={branch}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:carol@{DOMAIN}>;tag=c1\r\n\
         To: <sip:{user}@{DOMAIN}>\r\n\
         Call-ID: {branch}-call\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Length: 0\r\n\r\n"
    )
}

/// Quoted parameter of a challenge header
pub fn challenge_param(header: &str, name: &str) -> Option<String> {
    let start = header.find(&format!("{}=\"", name))? + name.len() + 2;
    let end = header[start..].find('"')? + start;
    Some(header[start..end].to_string())
}
