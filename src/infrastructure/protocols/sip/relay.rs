//! Stateful relay: forwards requests downstream and responses upstream
//!
//! Only the first destination of a request is tried. Serial or parallel
//! forking would iterate the remaining destinations from
//! [`Relay::relay`] once a branch fails.

use super::error::RouteError;
use super::message::{HeaderAccess, SipRequest, SipResponse};
use super::rport::response_address;
use super::transaction::{generate_branch, ForwardBranch, TransactionKey, TransactionLayer};
use super::transport::{OutgoingMessage, Transport, TransportProtocol};
use crate::domain::location::Binding;
use crate::domain::shared::value_objects::{Scheme, SipUri};
use rsip::Header;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Max-Forwards placed on requests this proxy originates
pub const DEFAULT_MAX_FORWARDS: u32 = 70;

/// Next hop for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// New request-URI; `None` keeps the request's own
    pub request_uri: Option<String>,
    pub host: String,
    pub port: u16,
    pub transport: TransportProtocol,
    /// Known socket address (the binding's REGISTER source), skips resolution
    pub address: Option<SocketAddr>,
}

impl Destination {
    /// Hop described by a URI (Route entry or request-URI)
    pub fn from_uri(uri: &str) -> Result<Self, RouteError> {
        let parsed = SipUri::parse(uri)
            .map_err(|e| RouteError::TemporarilyUnavailable(e.to_string()))?;
        let transport = match parsed.transport() {
            Some(t) => t
                .parse()
                .map_err(|_| RouteError::TemporarilyUnavailable(format!("transport {}", t)))?,
            None if parsed.scheme() == Scheme::Sips => TransportProtocol::Tls,
            None => TransportProtocol::Udp,
        };
        Ok(Self {
            request_uri: None,
            host: parsed.host().to_string(),
            port: parsed.port().unwrap_or_else(|| transport.default_port()),
            transport,
            address: None,
        })
    }

    /// Hop for a registered contact: the request-URI becomes the contact,
    /// delivery goes to where the REGISTER came from when known
    pub fn from_binding(binding: &Binding) -> Result<Self, RouteError> {
        let mut destination = Self::from_uri(&binding.contact)?;
        destination.request_uri = Some(binding.contact.clone());
        if let Some(transport) = binding.transport.as_deref().and_then(|t| t.parse().ok()) {
            destination.transport = transport;
        }
        destination.address = binding.received;
        Ok(destination)
    }

    /// Socket address to send to
    pub async fn resolve(&self) -> Result<SocketAddr, RouteError> {
        if let Some(address) = self.address {
            return Ok(address);
        }
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| {
                RouteError::TemporarilyUnavailable(format!("cannot resolve {}", self.host))
            })
    }
}

/// Addresses this proxy answers for
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Host written into Via and Record-Route
    pub advertised_host: String,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub tls_port: u16,
    /// Domains served by this proxy, lower-cased
    pub local_domains: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            advertised_host: "127.0.0.1".to_string(),
            udp_port: 5060,
            tcp_port: 5060,
            tls_port: 5061,
            local_domains: Vec::new(),
        }
    }
}

impl RelayConfig {
    pub fn port_for(&self, transport: TransportProtocol) -> u16 {
        match transport {
            TransportProtocol::Udp => self.udp_port,
            TransportProtocol::Tcp => self.tcp_port,
            TransportProtocol::Tls => self.tls_port,
        }
    }

    /// Whether the host is one of the served domains
    pub fn is_local_domain(&self, host: &str) -> bool {
        self.local_domains.iter().any(|d| d.eq_ignore_ascii_case(host))
    }

    /// Whether the URI designates this proxy itself
    pub fn is_own_uri(&self, uri: &SipUri) -> bool {
        let host_matches = uri.host().eq_ignore_ascii_case(&self.advertised_host)
            || self.is_local_domain(uri.host());
        let port_matches = match uri.port() {
            None => true,
            Some(port) => [self.udp_port, self.tcp_port, self.tls_port].contains(&port),
        };
        host_matches && port_matches
    }
}

/// Stateful request/response relay
pub struct Relay {
    transport: Arc<dyn Transport>,
    transactions: Arc<TransactionLayer>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(
        transport: Arc<dyn Transport>,
        transactions: Arc<TransactionLayer>,
        config: RelayConfig,
    ) -> Self {
        Self {
            transport,
            transactions,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Via this proxy pushes for a downstream branch
    pub fn via_for(&self, transport: TransportProtocol, branch: &str) -> String {
        format!(
            "SIP/2.0/{} {}:{};branch={};rport",
            transport,
            self.config.advertised_host,
            self.config.port_for(transport),
            branch
        )
    }

    /// Record-Route entry keeping this proxy on the dialog path
    pub fn record_route_for(&self, transport: TransportProtocol) -> String {
        let transport_param = match transport {
            TransportProtocol::Udp => String::new(),
            other => format!(";transport={}", other.as_str().to_ascii_lowercase()),
        };
        format!(
            "<sip:{}:{}{};lr>",
            self.config.advertised_host,
            self.config.port_for(transport),
            transport_param
        )
    }

    fn prepare(
        &self,
        request: &SipRequest,
        destination: &Destination,
        branch: &str,
    ) -> Result<SipRequest, RouteError> {
        let mut forwarded = match &destination.request_uri {
            Some(uri) => {
                let uri = rsip::Uri::try_from(uri.as_str())
                    .map_err(|e| RouteError::TemporarilyUnavailable(e.to_string()))?;
                request.with_uri(uri)
            }
            None => request.clone(),
        };
        forwarded.push_via(&self.via_for(destination.transport, branch));
        Ok(forwarded)
    }

    async fn send(
        &self,
        data: bytes::Bytes,
        address: SocketAddr,
        transport: TransportProtocol,
    ) -> Result<(), RouteError> {
        self.transport
            .send(OutgoingMessage::new(data, address, transport))
            .await
            .map_err(|e| RouteError::TransportFailure(e.to_string()))
    }

    /// Forward the request of server transaction `key` to the first destination
    pub async fn relay(
        &self,
        key: &TransactionKey,
        request: &SipRequest,
        destinations: &[Destination],
        record_route: bool,
    ) -> Result<(), RouteError> {
        let destination = destinations
            .first()
            .ok_or_else(|| RouteError::NotFound(request.uri_string()))?;
        let address = destination.resolve().await?;

        let branch = generate_branch();
        let mut forwarded = self.prepare(request, destination, &branch)?;
        if record_route {
            forwarded.push_record_route(&self.record_route_for(destination.transport));
        }

        self.transactions
            .bind_forward(
                key,
                address,
                destination.transport,
                forwarded.clone(),
                branch,
            )
            .await
            .map_err(|e| RouteError::Unavailable(e.to_string()))?;

        info!(
            "Relaying {} {} to {} via {}",
            request.method_name(),
            forwarded.uri_string(),
            address,
            destination.transport
        );
        self.send(forwarded.to_bytes(), address, destination.transport)
            .await
    }

    /// Forward without transaction state (ACK to a 2xx travels end to end)
    pub async fn forward_stateless(
        &self,
        request: &SipRequest,
        destination: &Destination,
    ) -> Result<(), RouteError> {
        let address = destination.resolve().await?;
        let forwarded = self.prepare(request, destination, &generate_branch())?;
        debug!(
            "Forwarding {} statelessly to {}",
            request.method_name(),
            address
        );
        self.send(forwarded.to_bytes(), address, destination.transport)
            .await
    }

    /// Request this proxy originates on a downstream branch (ACK or CANCEL),
    /// mirroring the relayed request as RFC 3261 9.1 and 17.1.1.3 require
    fn downstream_request(
        &self,
        forward: &ForwardBranch,
        method: rsip::Method,
        to: Option<String>,
    ) -> Result<SipRequest, RouteError> {
        let original = &forward.request;
        let missing = |name: &str| RouteError::MalformedMessage(format!("relayed request lacks {}", name));

        let from = original.from_header().ok_or_else(|| missing("From"))?;
        let to = to.or_else(|| original.to_header()).ok_or_else(|| missing("To"))?;
        let call_id = original.call_id().ok_or_else(|| missing("Call-ID"))?;
        let cseq = original.cseq().ok_or_else(|| missing("CSeq"))?;

        let mut headers: Vec<Header> = vec![
            Header::Via(self.via_for(forward.transport, &forward.branch).as_str().into()),
            Header::MaxForwards(DEFAULT_MAX_FORWARDS.to_string().as_str().into()),
        ];
        headers.extend(original.routes().iter().map(|r| Header::Route(r.as_str().into())));
        headers.push(Header::From(from.as_str().into()));
        headers.push(Header::To(to.as_str().into()));
        headers.push(Header::CallId(call_id.as_str().into()));
        headers.push(Header::CSeq(format!("{} {}", cseq, method).as_str().into()));
        headers.push(Header::ContentLength("0".into()));

        Ok(SipRequest::new(rsip::Request {
            method,
            uri: original.uri().clone(),
            version: rsip::Version::V2,
            headers: headers.into(),
            body: Vec::new(),
        }))
    }

    /// Send a CANCEL down the branch an INVITE was relayed on
    pub async fn cancel_downstream(&self, forward: &ForwardBranch) -> Result<(), RouteError> {
        let cancel = self.downstream_request(forward, rsip::Method::Cancel, None)?;
        info!("Cancelling branch {} at {}", forward.branch, forward.destination);
        self.send(cancel.to_bytes(), forward.destination, forward.transport)
            .await
    }

    /// Acknowledge a non-2xx final response to a relayed INVITE
    pub async fn ack_downstream(
        &self,
        forward: &ForwardBranch,
        response: &SipResponse,
    ) -> Result<(), RouteError> {
        let ack = self.downstream_request(forward, rsip::Method::Ack, response.to_header())?;
        debug!("Acknowledging {} on branch {}", response.status_code(), forward.branch);
        self.send(ack.to_bytes(), forward.destination, forward.transport)
            .await
    }

    /// Send a response upstream to where its request came from
    pub async fn send_response(
        &self,
        response: &SipResponse,
        source: SocketAddr,
        transport: TransportProtocol,
    ) -> Result<(), RouteError> {
        let destination = match transport {
            // RFC 3581: received/rport of the top Via
            TransportProtocol::Udp => response
                .top_via()
                .and_then(|via| response_address(&via))
                .unwrap_or(source),
            _ => source,
        };
        let result = self.send(response.to_bytes(), destination, transport).await;
        if let Err(e) = &result {
            warn!(
                "Failed to send {} response to {}: {}",
                response.status_code(),
                destination,
                e
            );
        }
        result
    }
}
