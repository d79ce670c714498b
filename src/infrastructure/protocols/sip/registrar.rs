//! SIP Registrar - turns REGISTER requests into location bindings

use super::auth::{AuthOutcome, DigestAuth};
use super::builder::ResponseBuilder;
use super::error::RouteError;
use super::message::{header_param, HeaderAccess, SipRequest, SipResponse};
use super::transport::TransportProtocol;
use crate::domain::access_control::AccessGuard;
use crate::domain::location::{BindingUpdate, LocationService, RegisterOutcome};
use crate::domain::shared::value_objects::SipUri;
use crate::infrastructure::metrics;
use chrono::Utc;
use rsip::Header;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Expiry negotiation bounds, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrarConfig {
    pub default_expires: u32,
    pub min_expires: u32,
    pub max_expires: u32,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            default_expires: 3600, // 1 hour
            min_expires: 60,       // 1 minute
            max_expires: 7200,     // 2 hours
        }
    }
}

/// URI text of a Contact value: the part inside `<...>`, or everything
/// before the header parameters for the bare form
fn contact_uri(contact: &str) -> &str {
    let contact = contact.trim();
    match (contact.find('<'), contact.find('>')) {
        (Some(start), Some(end)) if start < end => &contact[start + 1..end],
        _ => contact.split(';').next().unwrap_or(contact).trim(),
    }
}

/// REGISTER handler over the location service
pub struct Registrar {
    location: Arc<LocationService>,
    config: RegistrarConfig,
    /// Optional digest authentication
    auth: Option<Arc<DigestAuth>>,
    /// Receives authentication failures for brute-force blocking
    access: Option<Arc<AccessGuard>>,
}

impl Registrar {
    pub fn new(location: Arc<LocationService>, config: RegistrarConfig) -> Self {
        Self {
            location,
            config,
            auth: None,
            access: None,
        }
    }

    /// Require digest authentication for every REGISTER
    pub fn with_auth(mut self, auth: Arc<DigestAuth>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_access_guard(mut self, access: Arc<AccessGuard>) -> Self {
        self.access = Some(access);
        self
    }

    pub fn location(&self) -> &Arc<LocationService> {
        &self.location
    }

    /// Contact `expires` parameter, then the Expires header, then the default.
    /// Zero withdraws; anything else is clamped into the configured range.
    pub fn effective_expires(&self, contact_param: Option<u32>, header: Option<u32>) -> u32 {
        match contact_param.or(header) {
            Some(0) => 0,
            Some(expires) => expires.clamp(self.config.min_expires, self.config.max_expires),
            None => self.config.default_expires,
        }
    }

    async fn authenticate(
        &self,
        request: &SipRequest,
        domain: &str,
        source: SocketAddr,
    ) -> Result<(), RouteError> {
        let Some(auth) = &self.auth else {
            return Ok(());
        };

        match auth.authenticate(request, domain).await? {
            AuthOutcome::Authenticated(user) => {
                debug!("REGISTER authenticated as {}", user);
                if let Some(access) = &self.access {
                    access.record_auth_success(&source.ip());
                }
                Ok(())
            }
            AuthOutcome::Challenge(challenge) => Err(RouteError::AuthenticationRequired(challenge)),
            AuthOutcome::Failed(reason) => {
                metrics::record_registration("auth_failed");
                if let Some(access) = &self.access {
                    if access.record_auth_failure(&source.ip()) {
                        warn!("{} blocked after repeated REGISTER failures", source.ip());
                    }
                }
                Err(RouteError::AuthenticationFailed(reason))
            }
        }
    }

    /// Handle a REGISTER and build the 200 OK listing every live binding
    pub async fn handle_register(
        &self,
        request: &SipRequest,
        source: SocketAddr,
        transport: TransportProtocol,
    ) -> Result<SipResponse, RouteError> {
        let to = request
            .to_header()
            .ok_or_else(|| RouteError::MalformedMessage("missing To".to_string()))?;
        let to_uri = SipUri::parse(&to)?;
        let aor = to_uri.address_of_record();

        self.authenticate(request, to_uri.host(), source).await?;

        let call_id = request
            .call_id()
            .ok_or_else(|| RouteError::MalformedMessage("missing Call-ID".to_string()))?;
        let cseq = request
            .cseq()
            .ok_or_else(|| RouteError::MalformedMessage("missing CSeq".to_string()))?;
        let header_expires = request.expires();
        let contacts = request.contacts();

        if contacts.iter().any(|c| c.trim() == "*") {
            // RFC 3261 10.3 step 6
            if contacts.len() != 1 || header_expires != Some(0) {
                return Err(RouteError::MalformedMessage(
                    "wildcard Contact requires Expires: 0 and no other contacts".to_string(),
                ));
            }
            let removed = self.location.remove_all(&aor, &call_id, cseq).await?;
            info!("REGISTER * removed {} bindings of {}", removed, aor);
            metrics::record_registration("removed");
        } else if !contacts.is_empty() {
            let user_agent = request.user_agent();
            let mut updates = Vec::with_capacity(contacts.len());
            for contact in &contacts {
                let uri = contact_uri(contact);
                SipUri::parse(uri)?;
                let contact_expires = header_param(contact, "expires").and_then(|v| v.parse().ok());
                updates.push(
                    BindingUpdate::new(
                        aor.clone(),
                        uri,
                        self.effective_expires(contact_expires, header_expires),
                        call_id.clone(),
                        cseq,
                    )
                    .with_source(source, transport.as_str())
                    .with_user_agent(user_agent.clone()),
                );
            }

            let outcomes = self.location.apply_all(&aor, updates).await?;
            for outcome in outcomes {
                metrics::record_registration(match outcome {
                    RegisterOutcome::Created => "created",
                    RegisterOutcome::Refreshed => "refreshed",
                    RegisterOutcome::Removed | RegisterOutcome::NotFound => "removed",
                    RegisterOutcome::Stale => "stale",
                });
            }
        } else {
            debug!("REGISTER query for {}", aor);
        }

        self.build_ok(request, &aor).await
    }

    async fn build_ok(&self, request: &SipRequest, aor: &str) -> Result<SipResponse, RouteError> {
        let now = Utc::now();
        let bindings = self.location.resolve(aor).await?;

        let mut builder = ResponseBuilder::ok();
        for binding in &bindings {
            let value = format!(
                "<{}>;expires={}",
                binding.contact,
                binding.remaining_secs(now)
            );
            builder = builder.header(Header::Contact(value.as_str().into()));
        }

        builder
            .build_for_request(request)
            .map_err(|e| RouteError::MalformedMessage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::access_control::AccessConfig;
    use crate::domain::subscriber::Subscriber;
    use crate::infrastructure::persistence::{
        InMemoryLocationRepository, InMemorySubscriberRepository,
    };
    use std::time::Duration;

    fn source() -> SocketAddr {
        "192.0.2.10:5060".parse().unwrap()
    }

    fn registrar() -> Registrar {
        let location = Arc::new(LocationService::new(Arc::new(
            InMemoryLocationRepository::new(),
        )));
        Registrar::new(location, RegistrarConfig::default())
    }

    fn register(contact: &str, expires: Option<u32>, cseq: u32) -> SipRequest {
        register_with_auth(contact, expires, cseq, None)
    }

    fn register_with_auth(
        contact: &str,
        expires: Option<u32>,
        cseq: u32,
        authorization: Option<&str>,
    ) -> SipRequest {
        let mut text = format!(
            "REGISTER sip:example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 192.0.2.10:5060;branch=z9hG4bKr{cseq}\r\n\
             From: <sip:alice@example.com>;tag=r1\r\n\
             To: <sip:alice@example.com>\r\n\
             Call-ID: reg-call\r\n\
             CSeq: {cseq} REGISTER\r\n"
        );
        if !contact.is_empty() {
            text.push_str(&format!("Contact: {}\r\n", contact));
        }
        if let Some(expires) = expires {
            text.push_str(&format!("Expires: {}\r\n", expires));
        }
        if let Some(authorization) = authorization {
            text.push_str(&format!("Authorization: {}\r\n", authorization));
        }
        text.push_str("Content-Length: 0\r\n\r\n");
        SipRequest::parse(text.as_bytes()).unwrap()
    }

    #[test]
    fn test_effective_expires() {
        let registrar = registrar();
        assert_eq!(registrar.effective_expires(Some(120), Some(600)), 120);
        assert_eq!(registrar.effective_expires(None, Some(600)), 600);
        assert_eq!(registrar.effective_expires(None, None), 3600);
        assert_eq!(registrar.effective_expires(Some(10), None), 60);
        assert_eq!(registrar.effective_expires(None, Some(99999)), 7200);
        assert_eq!(registrar.effective_expires(Some(0), Some(600)), 0);
    }

    #[test]
    fn test_contact_uri() {
        assert_eq!(
            contact_uri(r#""Alice" <sip:alice@10.0.0.5;transport=tcp>;expires=60"#),
            "sip:alice@10.0.0.5;transport=tcp"
        );
        assert_eq!(contact_uri("sip:alice@10.0.0.5;expires=60"), "sip:alice@10.0.0.5");
    }

    #[tokio::test]
    async fn test_register_lists_bindings() {
        let registrar = registrar();
        let response = registrar
            .handle_register(
                &register("<sip:alice@192.0.2.10:5060>", Some(3600), 1),
                source(),
                TransportProtocol::Udp,
            )
            .await
            .unwrap();

        assert_eq!(response.status_code(), 200);
        let contacts = response.header_list("Contact");
        assert_eq!(contacts.len(), 1);
        assert!(contacts[0].starts_with("<sip:alice@192.0.2.10:5060>;expires="));

        let bindings = registrar
            .location()
            .resolve("sip:alice@example.com")
            .await
            .unwrap();
        assert_eq!(bindings[0].received, Some(source()));
        assert_eq!(bindings[0].transport.as_deref(), Some("udp"));
    }

    #[tokio::test]
    async fn test_unregister_and_query() {
        let registrar = registrar();
        registrar
            .handle_register(
                &register("<sip:alice@192.0.2.10:5060>", None, 1),
                source(),
                TransportProtocol::Udp,
            )
            .await
            .unwrap();

        let response = registrar
            .handle_register(
                &register("<sip:alice@192.0.2.10:5060>;expires=0", None, 2),
                source(),
                TransportProtocol::Udp,
            )
            .await
            .unwrap();
        assert_eq!(response.status_code(), 200);
        assert!(response.header_list("Contact").is_empty());

        let query = registrar
            .handle_register(&register("", None, 3), source(), TransportProtocol::Udp)
            .await
            .unwrap();
        assert!(query.header_list("Contact").is_empty());
    }

    #[tokio::test]
    async fn test_wildcard() {
        let registrar = registrar();
        registrar
            .handle_register(
                &register("<sip:alice@192.0.2.10:5060>, <sip:alice@192.0.2.11:5060>", None, 1),
                source(),
                TransportProtocol::Udp,
            )
            .await
            .unwrap();

        let bad = registrar
            .handle_register(&register("*", Some(60), 2), source(), TransportProtocol::Udp)
            .await;
        assert!(matches!(bad, Err(RouteError::MalformedMessage(_))));

        registrar
            .handle_register(&register("*", Some(0), 3), source(), TransportProtocol::Udp)
            .await
            .unwrap();
        assert!(registrar
            .location()
            .resolve("sip:alice@example.com")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_auth_challenge_and_failure_tracking() {
        let subscribers = InMemorySubscriberRepository::new();
        subscribers
            .add(Subscriber::new("alice", "example.com").with_password("secret"))
            .await;
        let auth = Arc::new(DigestAuth::new(
            "example.com",
            Arc::new(subscribers),
            Duration::from_secs(300),
        ));
        let access = Arc::new(AccessGuard::new(AccessConfig {
            max_auth_failures: 2,
            ..AccessConfig::default()
        }));
        let registrar = registrar().with_auth(auth.clone()).with_access_guard(access.clone());

        let challenged = registrar
            .handle_register(
                &register("<sip:alice@192.0.2.10:5060>", None, 1),
                source(),
                TransportProtocol::Udp,
            )
            .await;
        assert!(matches!(
            challenged,
            Err(RouteError::AuthenticationRequired(_))
        ));

        let nonce = auth.create_challenge(false).nonce;
        let bogus = format!(
            r#"Digest username="alice", realm="example.com", nonce="{}", uri="sip:example.com", response="00000000000000000000000000000000""#,
            nonce
        );
        for cseq in 2..4 {
            let request =
                register_with_auth("<sip:alice@192.0.2.10:5060>", None, cseq, Some(&bogus));
            let result = registrar
                .handle_register(&request, source(), TransportProtocol::Udp)
                .await;
            assert!(matches!(result, Err(RouteError::AuthenticationFailed(_))));
        }
        assert!(access.is_blocked(&source().ip()));
    }
}
