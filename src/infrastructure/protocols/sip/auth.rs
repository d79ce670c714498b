//! SIP Digest Authentication (RFC 2617, RFC 3261)
//!
//! Credentials are checked against the subscriber store. Nonces are issued
//! per challenge and remembered until their TTL elapses.

use super::message::{split_list, HeaderAccess, SipError, SipRequest};
use crate::domain::shared::value_objects::SipUri;
use crate::domain::shared::Result as DomainResult;
use crate::domain::subscriber::SubscriberRepository;
use dashmap::DashMap;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Authentication challenge
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    pub qop: Option<String>,
    /// Credentials were valid but the nonce was not
    pub stale: bool,
}

impl AuthChallenge {
    /// Create a new authentication challenge
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            nonce: Self::generate_nonce(),
            algorithm: "MD5".to_string(),
            qop: Some("auth".to_string()),
            stale: false,
        }
    }

    /// Generate a random nonce
    fn generate_nonce() -> String {
        let mut rng = rand::thread_rng();
        let random_bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
        hex::encode(random_bytes)
    }

    /// Format as WWW-Authenticate header value
    pub fn to_header_value(&self) -> String {
        let mut value = format!(
            r#"Digest realm="{}", nonce="{}", algorithm={}"#,
            self.realm, self.nonce, self.algorithm
        );
        if let Some(qop) = &self.qop {
            value.push_str(&format!(r#", qop="{}""#, qop));
        }
        if self.stale {
            value.push_str(", stale=true");
        }
        value
    }
}

/// Parsed Authorization header
#[derive(Debug, Clone)]
pub struct AuthorizationHeader {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
}

impl AuthorizationHeader {
    /// Parse Authorization header from request
    pub fn from_request(request: &SipRequest) -> Result<Option<Self>, SipError> {
        match request.authorization() {
            Some(value) => Self::parse(&value).map(Some),
            None => Ok(None),
        }
    }

    pub fn parse(value: &str) -> Result<Self, SipError> {
        debug!("Parsing Authorization header: {}", value);

        let mut params = Self::parse_digest_params(value)?;
        let mut required = |name: &str| {
            params.remove(name).ok_or_else(|| {
                SipError::Authentication(format!("Missing {} in Authorization", name))
            })
        };

        Ok(Self {
            username: required("username")?,
            realm: required("realm")?,
            nonce: required("nonce")?,
            uri: required("uri")?,
            response: required("response")?,
            algorithm: params.remove("algorithm"),
            qop: params.remove("qop"),
            nc: params.remove("nc"),
            cnonce: params.remove("cnonce"),
        })
    }

    /// Parse Digest authentication parameters
    fn parse_digest_params(auth_value: &str) -> Result<HashMap<String, String>, SipError> {
        let (scheme, rest) = auth_value
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| SipError::Authentication("Empty Authorization".to_string()))?;
        if !scheme.eq_ignore_ascii_case("Digest") {
            return Err(SipError::Authentication(format!(
                "Unsupported scheme: {}",
                scheme
            )));
        }

        let mut params = HashMap::new();
        for part in split_list(rest) {
            if let Some((key, value)) = part.split_once('=') {
                let key = key.trim().to_ascii_lowercase();
                let value = value.trim().trim_matches('"');
                params.insert(key, value.to_string());
            }
        }

        Ok(params)
    }
}

/// HA1 = MD5(username:realm:password)
pub fn compute_ha1(username: &str, realm: &str, password: &str) -> String {
    format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)))
}

/// Calculate digest response from a precomputed HA1
pub fn calculate_response(
    ha1: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    // HA2 = MD5(method:uri)
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

    // Response = MD5(HA1:nonce:HA2) or MD5(HA1:nonce:nc:cnonce:qop:HA2)
    let digest = match qop {
        Some(qop_value) => md5::compute(format!(
            "{}:{}:{}:{}:{}:{}",
            ha1,
            nonce,
            nc.unwrap_or("00000001"),
            cnonce.unwrap_or(""),
            qop_value,
            ha2
        )),
        None => md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)),
    };
    format!("{:x}", digest)
}

/// Result of checking a request's credentials
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Authenticated(String),
    /// No usable credentials: answer 401 with this challenge
    Challenge(AuthChallenge),
    /// Credentials present but wrong: answer 403
    Failed(String),
}

/// Digest authentication manager
pub struct DigestAuth {
    realm: String,
    subscribers: Arc<dyn SubscriberRepository>,
    active_nonces: DashMap<String, Instant>,
    nonce_ttl: Duration,
}

impl DigestAuth {
    /// Create a new digest authentication manager
    pub fn new(
        realm: &str,
        subscribers: Arc<dyn SubscriberRepository>,
        nonce_ttl: Duration,
    ) -> Self {
        Self {
            realm: realm.to_string(),
            subscribers,
            active_nonces: DashMap::new(),
            nonce_ttl,
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Generate an authentication challenge
    pub fn create_challenge(&self, stale: bool) -> AuthChallenge {
        let mut challenge = AuthChallenge::new(&self.realm);
        challenge.stale = stale;

        self.active_nonces
            .insert(challenge.nonce.clone(), Instant::now());

        debug!("Created auth challenge with nonce: {}", challenge.nonce);
        challenge
    }

    fn nonce_is_valid(&self, nonce: &str) -> bool {
        let issued = match self.active_nonces.get(nonce) {
            Some(issued) => *issued,
            None => return false,
        };
        if issued.elapsed() > self.nonce_ttl {
            self.active_nonces.remove(nonce);
            return false;
        }
        true
    }

    /// Check the credentials of a request for a user of `domain`
    pub async fn authenticate(&self, request: &SipRequest, domain: &str) -> DomainResult<AuthOutcome> {
        let auth = match AuthorizationHeader::from_request(request) {
            Ok(Some(auth)) => auth,
            Ok(None) => return Ok(AuthOutcome::Challenge(self.create_challenge(false))),
            Err(e) => {
                warn!("Rejecting malformed credentials: {}", e);
                return Ok(AuthOutcome::Failed("malformed credentials".to_string()));
            }
        };

        if auth.realm != self.realm {
            warn!("Realm mismatch: expected {}, got {}", self.realm, auth.realm);
            return Ok(AuthOutcome::Challenge(self.create_challenge(false)));
        }

        if !self.nonce_is_valid(&auth.nonce) {
            debug!("Stale nonce from {}", auth.username);
            return Ok(AuthOutcome::Challenge(self.create_challenge(true)));
        }

        let subscriber = self
            .subscribers
            .find_by_username_and_domain(&auth.username, domain)
            .await?;
        let ha1 = match subscriber {
            Some(subscriber) if subscriber.enabled => subscriber.ha1_for_realm(&self.realm),
            Some(_) => {
                warn!("Authentication failed: subscriber {} disabled", auth.username);
                return Ok(AuthOutcome::Failed("subscriber disabled".to_string()));
            }
            None => None,
        };
        let Some(ha1) = ha1 else {
            warn!("Authentication failed: unknown user {}@{}", auth.username, domain);
            return Ok(AuthOutcome::Failed("unknown subscriber".to_string()));
        };

        let expected_response = calculate_response(
            &ha1,
            &auth.nonce,
            &request.method_name(),
            &auth.uri,
            auth.qop.as_deref(),
            auth.nc.as_deref(),
            auth.cnonce.as_deref(),
        );

        if !auth.response.eq_ignore_ascii_case(&expected_response) {
            warn!("Authentication failed for user {}: response mismatch", auth.username);
            return Ok(AuthOutcome::Failed("invalid credentials".to_string()));
        }

        // Registering someone else's address is not allowed
        if let Some(to) = request.to_header() {
            let to_uri = SipUri::parse(&to).ok();
            let to_user = to_uri.as_ref().and_then(|uri| uri.user());
            if to_user.is_some_and(|user| user != auth.username) {
                warn!(
                    "Authenticated user {} does not own {}",
                    auth.username, to
                );
                return Ok(AuthOutcome::Failed("identity mismatch".to_string()));
            }
        }

        info!("Authentication successful for user: {}", auth.username);
        Ok(AuthOutcome::Authenticated(auth.username))
    }

    /// Clean up old nonces
    pub fn cleanup_nonces(&self) -> usize {
        let before = self.active_nonces.len();
        let ttl = self.nonce_ttl;
        self.active_nonces.retain(|_, issued| issued.elapsed() <= ttl);
        before - self.active_nonces.len()
    }

    pub fn nonce_count(&self) -> usize {
        self.active_nonces.len()
    }
}
