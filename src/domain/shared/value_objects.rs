//! Value objects shared across the core

use super::error::DomainError;
use std::fmt;

/// URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Sip,
    Sips,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        }
    }
}

/// SIP URI value object
///
/// Accepts both bare URIs (`sip:alice@example.com:5060;transport=tcp`) and
/// name-addr forms (`"Alice" <sip:alice@example.com>;expires=60`); for the
/// latter only the part between the angle brackets is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    scheme: Scheme,
    user: Option<String>,
    host: String,
    port: Option<u16>,
    params: Vec<(String, Option<String>)>,
}

impl SipUri {
    pub fn new(user: Option<String>, host: String, port: Option<u16>) -> Self {
        Self {
            scheme: Scheme::Sip,
            user,
            host,
            port,
            params: Vec::new(),
        }
    }

    pub fn parse(uri: &str) -> Result<Self, DomainError> {
        let uri = uri.trim();
        let uri = match (uri.find('<'), uri.find('>')) {
            (Some(start), Some(end)) if start < end => &uri[start + 1..end],
            _ => uri,
        };

        let (scheme, rest) = if let Some(rest) = strip_prefix_ignore_case(uri, "sips:") {
            (Scheme::Sips, rest)
        } else if let Some(rest) = strip_prefix_ignore_case(uri, "sip:") {
            (Scheme::Sip, rest)
        } else {
            return Err(DomainError::InvalidUri(format!(
                "URI must start with 'sip:' or 'sips:': {}",
                uri
            )));
        };

        // Headers (?...) are never part of a binding or a routing target
        let rest = rest.split('?').next().unwrap_or_default();

        let mut sections = rest.split(';');
        let userinfo_host = sections.next().unwrap_or_default();

        let (user, hostport) = match userinfo_host.rsplit_once('@') {
            Some((userinfo, hostport)) => {
                // Drop the password part, it has no meaning for routing
                let user = userinfo.split(':').next().unwrap_or_default();
                (Some(user.to_string()), hostport)
            }
            None => (None, userinfo_host),
        };

        let (host, port) = split_host_port(hostport)?;
        if host.is_empty() {
            return Err(DomainError::InvalidUri(format!("Missing host: {}", uri)));
        }

        let params = sections
            .filter(|p| !p.trim().is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.trim().to_ascii_lowercase(), Some(v.trim().to_string())),
                None => (p.trim().to_ascii_lowercase(), None),
            })
            .collect();

        Ok(Self {
            scheme,
            user,
            host,
            port,
            params,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// User part; `None` when the URI has no userinfo, `Some("")` when it is empty
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    /// Value of the `transport` URI parameter, lower-cased
    pub fn transport(&self) -> Option<String> {
        self.param("transport").map(|t| t.to_ascii_lowercase())
    }

    /// Canonical address-of-record: `sip:user@host`, lower-cased host,
    /// no port, no parameters, `sips` folded into `sip`.
    pub fn address_of_record(&self) -> String {
        match &self.user {
            Some(user) if !user.is_empty() => {
                format!("sip:{}@{}", user, self.host.to_ascii_lowercase())
            }
            _ => format!("sip:{}", self.host.to_ascii_lowercase()),
        }
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme.as_str())?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (key, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", key, v)?,
                None => write!(f, ";{}", key)?,
            }
        }
        Ok(())
    }
}

/// Normalize any URI text into its address-of-record form
pub fn normalize_aor(uri: &str) -> Result<String, DomainError> {
    Ok(SipUri::parse(uri)?.address_of_record())
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    match s.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => s.get(prefix.len()..),
        _ => None,
    }
}

fn split_host_port(hostport: &str) -> Result<(String, Option<u16>), DomainError> {
    // IPv6 reference: [2001:db8::1]:5060
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| DomainError::InvalidUri(format!("Unterminated IPv6 host: {}", hostport)))?;
        let port = match after.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None => None,
        };
        return Ok((host.to_string(), port));
    }

    match hostport.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), Some(parse_port(port)?))),
        None => Ok((hostport.to_string(), None)),
    }
}

fn parse_port(port: &str) -> Result<u16, DomainError> {
    port.trim()
        .parse()
        .map_err(|_| DomainError::InvalidUri(format!("Invalid port: {}", port)))
}
