//! Via header value parsing

use super::message::SipError;
use std::fmt;

/// Parsed Via element: `SIP/2.0/UDP host:port;param=value;flag`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    /// Transport token as written (`UDP`, `TCP`, `TLS`)
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
}

impl ViaHeader {
    pub fn new(transport: &str, host: &str, port: Option<u16>) -> Self {
        Self {
            transport: transport.to_ascii_uppercase(),
            host: host.to_string(),
            port,
            params: Vec::new(),
        }
    }

    pub fn parse(value: &str) -> Result<Self, SipError> {
        let mut sections = value.trim().split(';');
        let sent = sections.next().unwrap_or_default().trim();

        let (protocol, sent_by) = sent
            .split_once(char::is_whitespace)
            .ok_or_else(|| SipError::InvalidMessage(format!("Bad Via: {}", value)))?;

        let transport = protocol
            .rsplit('/')
            .next()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SipError::InvalidMessage(format!("Bad Via protocol: {}", protocol)))?
            .to_ascii_uppercase();

        let sent_by = sent_by.trim();
        let (host, port) = if let Some(rest) = sent_by.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| SipError::InvalidMessage(format!("Bad Via host: {}", sent_by)))?;
            (host.to_string(), parse_port(after.strip_prefix(':'))?)
        } else {
            match sent_by.split_once(':') {
                Some((host, port)) => (host.to_string(), parse_port(Some(port))?),
                None => (sent_by.to_string(), None),
            }
        };
        if host.is_empty() {
            return Err(SipError::InvalidMessage(format!("Via without host: {}", value)));
        }

        let params = sections
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.trim().to_ascii_lowercase(), Some(v.trim().to_string())),
                None => (p.to_ascii_lowercase(), None),
            })
            .collect();

        Ok(Self {
            transport,
            host,
            port,
            params,
        })
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

    /// Set or replace a parameter, appending it when absent
    pub fn set_param(&mut self, name: &str, value: Option<String>) {
        match self
            .params
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = value,
            None => self.params.push((name.to_ascii_lowercase(), value)),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.param("branch")
    }

    pub fn received(&self) -> Option<&str> {
        self.param("received")
    }

    /// Value of `rport`, `None` when absent or empty
    pub fn rport(&self) -> Option<u16> {
        self.param("rport").and_then(|p| p.parse().ok())
    }

    /// Default port for the transport when sent-by omits it
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.transport == "TLS" { 5061 } else { 5060 })
    }
}

impl fmt::Display for ViaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} ", self.transport)?;
        if self.host.contains(':') {
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

fn parse_port(port: Option<&str>) -> Result<Option<u16>, SipError> {
    match port {
        None => Ok(None),
        Some(p) => p
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SipError::InvalidMessage(format!("Bad Via port: {}", p))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_via() {
        let via = ViaHeader::parse("SIP/2.0/udp 10.0.0.5:5062;branch=z9hG4bK776;rport").unwrap();
        assert_eq!(via.transport, "UDP");
        assert_eq!(via.host, "10.0.0.5");
        assert_eq!(via.port, Some(5062));
        assert_eq!(via.branch(), Some("z9hG4bK776"));
        assert!(via.has_param("rport"));
        assert_eq!(via.rport(), None);
    }

    #[test]
    fn test_parse_ipv6_and_default_port() {
        let via = ViaHeader::parse("SIP/2.0/TLS [2001:db8::1];branch=z9hG4bKx").unwrap();
        assert_eq!(via.host, "2001:db8::1");
        assert_eq!(via.effective_port(), 5061);
        assert_eq!(via.to_string(), "SIP/2.0/TLS [2001:db8::1];branch=z9hG4bKx");
    }

    #[test]
    fn test_set_param_round_trips_through_display() {
        let mut via = ViaHeader::parse("SIP/2.0/UDP host.example.com;branch=z9hG4bK1;rport").unwrap();
        via.set_param("rport", Some("40000".to_string()));
        via.set_param("received", Some("203.0.113.7".to_string()));
        assert_eq!(
            via.to_string(),
            "SIP/2.0/UDP host.example.com;branch=z9hG4bK1;rport=40000;received=203.0.113.7"
        );
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(ViaHeader::parse("garbage").is_err());
        assert!(ViaHeader::parse("SIP/2.0/UDP host:notaport").is_err());
    }
}
