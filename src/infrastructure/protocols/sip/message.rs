//! SIP message types, parsing and header access

use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        method.to_string().parse().ok()
    }

    /// Methods whose initial request may establish a dialog
    pub fn creates_dialog(&self) -> bool {
        matches!(self, SipMethod::Invite | SipMethod::Subscribe | SipMethod::Refer)
    }
}

impl FromStr for SipMethod {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "REGISTER" => Ok(SipMethod::Register),
            "INVITE" => Ok(SipMethod::Invite),
            "ACK" => Ok(SipMethod::Ack),
            "CANCEL" => Ok(SipMethod::Cancel),
            "BYE" => Ok(SipMethod::Bye),
            "OPTIONS" => Ok(SipMethod::Options),
            "INFO" => Ok(SipMethod::Info),
            "UPDATE" => Ok(SipMethod::Update),
            "PRACK" => Ok(SipMethod::Prack),
            "SUBSCRIBE" => Ok(SipMethod::Subscribe),
            "NOTIFY" => Ok(SipMethod::Notify),
            "REFER" => Ok(SipMethod::Refer),
            "MESSAGE" => Ok(SipMethod::Message),
            "PUBLISH" => Ok(SipMethod::Publish),
            other => Err(SipError::InvalidMessage(format!("Unknown method: {}", other))),
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compact header forms (RFC 3261 section 7.3.3)
fn expand_compact(name: &str) -> &str {
    match name {
        "v" | "V" => "via",
        "f" | "F" => "from",
        "t" | "T" => "to",
        "i" | "I" => "call-id",
        "m" | "M" => "contact",
        "l" | "L" => "content-length",
        "c" | "C" => "content-type",
        "k" | "K" => "supported",
        _ => name,
    }
}

fn names_match(actual: &str, wanted: &str) -> bool {
    expand_compact(actual).eq_ignore_ascii_case(expand_compact(wanted))
}

/// Split a header into (name, value) through its wire form
fn split_header(header: &Header) -> Option<(String, String)> {
    let line = header.to_string();
    let (name, value) = line.split_once(':')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

/// Split a comma-separated header value, ignoring commas inside `<...>` or quotes
pub fn split_list(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;

    for ch in value.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' if !in_quotes && !in_angle => {
                let part = current.trim();
                if !part.is_empty() {
                    parts.push(part.to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }

    let part = current.trim();
    if !part.is_empty() {
        parts.push(part.to_string());
    }
    parts
}

/// Value of a header parameter (`;name=value`), outside any `<...>` URI
pub fn header_param(value: &str, name: &str) -> Option<String> {
    let params = match value.rfind('>') {
        Some(end) => &value[end + 1..],
        None => value.split_once(';').map(|(_, rest)| rest).unwrap_or(""),
    };
    params
        .split(';')
        .map(|p| {
            let p = p.trim();
            match p.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (p, ""),
            }
        })
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim_matches('"').to_string())
}

/// Read access to SIP headers shared by requests and responses
pub trait HeaderAccess {
    fn raw_headers(&self) -> &Headers;

    /// First value of the named header, unsplit
    fn header(&self, name: &str) -> Option<String> {
        self.raw_headers()
            .iter()
            .filter_map(split_header)
            .find(|(n, _)| names_match(n, name))
            .map(|(_, v)| v)
    }

    /// Every element of a list header (Via, Route, Record-Route, Contact) in order
    fn header_list(&self, name: &str) -> Vec<String> {
        self.raw_headers()
            .iter()
            .filter_map(split_header)
            .filter(|(n, _)| names_match(n, name))
            .flat_map(|(_, v)| split_list(&v))
            .collect()
    }

    fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    fn call_id(&self) -> Option<String> {
        self.header("Call-ID").filter(|v| !v.is_empty())
    }

    /// CSeq sequence number
    fn cseq(&self) -> Option<u32> {
        self.header("CSeq")
            .and_then(|v| v.split_whitespace().next().and_then(|n| n.parse().ok()))
    }

    /// Method named in the CSeq header
    fn cseq_method(&self) -> Option<String> {
        self.header("CSeq")
            .and_then(|v| v.split_whitespace().nth(1).map(|m| m.to_string()))
    }

    fn from_header(&self) -> Option<String> {
        self.header("From")
    }

    fn to_header(&self) -> Option<String> {
        self.header("To")
    }

    fn from_tag(&self) -> Option<String> {
        self.from_header().and_then(|v| header_param(&v, "tag"))
    }

    fn to_tag(&self) -> Option<String> {
        self.to_header()
            .and_then(|v| header_param(&v, "tag"))
            .filter(|t| !t.is_empty())
    }

    fn vias(&self) -> Vec<String> {
        self.header_list("Via")
    }

    fn top_via(&self) -> Option<String> {
        self.vias().into_iter().next()
    }

    /// Branch parameter of the top Via
    fn branch(&self) -> Option<String> {
        self.top_via().and_then(|via| header_param(&via, "branch"))
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn method_name(&self) -> String {
        self.inner.method.to_string()
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn uri_string(&self) -> String {
        self.inner.uri.to_string()
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    /// Max-Forwards value; `Ok(None)` when absent, error when not a number
    pub fn max_forwards(&self) -> Result<Option<u32>, SipError> {
        match self.header("Max-Forwards") {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| SipError::InvalidMessage(format!("Bad Max-Forwards: {}", value))),
        }
    }

    /// Header-level Expires value
    pub fn expires(&self) -> Option<u32> {
        self.header("Expires").and_then(|v| v.parse().ok())
    }

    pub fn contacts(&self) -> Vec<String> {
        self.header_list("Contact")
    }

    pub fn routes(&self) -> Vec<String> {
        self.header_list("Route")
    }

    pub fn authorization(&self) -> Option<String> {
        self.header("Authorization")
    }

    pub fn user_agent(&self) -> Option<String> {
        self.header("User-Agent")
    }

    /// Copy of this request with a new request-URI
    pub fn with_uri(&self, uri: Uri) -> Self {
        let mut inner = self.inner.clone();
        inner.uri = uri;
        Self::new(inner)
    }

    /// Insert a Via above the current top Via
    pub fn push_via(&mut self, via: &str) {
        edit_list_header(
            &mut self.inner.headers,
            "Via",
            |values| values.insert(0, via.to_string()),
            |v| Header::Via(v.into()),
        );
    }

    pub fn replace_top_via(&mut self, via: &str) {
        edit_list_header(
            &mut self.inner.headers,
            "Via",
            |values| match values.first_mut() {
                Some(top) => *top = via.to_string(),
                None => values.push(via.to_string()),
            },
            |v| Header::Via(v.into()),
        );
    }

    /// Remove and return the topmost Route entry
    pub fn pop_route(&mut self) -> Option<String> {
        let mut popped = None;
        edit_list_header(
            &mut self.inner.headers,
            "Route",
            |values| {
                if !values.is_empty() {
                    popped = Some(values.remove(0));
                }
            },
            |v| Header::Route(v.into()),
        );
        popped
    }

    pub fn push_record_route(&mut self, record_route: &str) {
        edit_list_header(
            &mut self.inner.headers,
            "Record-Route",
            |values| values.insert(0, record_route.to_string()),
            |v| Header::RecordRoute(v.into()),
        );
    }

    pub fn set_max_forwards(&mut self, value: u32) {
        let mut headers: Vec<Header> = self
            .inner
            .headers
            .iter()
            .filter(|h| {
                split_header(h)
                    .map(|(n, _)| !names_match(&n, "Max-Forwards"))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        let position = headers
            .iter()
            .rposition(|h| {
                split_header(h)
                    .map(|(n, _)| names_match(&n, "Via"))
                    .unwrap_or(false)
            })
            .map(|p| p + 1)
            .unwrap_or(0);
        headers.insert(position, Header::MaxForwards(value.to_string().as_str().into()));
        self.inner.headers = headers.into();
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl HeaderAccess for SipRequest {
    fn raw_headers(&self) -> &Headers {
        &self.inner.headers
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code() < 200
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    /// Remove and return the top Via
    pub fn pop_via(&mut self) -> Option<String> {
        let mut popped = None;
        edit_list_header(
            &mut self.inner.headers,
            "Via",
            |values| {
                if !values.is_empty() {
                    popped = Some(values.remove(0));
                }
            },
            |v| Header::Via(v.into()),
        );
        popped
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl HeaderAccess for SipResponse {
    fn raw_headers(&self) -> &Headers {
        &self.inner.headers
    }
}

/// Rewrite every occurrence of a list header as one line per element,
/// keeping the position of its first occurrence
fn edit_list_header<F, M>(headers: &mut Headers, name: &str, edit: F, make: M)
where
    F: FnOnce(&mut Vec<String>),
    M: Fn(&str) -> Header,
{
    let mut kept: Vec<Header> = Vec::new();
    let mut values: Vec<String> = Vec::new();
    let mut position = None;

    for header in headers.iter() {
        match split_header(header) {
            Some((n, v)) if names_match(&n, name) => {
                position.get_or_insert(kept.len());
                values.extend(split_list(&v));
            }
            _ => kept.push(header.clone()),
        }
    }

    edit(&mut values);

    let position = position.unwrap_or(0);
    for (offset, value) in values.iter().enumerate() {
        kept.insert(position + offset, make(value));
    }
    *headers = kept.into();
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // Status lines start with the protocol version
        if data.starts_with(b"SIP/") {
            return SipResponse::parse(data).map(SipMessage::Response);
        }
        SipRequest::parse(data).map(SipMessage::Request)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &[u8] = b"INVITE sip:bob@example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKfirst, SIP/2.0/UDP 10.0.0.9:5060;branch=z9hG4bKsecond\r\n\
        Max-Forwards: 70\r\n\
        Route: <sip:proxy.example.com;lr>, <sip:edge.example.com;lr>\r\n\
        From: \"Alice, A.\" <sip:alice@example.com>;tag=1928301774\r\n\
        To: <sip:bob@example.com>\r\n\
        Call-ID: a84b4c76e66710@pc33.example.com\r\n\
        CSeq: 314159 INVITE\r\n\
        Contact: <sip:alice@10.0.0.5:5060>\r\n\
        Content-Length: 0\r\n\r\n";

    fn invite() -> SipRequest {
        match SipMessage::parse(INVITE).unwrap() {
            SipMessage::Request(req) => req,
            SipMessage::Response(_) => panic!("expected request"),
        }
    }

    #[test]
    fn test_parse_register_request() {
        let data = b"REGISTER sip:registrar.example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Alice <sip:alice@example.com>\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 REGISTER\r\n\
                     Contact: <sip:alice@192.168.1.100:5060>;expires=60\r\n\
                     Expires: 3600\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert!(msg.is_request());

        let req = msg.as_request().unwrap();
        assert_eq!(req.method(), Some(SipMethod::Register));
        assert_eq!(req.call_id(), Some("a84b4c76e66710@pc33.example.com".to_string()));
        assert_eq!(req.cseq(), Some(314159));
        assert_eq!(req.cseq_method().as_deref(), Some("REGISTER"));
        assert_eq!(req.expires(), Some(3600));
        assert_eq!(req.contacts(), vec!["<sip:alice@192.168.1.100:5060>;expires=60"]);
        assert_eq!(req.to_tag(), None);
        assert_eq!(req.from_tag().as_deref(), Some("1928301774"));
    }

    #[test]
    fn test_parse_response() {
        let data = b"SIP/2.0 200 OK\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Alice <sip:alice@example.com>;tag=a6c85cf\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 REGISTER\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert!(msg.is_response());

        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status_code(), 200);
        assert_eq!(resp.to_tag().as_deref(), Some("a6c85cf"));
        assert_eq!(resp.branch().as_deref(), Some("z9hG4bK776asdhds"));
    }

    #[test]
    fn test_via_list_and_branch() {
        let req = invite();
        assert_eq!(req.vias().len(), 2);
        assert_eq!(req.branch().as_deref(), Some("z9hG4bKfirst"));
        assert_eq!(req.max_forwards().unwrap(), Some(70));
    }

    #[test]
    fn test_quoted_comma_does_not_split() {
        assert_eq!(
            split_list("\"Alice, A.\" <sip:alice@example.com>, <sip:bob@example.com>"),
            vec!["\"Alice, A.\" <sip:alice@example.com>", "<sip:bob@example.com>"]
        );
    }

    #[test]
    fn test_push_via_and_pop_route() {
        let mut req = invite();
        req.push_via("SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKproxy;rport");
        assert_eq!(req.vias().len(), 3);
        assert_eq!(req.branch().as_deref(), Some("z9hG4bKproxy"));

        assert_eq!(req.pop_route().as_deref(), Some("<sip:proxy.example.com;lr>"));
        assert_eq!(req.routes(), vec!["<sip:edge.example.com;lr>"]);

        // The rewritten request still parses
        let reparsed = SipRequest::parse(&req.to_bytes()).unwrap();
        assert_eq!(reparsed.vias().len(), 3);
    }

    #[test]
    fn test_set_max_forwards() {
        let mut req = invite();
        req.set_max_forwards(69);
        assert_eq!(req.max_forwards().unwrap(), Some(69));
        assert_eq!(req.header_list("Max-Forwards").len(), 1);
    }

    #[test]
    fn test_header_param() {
        assert_eq!(
            header_param("<sip:bob@example.com;transport=tcp>;tag=abc", "tag").as_deref(),
            Some("abc")
        );
        assert_eq!(header_param("<sip:bob@example.com;tag=uri>", "tag"), None);
        assert_eq!(
            header_param("SIP/2.0/UDP host;branch=z9hG4bK1;rport", "rport").as_deref(),
            Some("")
        );
    }

    #[test]
    fn test_unparseable_input_is_an_error() {
        assert!(SipMessage::parse(b"hello world").is_err());
    }
}
