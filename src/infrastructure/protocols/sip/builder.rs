//! SIP response builder

use super::message::{header_param, HeaderAccess, SipError, SipRequest, SipResponse};
use rand::Rng;
use rsip::{Header, Headers, Response, StatusCode, Version};

/// Random tag for To/From headers
pub fn generate_tag() -> String {
    let value: u64 = rand::thread_rng().gen();
    format!("{:x}", value)
}

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    headers: Vec<Header>,
    body: Vec<u8>,
    to_tag: Option<String>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            body: Vec::new(),
            to_tag: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn unauthorized() -> Self {
        Self::new(401)
    }

    pub fn forbidden() -> Self {
        Self::new(403)
    }

    pub fn not_found() -> Self {
        Self::new(404)
    }

    pub fn service_unavailable() -> Self {
        Self::new(503)
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    /// Append a header by name, for headers rsip has no dedicated variant for
    pub fn raw_header(self, name: &str, value: impl Into<String>) -> Self {
        self.header(Header::Other(name.to_string(), value.into()))
    }

    /// Explanatory text carried in a Reason header (RFC 3326)
    pub fn reason(self, text: &str) -> Self {
        let code = self.status_code;
        self.raw_header("Reason", format!("SIP;cause={};text=\"{}\"", code, text))
    }

    /// Use a fixed To tag instead of a random one
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    /// Copy Via, From, To, Call-ID and CSeq from the request.
    ///
    /// Fails when the request lacks the headers a response needs to find
    /// its way back.
    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let vias = request.vias();
        if vias.is_empty() {
            return Err(SipError::MissingHeader("Via"));
        }
        let from = request.from_header().ok_or(SipError::MissingHeader("From"))?;
        let mut to = request.to_header().ok_or(SipError::MissingHeader("To"))?;
        let call_id = request.call_id().ok_or(SipError::MissingHeader("Call-ID"))?;
        let cseq = request.header("CSeq").ok_or(SipError::MissingHeader("CSeq"))?;

        if self.status_code > 100 && header_param(&to, "tag").is_none() {
            let tag = self.to_tag.clone().unwrap_or_else(generate_tag);
            to = format!("{};tag={}", to, tag);
        }

        let mut headers: Vec<Header> = vias.iter().map(|v| Header::Via(v.as_str().into())).collect();
        headers.push(Header::From(from.as_str().into()));
        headers.push(Header::To(to.as_str().into()));
        headers.push(Header::CallId(call_id.as_str().into()));
        headers.push(Header::CSeq(cseq.as_str().into()));
        headers.extend(self.headers);
        headers.push(Header::ContentLength(
            self.body.len().to_string().as_str().into(),
        ));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register() -> SipRequest {
        SipRequest::parse(
            b"REGISTER sip:example.com SIP/2.0\r\n\
              Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bK1;received=10.0.0.5;rport=5060\r\n\
              From: <sip:alice@example.com>;tag=abc\r\n\
              To: <sip:alice@example.com>\r\n\
              Call-ID: reg-1\r\n\
              CSeq: 2 REGISTER\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap()
    }

    #[test]
    fn test_build_copies_dialog_headers() {
        let response = ResponseBuilder::ok().build_for_request(&register()).unwrap();

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.call_id().as_deref(), Some("reg-1"));
        assert_eq!(response.cseq(), Some(2));
        assert_eq!(response.branch().as_deref(), Some("z9hG4bK1"));
        assert_eq!(response.from_tag().as_deref(), Some("abc"));
        assert!(response.to_tag().is_some());
    }

    #[test]
    fn test_fixed_to_tag_and_reason() {
        let response = ResponseBuilder::forbidden()
            .reason("Too Many Requests")
            .to_tag("fixed")
            .build_for_request(&register())
            .unwrap();

        assert_eq!(response.to_tag().as_deref(), Some("fixed"));
        assert!(response.header("Reason").unwrap().contains("Too Many Requests"));
    }

    #[test]
    fn test_trying_has_no_to_tag() {
        let response = ResponseBuilder::new(100).build_for_request(&register()).unwrap();
        assert_eq!(response.to_tag(), None);
    }

    #[test]
    fn test_missing_headers_are_reported() {
        let request = SipRequest::parse(
            b"OPTIONS sip:example.com SIP/2.0\r\n\
              Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bK1\r\n\
              From: <sip:alice@example.com>;tag=abc\r\n\
              To: <sip:example.com>\r\n\
              CSeq: 1 OPTIONS\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap();
        assert!(matches!(
            ResponseBuilder::ok().build_for_request(&request),
            Err(SipError::MissingHeader("Call-ID"))
        ));
    }
}
