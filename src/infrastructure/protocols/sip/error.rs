//! Routing errors and their SIP answers

use super::auth::AuthChallenge;
use super::builder::ResponseBuilder;
use super::message::{SipError, SipRequest, SipResponse};
use crate::domain::access_control::AccessDenied;
use crate::domain::DomainError;
use thiserror::Error;

/// Everything that stops a request short of being relayed.
///
/// The router turns each variant into a response; none of them escape it.
#[derive(Error, Debug, Clone)]
pub enum RouteError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Too many hops")]
    HopLimitExceeded,

    #[error("Request-URI has no user part")]
    AddressIncomplete,

    #[error("Not found: {0}")]
    NotFound(String),

    /// In-dialog request this proxy has no route for
    #[error("Not here: {0}")]
    NotHere(String),

    #[error("Authentication required")]
    AuthenticationRequired(AuthChallenge),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Access denied: {}", .0.as_str())]
    Forbidden(AccessDenied),

    #[error("Transaction table exhausted")]
    TransactionResourceExhausted,

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Destination known but unreachable as given
    #[error("Temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),

    /// Persistence or another collaborator failed
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("No response from downstream")]
    Timeout,
}

impl RouteError {
    pub fn status_code(&self) -> u16 {
        match self {
            RouteError::MalformedMessage(_) => 400,
            RouteError::AuthenticationRequired(_) => 401,
            RouteError::AuthenticationFailed(_) | RouteError::Forbidden(_) => 403,
            RouteError::NotFound(_) | RouteError::NotHere(_) => 404,
            RouteError::Timeout => 408,
            RouteError::TemporarilyUnavailable(_) => 480,
            RouteError::HopLimitExceeded => 483,
            RouteError::AddressIncomplete => 484,
            RouteError::TransactionResourceExhausted
            | RouteError::TransportFailure(_)
            | RouteError::Unavailable(_) => 503,
        }
    }

    /// Build the answer for `request`
    pub fn to_response(&self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let builder = ResponseBuilder::new(self.status_code());
        let builder = match self {
            RouteError::AuthenticationRequired(challenge) => {
                builder.raw_header("WWW-Authenticate", challenge.to_header_value())
            }
            RouteError::Forbidden(denied) => builder.reason(denied.reason_phrase()),
            RouteError::NotHere(_) => builder.reason("Not Here"),
            _ => builder,
        };
        builder.build_for_request(request)
    }
}

impl From<DomainError> for RouteError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidUri(msg) | DomainError::ValidationError(msg) => {
                RouteError::MalformedMessage(msg)
            }
            DomainError::NotFound(msg) => RouteError::NotFound(msg),
            DomainError::StorageUnavailable(msg) | DomainError::Internal(msg) => {
                RouteError::Unavailable(msg)
            }
        }
    }
}
