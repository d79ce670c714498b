//! SIP registrar/proxy core
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Transport Listener    │
//! │     (UDP, TCP, TLS)     │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │     Request Router      │
//! │  (classify + pipeline)  │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Matcher   │
//! └─────┬─────────────┬─────┘
//!       │             │
//! ┌─────▼─────┐ ┌─────▼─────┐
//! │ Registrar │ │  Location │
//! │           │ │  + Relay  │
//! └───────────┘ └───────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod registrar;
pub mod relay;
pub mod router;
pub mod rport;
pub mod server;
pub mod transaction;
pub mod transport;
pub mod via;

pub use auth::{AuthChallenge, AuthOutcome, DigestAuth};
pub use dispatch::Dispatcher;
pub use error::RouteError;
pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use registrar::{Registrar, RegistrarConfig};
pub use relay::{Destination, Relay, RelayConfig};
pub use router::{classify, MessageClass, RequestRouter, RouteOutcome, RouterConfig, Stage};
pub use server::{SipServer, SipServerConfig};
pub use transaction::{
    SipTimers, Transaction, TransactionConfig, TransactionKey, TransactionLayer, TransactionState,
};
pub use transport::{
    IncomingMessage, ListenEndpoint, OutgoingMessage, SipTransport, Transport, TransportProtocol,
};
