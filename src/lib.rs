//! sipcore - SIP registrar and stateful proxy core
//!
//! Inbound SIP messages are classified and walked through an ordered
//! routing pipeline: access control, request sanity, transaction matching,
//! in-dialog routing, registration, location lookup and relay.

pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
