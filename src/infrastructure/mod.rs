//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Repository implementations (in-memory and PostgreSQL)
//! - The SIP protocol stack
//! - TLS acceptor setup
//! - Metric recording helpers

pub mod metrics;
pub mod persistence;
pub mod protocols;
pub mod tls;
