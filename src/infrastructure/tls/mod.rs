/// TLS configuration for the SIP over TLS listener
pub mod config;

pub use config::{TlsConfig, TlsError};
