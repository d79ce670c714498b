//! Domain layer - Core business logic and rules
//!
//! This layer contains:
//! - Entities: location bindings and subscribers
//! - Value Objects: SIP URIs and address-of-record normalization
//! - Domain Services: registration/resolution and source access control
//! - Repository Interfaces: Ports for persistence

pub mod access_control;
pub mod location;
pub mod shared;
pub mod subscriber;

// Re-export commonly used types
pub use shared::{DomainError, Result};
