//! Interface layer - External interfaces
//!
//! This layer handles:
//! - The admin REST API (health, metrics, location lookup)
//! - Request/response formatting

pub mod api;
