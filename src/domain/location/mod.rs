//! Location domain - address-of-record to contact bindings

pub mod binding;
pub mod repository;
pub mod service;

pub use binding::Binding;
pub use repository::LocationRepository;
pub use service::{BindingUpdate, LocationService, RegisterOutcome};
