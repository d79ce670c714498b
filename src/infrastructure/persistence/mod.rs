//! Persistence implementations

pub mod memory;
#[cfg(feature = "postgres")]
pub mod database;
#[cfg(feature = "postgres")]
pub mod location_repository;
#[cfg(feature = "postgres")]
pub mod subscriber_repository;

pub use memory::{InMemoryLocationRepository, InMemorySubscriberRepository};
#[cfg(feature = "postgres")]
pub use database::{create_pool, mask_password, DatabaseConfig};
#[cfg(feature = "postgres")]
pub use location_repository::PgLocationRepository;
#[cfg(feature = "postgres")]
pub use subscriber_repository::PgSubscriberRepository;
