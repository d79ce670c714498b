//! Admin HTTP API

pub mod dto;
pub mod location_handler;
pub mod metrics_handler;
pub mod router;

pub use location_handler::AppState;
pub use metrics_handler::init_metrics;
pub use router::build_router;
