//! Subscriber domain

pub mod entity;
pub mod repository;

pub use entity::Subscriber;
pub use repository::SubscriberRepository;
