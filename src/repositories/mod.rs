//! Query helpers shared by the services.
//!
//! Every function is generic over [`sea_orm::ConnectionTrait`], so the same
//! query runs against the pool or inside an open transaction.

pub mod cart_repository;
pub mod order_repository;
pub mod processed_event_repository;

pub use cart_repository::CartRepository;
pub use order_repository::OrderRepository;
pub use processed_event_repository::ProcessedEventRepository;
