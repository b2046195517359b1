//! HTTP front end for the depot upload service.
//!
//! This crate provides:
//! - The tus 1.0 protocol handler (create, head, patch, get, delete,
//!   options, deferred length, concatenation)
//! - Identity and CORS middleware
//! - The lifecycle event bus
//! - The expiration garbage collector
//! - The admin query surface
//! - Prometheus metrics

pub mod cors;
pub mod error;
pub mod events;
pub mod expirer;
pub mod handlers;
pub mod ident;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use events::EventBus;
pub use expirer::Expirer;
pub use routes::{create_router, expirer_router};
pub use state::AppState;
