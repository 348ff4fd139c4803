//! bf-core: shared types, IDs, errors, configuration, and the event relay.
//!
//! This crate is the foundational dependency for the other bf-* crates,
//! providing the type-safe job identifier, a unified error type, application
//! configuration, and the per-job progress-event relay.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::JobId;
