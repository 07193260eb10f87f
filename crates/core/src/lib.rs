//! `dealq-core`: primitives shared by the queue client and the event layer.
//!
//! This crate contains **pure** types (no IO, no async).

pub mod error;
pub mod id;
pub mod tube;
pub mod value_object;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use tube::TubeName;
pub use value_object::ValueObject;
