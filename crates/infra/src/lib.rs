//! Infrastructure layer: Tarantool transport, job queue client, dispatch loop.
//!
//! - [`tarantool`]: IPROTO connection manager and the `queue` tube adapter
//! - [`queue`]: publisher/consumer over any [`queue::Tube`]
//! - [`workers`]: the cancellable dispatch loop
//! - [`read_model`]: persistence collaborators fed by the loop

pub mod config;
pub mod queue;
pub mod read_model;
pub mod tarantool;
pub mod workers;


pub use config::{ConfigError, QueueConfig};
