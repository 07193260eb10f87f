//! Tarantool IPROTO transport and the `queue` tube adapter built on it.

pub mod connection;
pub mod error;
pub mod protocol;
pub mod tube;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ConnectOptions, Connection};
pub use error::IprotoError;
pub use tube::TarantoolTube;
