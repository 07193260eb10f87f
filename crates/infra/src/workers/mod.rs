//! Background workers.

pub mod dispatch_loop;

pub use dispatch_loop::{DispatchConfig, DispatchHandle, DispatchLoop, DispatchStats, LoopState};
