//! Persistence collaborators fed by the dispatch loop.

pub mod deal_store;

pub use deal_store::{DealStore, InMemoryDealStore, register_deal_store};
