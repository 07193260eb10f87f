//! Job queue client: publish enveloped events and take/ack them back.

pub mod codec;
pub mod consumer;
pub mod error;
pub mod job;
pub mod memory;
pub mod publisher;
pub mod tube;

pub use consumer::{AckMode, Consumer, Delivery};
pub use error::QueueError;
pub use job::{Job, JobState, MalformedJob};
pub use memory::InMemoryTube;
pub use publisher::Publisher;
pub use tube::Tube;
