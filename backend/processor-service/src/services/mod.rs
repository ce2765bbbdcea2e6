//! Processing services: worker loop, publish bridge and the pool that runs them

pub mod bridge;
pub mod pool;
pub mod worker;

pub use bridge::{handoff_channel, PublishBridge};
pub use pool::WorkerPool;
pub use worker::{EventOutcome, PipelinePorts, Worker, WorkerSettings};
