//! Request interception.
//!
//! A `Worker` is one deployed version: it routes each request to a strategy
//! and guarantees a response. `Registration` owns the versions and moves
//! them through the lifecycle in `lifecycle`.

pub mod lifecycle;
mod registration;
mod worker;

pub use lifecycle::{Effect, LifecycleEvent, WorkerState};
pub use registration::Registration;
pub use worker::Worker;
