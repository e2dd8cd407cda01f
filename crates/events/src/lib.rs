//! Queue lifecycle events.
//!
//! - [`EventBus`] is an in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`QueueEvent`] is the envelope the queue publishes for every job
//!   transition and progress tick.

pub mod bus;

pub use bus::{EventBus, QueueEvent, QueueEventKind};
