//! Shared building blocks for the easel generation queue.
//!
//! Everything here is free of I/O: identifiers, the job state machine,
//! model-selection request types, the fuzzy name matcher used by the
//! resource catalogs, and the image compositor.

pub mod compositor;
pub mod error;
pub mod fuzzy;
pub mod job;
pub mod job_events;
pub mod selection;
pub mod types;
