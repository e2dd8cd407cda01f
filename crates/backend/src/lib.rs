//! Generation backend collaborators.
//!
//! Defines the behavioural contract the queue depends on ([`Backend`],
//! [`ResourceSource`]), an HTTP implementation for AUTOMATIC1111-style
//! diffusion servers, the per-kind resource catalogs with fuzzy name
//! resolution, and the reconciler that brings the backend's loaded
//! models in line with what a job asks for.

pub mod api;
pub mod backend;
pub mod catalog;
pub mod messages;
pub mod readiness;
pub mod reconcile;

pub use backend::{Backend, BackendError, GenerationRequest, ResourceSource};
pub use catalog::{Catalogs, ResourceCatalog, ResourceKind};
pub use reconcile::ModelReconciler;
