//! Behavioural contract of a generation backend.
//!
//! The queue only talks to a backend through [`Backend`]; catalogs only
//! talk to it through [`ResourceSource`]. Transport and wire format live
//! in the implementations (see [`crate::api::StableDiffusionApi`]).

use async_trait::async_trait;
use easel_core::job::JobKind;
use serde::{Deserialize, Serialize};

use crate::catalog::{NamedResource, ResourceKind};
use crate::messages::{BackendConfig, ConfigUpdate, Progress};

/// Errors from talking to a backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("Backend API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The response body could not be interpreted.
    #[error("Malformed backend response: {0}")]
    Decode(String),

    /// A generation call succeeded but carried no images.
    #[error("Backend returned no images")]
    EmptyResult,
}

/// Outcome of asking the backend to rescan a resource directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// The backend has no refresh endpoint for this kind.
    Unsupported,
}

/// A resolved auxiliary conditioning unit attached to a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAuxiliary {
    pub control_type: String,
    pub module: Option<String>,
    pub model: String,
}

/// Everything a backend needs to run one job.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub kind: JobKind,
    /// Backend-specific parameters, passed through untouched.
    pub payload: serde_json::Value,
    pub auxiliary: Option<ResolvedAuxiliary>,
}

/// A generation service that can run one request at a time.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Cheap liveness probe used before accepting new work.
    async fn ping(&self) -> Result<(), BackendError>;

    /// Models the backend currently has loaded.
    async fn get_config(&self) -> Result<BackendConfig, BackendError>;

    /// Apply a partial configuration change in one call.
    async fn update_config(&self, update: &ConfigUpdate) -> Result<(), BackendError>;

    /// Run a generation and return the encoded result images.
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Vec<u8>>, BackendError>;

    async fn get_progress(&self) -> Result<Progress, BackendError>;

    /// Ask the backend to abandon whatever it is running right now.
    async fn interrupt(&self) -> Result<(), BackendError>;
}

/// Lists and rescans named resources (checkpoints, VAEs, ...).
#[async_trait]
pub trait ResourceSource: Send + Sync {
    async fn list(&self, kind: ResourceKind) -> Result<Vec<NamedResource>, BackendError>;

    async fn refresh(&self, kind: ResourceKind) -> Result<RefreshOutcome, BackendError>;
}
