//! Wire types for the diffusion server's JSON API.
//!
//! Field names follow the server (`sd_model_checkpoint`, `eta_relative`,
//! ...); unknown fields are ignored so newer server versions keep
//! deserializing.

use serde::{Deserialize, Serialize};

use crate::catalog::NamedResource;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Model identifiers the backend currently has loaded.
///
/// Read fresh for every job; never cached across jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "sd_model_checkpoint", default)]
    pub checkpoint: Option<String>,
    #[serde(rename = "sd_vae", default)]
    pub vae: Option<String>,
    #[serde(rename = "sd_hypernetwork", default)]
    pub hypernetwork: Option<String>,
}

/// Partial options update. Only `Some` fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigUpdate {
    #[serde(rename = "sd_model_checkpoint", skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    #[serde(rename = "sd_vae", skip_serializing_if = "Option::is_none")]
    pub vae: Option<String>,
    #[serde(rename = "sd_hypernetwork", skip_serializing_if = "Option::is_none")]
    pub hypernetwork: Option<String>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.checkpoint.is_none() && self.vae.is_none() && self.hypernetwork.is_none()
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Snapshot returned by the progress endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Completion fraction reported by the server.
    #[serde(default)]
    pub progress: f64,
    /// Estimated seconds remaining.
    #[serde(default)]
    pub eta_relative: f64,
    #[serde(default)]
    pub state: ProgressState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    #[serde(default)]
    pub job_count: i32,
    #[serde(default)]
    pub sampling_step: i32,
    #[serde(default)]
    pub sampling_steps: i32,
}

impl Progress {
    /// Completion fraction clamped to `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.progress.is_finite() {
            self.progress.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Completion percentage (0-100).
    pub fn percent(&self) -> i16 {
        (self.fraction() * 100.0).round() as i16
    }

    /// Remaining time in whole seconds, if the server gave a usable estimate.
    pub fn eta_secs(&self) -> Option<u64> {
        (self.eta_relative.is_finite() && self.eta_relative > 0.0)
            .then(|| self.eta_relative.round() as u64)
    }
}

// ---------------------------------------------------------------------------
// Generation responses
// ---------------------------------------------------------------------------

/// Response of the txt2img / img2img endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationResponse {
    /// Base64-encoded images.
    #[serde(default)]
    pub images: Vec<String>,
}

/// Response of the single-image upscale endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct UpscaleResponse {
    pub image: String,
}

// ---------------------------------------------------------------------------
// Resource lists
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointEntry {
    /// Full title including hash, e.g. `anything-v4.5.safetensors [abcd1234]`.
    pub title: String,
    pub model_name: String,
}

impl From<CheckpointEntry> for NamedResource {
    fn from(entry: CheckpointEntry) -> Self {
        NamedResource::new(entry.model_name, entry.title)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VaeEntry {
    pub model_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedEntry {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
}

impl From<NamedEntry> for NamedResource {
    fn from(entry: NamedEntry) -> Self {
        let display = entry
            .alias
            .filter(|alias| !alias.is_empty())
            .unwrap_or_else(|| entry.name.clone());
        NamedResource::new(display, entry.name)
    }
}

/// Keyed by name. Key order is the server's order because the workspace
/// enables serde_json's `preserve_order`.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingList {
    #[serde(default)]
    pub loaded: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlTypeList {
    #[serde(default)]
    pub control_types: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlModuleList {
    #[serde(default)]
    pub module_list: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlModelList {
    #[serde(default)]
    pub model_list: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
