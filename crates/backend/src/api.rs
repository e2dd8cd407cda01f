//! REST client for an AUTOMATIC1111-compatible diffusion server.
//!
//! Wraps the server's HTTP API (options, txt2img/img2img, upscale,
//! progress, interrupt, resource lists) using [`reqwest`] and implements
//! [`Backend`] and [`ResourceSource`] on top of it.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use easel_core::job::JobKind;
use serde_json::json;

use crate::backend::{
    Backend, BackendError, GenerationRequest, RefreshOutcome, ResolvedAuxiliary, ResourceSource,
};
use crate::catalog::{NamedResource, ResourceKind};
use crate::messages::{
    BackendConfig, CheckpointEntry, ConfigUpdate, ControlModelList, ControlModuleList,
    ControlTypeList, EmbeddingList, GenerationResponse, NamedEntry, Progress, UpscaleResponse,
    VaeEntry,
};

/// HTTP client for a single diffusion server.
pub struct StableDiffusionApi {
    client: reqwest::Client,
    api_url: String,
}

impl StableDiffusionApi {
    /// Create a new API client.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:7860`.
    /// * `request_timeout` - Upper bound on any single HTTP request,
    ///   including a full generation.
    pub fn new(api_url: impl Into<String>, request_timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    // ---- private helpers ----

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let response = self.client.get(self.url(path)).send().await?;
        Self::parse_response(response).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, BackendError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        Self::parse_response(response).await
    }

    async fn post_empty(&self, path: &str) -> Result<(), BackendError> {
        let response = self.client.post(self.url(path)).send().await?;
        Self::check_status(response).await
    }

    /// Ensure the response has a success status code, or turn it into a
    /// [`BackendError::Api`] carrying the status and body text.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(BackendError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BackendError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<(), BackendError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

/// Endpoint that runs a job of the given kind.
pub fn generation_endpoint(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Generate | JobKind::Reroll | JobKind::Variation | JobKind::Raw => {
            "/sdapi/v1/txt2img"
        }
        JobKind::ImageToImage => "/sdapi/v1/img2img",
        JobKind::Upscale => "/sdapi/v1/extra-single-image",
    }
}

/// Endpoint that lists resources of the given kind.
pub fn list_endpoint(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Checkpoint => "/sdapi/v1/sd-models",
        ResourceKind::Vae => "/sdapi/v1/sd-vae",
        ResourceKind::Hypernetwork => "/sdapi/v1/hypernetworks",
        ResourceKind::Embedding => "/sdapi/v1/embeddings",
        ResourceKind::Lora => "/sdapi/v1/loras",
        ResourceKind::ControlType => "/controlnet/control_types",
        ResourceKind::ControlModule => "/controlnet/module_list",
        ResourceKind::ControlModel => "/controlnet/model_list",
    }
}

/// Endpoint that rescans resources of the given kind, if the server has one.
pub fn refresh_endpoint(kind: ResourceKind) -> Option<&'static str> {
    match kind {
        ResourceKind::Checkpoint => Some("/sdapi/v1/refresh-checkpoints"),
        ResourceKind::Vae => Some("/sdapi/v1/refresh-vae"),
        ResourceKind::Embedding => Some("/sdapi/v1/refresh-embeddings"),
        ResourceKind::Lora => Some("/sdapi/v1/refresh-loras"),
        _ => None,
    }
}

/// Merge a resolved auxiliary unit into the request body under
/// `alwayson_scripts.controlnet.args`.
pub fn build_generation_body(
    payload: &serde_json::Value,
    auxiliary: Option<&ResolvedAuxiliary>,
) -> serde_json::Value {
    let mut body = payload.clone();
    let (Some(aux), Some(object)) = (auxiliary, body.as_object_mut()) else {
        return body;
    };

    let unit = json!({
        "enabled": true,
        "control_type": aux.control_type,
        "module": aux.module.as_deref().unwrap_or("none"),
        "model": aux.model,
    });
    let scripts = object
        .entry("alwayson_scripts")
        .or_insert_with(|| json!({}));
    if let Some(scripts) = scripts.as_object_mut() {
        scripts.insert("controlnet".to_string(), json!({ "args": [unit] }));
    }
    body
}

/// Decode base64 images, tolerating a `data:image/...;base64,` prefix.
pub fn decode_images(encoded: &[String]) -> Result<Vec<Vec<u8>>, BackendError> {
    encoded
        .iter()
        .enumerate()
        .map(|(index, data)| {
            let data = data.split_once(',').map_or(data.as_str(), |(_, rest)| rest);
            base64::engine::general_purpose::STANDARD
                .decode(data.trim())
                .map_err(|e| BackendError::Decode(format!("image {index}: {e}")))
        })
        .collect()
}

fn named_list(names: impl IntoIterator<Item = String>) -> Vec<NamedResource> {
    names
        .into_iter()
        .map(|name| NamedResource::new(name.clone(), name))
        .collect()
}

#[async_trait]
impl Backend for StableDiffusionApi {
    async fn ping(&self) -> Result<(), BackendError> {
        let response = self.client.get(self.url("/internal/ping")).send().await?;
        Self::check_status(response).await
    }

    async fn get_config(&self) -> Result<BackendConfig, BackendError> {
        self.get_json("/sdapi/v1/options").await
    }

    async fn update_config(&self, update: &ConfigUpdate) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url("/sdapi/v1/options"))
            .json(update)
            .send()
            .await?;
        Self::check_status(response).await
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Vec<u8>>, BackendError> {
        let endpoint = generation_endpoint(request.kind);
        let body = build_generation_body(&request.payload, request.auxiliary.as_ref());

        tracing::debug!(kind = %request.kind, endpoint, "Submitting generation");

        let images = if request.kind == JobKind::Upscale {
            let response: UpscaleResponse = self.post_json(endpoint, &body).await?;
            decode_images(std::slice::from_ref(&response.image))?
        } else {
            let response: GenerationResponse = self.post_json(endpoint, &body).await?;
            decode_images(&response.images)?
        };

        if images.is_empty() {
            return Err(BackendError::EmptyResult);
        }
        Ok(images)
    }

    async fn get_progress(&self) -> Result<Progress, BackendError> {
        self.get_json("/sdapi/v1/progress?skip_current_image=true")
            .await
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        self.post_empty("/sdapi/v1/interrupt").await
    }
}

#[async_trait]
impl ResourceSource for StableDiffusionApi {
    async fn list(&self, kind: ResourceKind) -> Result<Vec<NamedResource>, BackendError> {
        let path = list_endpoint(kind);
        let resources = match kind {
            ResourceKind::Checkpoint => {
                let entries: Vec<CheckpointEntry> = self.get_json(path).await?;
                entries.into_iter().map(NamedResource::from).collect()
            }
            ResourceKind::Vae => {
                let entries: Vec<VaeEntry> = self.get_json(path).await?;
                named_list(entries.into_iter().map(|entry| entry.model_name))
            }
            ResourceKind::Hypernetwork | ResourceKind::Lora => {
                let entries: Vec<NamedEntry> = self.get_json(path).await?;
                entries.into_iter().map(NamedResource::from).collect()
            }
            ResourceKind::Embedding => {
                let list: EmbeddingList = self.get_json(path).await?;
                named_list(list.loaded.into_iter().map(|(name, _)| name))
            }
            ResourceKind::ControlType => {
                let list: ControlTypeList = self.get_json(path).await?;
                named_list(list.control_types.into_iter().map(|(name, _)| name))
            }
            ResourceKind::ControlModule => {
                let list: ControlModuleList = self.get_json(path).await?;
                named_list(list.module_list)
            }
            ResourceKind::ControlModel => {
                let list: ControlModelList = self.get_json(path).await?;
                named_list(list.model_list)
            }
        };
        Ok(resources)
    }

    async fn refresh(&self, kind: ResourceKind) -> Result<RefreshOutcome, BackendError> {
        let Some(path) = refresh_endpoint(kind) else {
            return Ok(RefreshOutcome::Unsupported);
        };
        match self.post_empty(path).await {
            Ok(()) => Ok(RefreshOutcome::Refreshed),
            // Older servers lack some refresh routes.
            Err(BackendError::Api { status: 404, .. }) => Ok(RefreshOutcome::Unsupported),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
