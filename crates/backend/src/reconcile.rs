//! Brings the backend's loaded models in line with what a job wants.
//!
//! Desired names are resolved through the catalogs, compared field by
//! field with the live [`BackendConfig`], and any differences are sent as
//! a single combined [`ConfigUpdate`]. The config is then re-read so the
//! job runs against the backend's authoritative state.

use std::sync::Arc;

use easel_core::selection::{AuxiliaryRequest, ModelSelection, UNLOAD_QUERY};

use crate::backend::{Backend, BackendError, ResolvedAuxiliary};
use crate::catalog::{Catalogs, ResourceKind, Resolution};
use crate::messages::{BackendConfig, ConfigUpdate};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A field the job cannot run without did not match any catalog entry.
    #[error("Required {kind} '{query}' could not be resolved")]
    RequiredUnresolved { kind: ResourceKind, query: String },
}

/// Compute the minimal update that turns `current` into `desired`.
///
/// `None` or empty desired fields mean "no preference" and never produce
/// an update. Returns `None` when nothing differs.
pub fn diff(desired: &BackendConfig, current: &BackendConfig) -> Option<ConfigUpdate> {
    fn field(desired: &Option<String>, current: &Option<String>) -> Option<String> {
        match desired.as_deref() {
            Some(want) if !want.is_empty() && current.as_deref() != Some(want) => {
                Some(want.to_string())
            }
            _ => None,
        }
    }

    let update = ConfigUpdate {
        checkpoint: field(&desired.checkpoint, &current.checkpoint),
        vae: field(&desired.vae, &current.vae),
        hypernetwork: field(&desired.hypernetwork, &current.hypernetwork),
    };
    (!update.is_empty()).then_some(update)
}

pub struct ModelReconciler {
    catalogs: Arc<Catalogs>,
}

impl ModelReconciler {
    pub fn new(catalogs: Arc<Catalogs>) -> Self {
        Self { catalogs }
    }

    pub fn catalogs(&self) -> &Arc<Catalogs> {
        &self.catalogs
    }

    /// Resolve every field of `selection` to a concrete backend value.
    ///
    /// Unresolvable fields are logged and left as "no preference".
    pub async fn resolve_selection(&self, selection: &ModelSelection) -> BackendConfig {
        BackendConfig {
            checkpoint: self
                .resolve_field(ResourceKind::Checkpoint, selection.checkpoint.as_deref())
                .await,
            vae: self
                .resolve_field(ResourceKind::Vae, selection.vae.as_deref())
                .await,
            hypernetwork: self
                .resolve_field(ResourceKind::Hypernetwork, selection.hypernetwork.as_deref())
                .await,
        }
    }

    /// Make the backend's loaded models match `selection`.
    ///
    /// Issues zero update calls when nothing differs and exactly one
    /// combined call otherwise. Returns the post-update config.
    pub async fn prepare(
        &self,
        backend: &dyn Backend,
        selection: &ModelSelection,
    ) -> Result<BackendConfig, ReconcileError> {
        let desired = self.resolve_selection(selection).await;
        let current = backend.get_config().await?;

        let Some(update) = diff(&desired, &current) else {
            tracing::debug!("Backend models already match request");
            return Ok(current);
        };

        tracing::info!(
            checkpoint = ?update.checkpoint,
            vae = ?update.vae,
            hypernetwork = ?update.hypernetwork,
            "Updating backend models",
        );
        backend.update_config(&update).await?;
        Ok(backend.get_config().await?)
    }

    /// Resolve an auxiliary (ControlNet) unit.
    ///
    /// Disabled requests resolve to `None`. When enabled, the control type
    /// and model are required; the module is best-effort.
    pub async fn resolve_auxiliary(
        &self,
        request: &AuxiliaryRequest,
    ) -> Result<Option<ResolvedAuxiliary>, ReconcileError> {
        if !request.enabled {
            return Ok(None);
        }

        let control_type = self
            .resolve_required(ResourceKind::ControlType, request.control_type.as_deref())
            .await?;
        let model = self
            .resolve_required(ResourceKind::ControlModel, request.model.as_deref())
            .await?;
        let module = self
            .resolve_field(ResourceKind::ControlModule, request.module.as_deref())
            .await;

        Ok(Some(ResolvedAuxiliary {
            control_type,
            module,
            model,
        }))
    }

    // ---- private helpers ----

    async fn resolve_field(&self, kind: ResourceKind, query: Option<&str>) -> Option<String> {
        let query = query?;
        match self.catalogs.get(kind).resolve(query).await {
            Ok(Resolution::UseCurrent) => None,
            Ok(Resolution::Unload) => Some(UNLOAD_QUERY.to_string()),
            Ok(Resolution::Resolved(found)) => Some(found.raw_identifier),
            Ok(Resolution::Unresolved) => {
                tracing::warn!(%kind, query, "Leaving unresolved model field unchanged");
                None
            }
            Err(e) => {
                tracing::warn!(%kind, query, error = %e, "Catalog unavailable, skipping field");
                None
            }
        }
    }

    async fn resolve_required(
        &self,
        kind: ResourceKind,
        query: Option<&str>,
    ) -> Result<String, ReconcileError> {
        let query = query.unwrap_or_default();
        let unresolved = || ReconcileError::RequiredUnresolved {
            kind,
            query: query.to_string(),
        };

        match self.catalogs.get(kind).resolve(query).await {
            Ok(Resolution::Resolved(found)) => Ok(found.raw_identifier),
            Ok(_) => Err(unresolved()),
            Err(e) => {
                tracing::warn!(%kind, query, error = %e, "Catalog unavailable for required field");
                Err(unresolved())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
