//! Cached, refreshable catalogs of named backend resources.
//!
//! Each [`ResourceCatalog`] covers one [`ResourceKind`]. The first read
//! loads the list from the [`ResourceSource`]; concurrent first readers
//! wait on the same load instead of issuing their own (single-flight).
//! [`ResourceCatalog::refresh`] replaces the snapshot wholesale. Readers
//! always get an `Arc` to one immutable [`CatalogSnapshot`], so a fuzzy
//! resolution never observes a half-replaced list.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use easel_core::fuzzy::{self, Source};
use easel_core::selection::UNLOAD_QUERY;
use easel_core::types::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::backend::{BackendError, RefreshOutcome, ResourceSource};

// ---------------------------------------------------------------------------
// Resource kinds
// ---------------------------------------------------------------------------

/// Every kind of named resource a backend exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Checkpoint,
    Vae,
    Hypernetwork,
    Embedding,
    Lora,
    ControlType,
    ControlModule,
    ControlModel,
}

impl ResourceKind {
    /// All kinds, in the order [`Catalogs`] stores them.
    pub const ALL: [ResourceKind; 8] = [
        ResourceKind::Checkpoint,
        ResourceKind::Vae,
        ResourceKind::Hypernetwork,
        ResourceKind::Embedding,
        ResourceKind::Lora,
        ResourceKind::ControlType,
        ResourceKind::ControlModule,
        ResourceKind::ControlModel,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Checkpoint => "checkpoint",
            ResourceKind::Vae => "vae",
            ResourceKind::Hypernetwork => "hypernetwork",
            ResourceKind::Embedding => "embedding",
            ResourceKind::Lora => "lora",
            ResourceKind::ControlType => "control_type",
            ResourceKind::ControlModule => "control_module",
            ResourceKind::ControlModel => "control_model",
        }
    }

    /// Whether the backend can be asked to rescan this kind.
    ///
    /// Kinds without an endpoint fall back to plain cached reads on refresh.
    pub fn has_refresh_endpoint(self) -> bool {
        matches!(
            self,
            ResourceKind::Checkpoint
                | ResourceKind::Vae
                | ResourceKind::Embedding
                | ResourceKind::Lora
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One catalog entry: the name users search by and the identifier the
/// backend expects back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedResource {
    pub display_name: String,
    pub raw_identifier: String,
}

impl NamedResource {
    pub fn new(display_name: impl Into<String>, raw_identifier: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            raw_identifier: raw_identifier.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot + resolution
// ---------------------------------------------------------------------------

/// Result of resolving a user query against a catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Empty query: keep whatever the backend has loaded.
    UseCurrent,
    /// The query was [`UNLOAD_QUERY`]: explicitly unload the slot.
    Unload,
    /// Best fuzzy match.
    Resolved(NamedResource),
    /// Nothing matched; the caller leaves the field as it is.
    Unresolved,
}

/// Resolve the sentinel queries that never need a catalog lookup.
fn sentinel(query: &str) -> Option<Resolution> {
    if query.is_empty() {
        Some(Resolution::UseCurrent)
    } else if query == UNLOAD_QUERY {
        Some(Resolution::Unload)
    } else {
        None
    }
}

/// An immutable, fully-loaded list of resources of one kind.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub kind: ResourceKind,
    pub entries: Vec<NamedResource>,
    pub refreshed_at: Timestamp,
}

impl CatalogSnapshot {
    pub fn new(kind: ResourceKind, entries: Vec<NamedResource>) -> Self {
        Self {
            kind,
            entries,
            refreshed_at: Utc::now(),
        }
    }

    /// Resolve `query` against this snapshot.
    ///
    /// Highest fuzzy score wins; ties go to the earlier entry.
    pub fn resolve(&self, query: &str) -> Resolution {
        let query = query.trim();
        if let Some(resolution) = sentinel(query) {
            return resolution;
        }
        match fuzzy::best_match(query, self) {
            Some(found) => Resolution::Resolved(self.entries[found.index].clone()),
            None => {
                tracing::warn!(
                    kind = %self.kind,
                    query = %query,
                    "No catalog entry matches query",
                );
                Resolution::Unresolved
            }
        }
    }

    /// Up to `limit` best matches, for autocomplete.
    pub fn suggest(&self, query: &str, limit: usize) -> Vec<NamedResource> {
        let query = query.trim();
        if query.is_empty() {
            return self.entries.iter().take(limit).cloned().collect();
        }
        fuzzy::find_from(query, self)
            .into_iter()
            .take(limit)
            .map(|found| self.entries[found.index].clone())
            .collect()
    }
}

impl Source for CatalogSnapshot {
    fn string(&self, i: usize) -> &str {
        &self.entries[i].display_name
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// ResourceCatalog
// ---------------------------------------------------------------------------

/// Load state of a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
}

/// Lazily loaded cache of one resource kind.
pub struct ResourceCatalog {
    kind: ResourceKind,
    source: Arc<dyn ResourceSource>,
    snapshot: RwLock<Option<Arc<CatalogSnapshot>>>,
    /// Serializes loads and refreshes so only one backend call is in flight.
    /// Held for exactly as long as a load runs, so a load that is dropped
    /// midway never leaves the catalog reporting `Loading`.
    load_lock: Mutex<()>,
}

impl ResourceCatalog {
    pub fn new(kind: ResourceKind, source: Arc<dyn ResourceSource>) -> Self {
        Self {
            kind,
            source,
            snapshot: RwLock::new(None),
            load_lock: Mutex::new(()),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub async fn load_state(&self) -> LoadState {
        if self.load_lock.try_lock().is_err() {
            return LoadState::Loading;
        }
        match self.current().await {
            Some(_) => LoadState::Loaded,
            None => LoadState::Unloaded,
        }
    }

    /// When the current snapshot was fetched, if one exists.
    pub async fn refreshed_at(&self) -> Option<Timestamp> {
        self.snapshot
            .read()
            .await
            .as_ref()
            .map(|snapshot| snapshot.refreshed_at)
    }

    /// Return the loaded snapshot, loading it first if necessary.
    ///
    /// While a refresh is in flight the previous snapshot is still
    /// returned. A failed first load leaves the catalog `Unloaded`, so the
    /// next caller retries.
    pub async fn get_cache(&self) -> Result<Arc<CatalogSnapshot>, BackendError> {
        if let Some(snapshot) = self.current().await {
            return Ok(snapshot);
        }

        let _guard = self.load_lock.lock().await;
        // Another caller may have completed the load while we waited.
        if let Some(snapshot) = self.current().await {
            return Ok(snapshot);
        }
        self.load_locked().await
    }

    /// Ask the backend to rescan, then replace the snapshot.
    ///
    /// Kinds without a refresh endpoint (or backends that report the
    /// endpoint as unsupported) behave like [`get_cache`](Self::get_cache).
    pub async fn refresh(&self) -> Result<Arc<CatalogSnapshot>, BackendError> {
        let _guard = self.load_lock.lock().await;

        if self.kind.has_refresh_endpoint() {
            match self.source.refresh(self.kind).await? {
                RefreshOutcome::Refreshed => return self.load_locked().await,
                RefreshOutcome::Unsupported => {
                    tracing::debug!(kind = %self.kind, "Backend has no refresh for this kind");
                }
            }
        }

        match self.current().await {
            Some(snapshot) => Ok(snapshot),
            None => self.load_locked().await,
        }
    }

    /// Resolve a user query to a concrete entry.
    ///
    /// Sentinel queries (`""`, `"None"`) are answered without loading.
    pub async fn resolve(&self, query: &str) -> Result<Resolution, BackendError> {
        if let Some(resolution) = sentinel(query.trim()) {
            return Ok(resolution);
        }
        let snapshot = self.get_cache().await?;
        Ok(snapshot.resolve(query))
    }

    /// Autocomplete helper: up to `limit` entries ranked against `query`.
    pub async fn suggest(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<NamedResource>, BackendError> {
        Ok(self.get_cache().await?.suggest(query, limit))
    }

    // ---- private helpers ----

    async fn current(&self) -> Option<Arc<CatalogSnapshot>> {
        self.snapshot.read().await.clone()
    }

    /// Fetch the list and swap it in. Caller must hold `load_lock`.
    ///
    /// A failed load keeps whatever snapshot was there before.
    async fn load_locked(&self) -> Result<Arc<CatalogSnapshot>, BackendError> {
        match self.source.list(self.kind).await {
            Ok(entries) => {
                let snapshot = Arc::new(CatalogSnapshot::new(self.kind, entries));
                *self.snapshot.write().await = Some(Arc::clone(&snapshot));
                tracing::info!(
                    kind = %self.kind,
                    count = snapshot.entries.len(),
                    "Catalog loaded",
                );
                Ok(snapshot)
            }
            Err(e) => {
                tracing::warn!(kind = %self.kind, error = %e, "Failed to load catalog");
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Catalogs
// ---------------------------------------------------------------------------

/// One catalog per [`ResourceKind`], all backed by the same source.
///
/// Owned by whoever owns the backend; catalogs of different backends
/// share nothing.
pub struct Catalogs {
    catalogs: Vec<ResourceCatalog>,
}

impl Catalogs {
    pub fn new(source: Arc<dyn ResourceSource>) -> Self {
        let catalogs = ResourceKind::ALL
            .into_iter()
            .map(|kind| ResourceCatalog::new(kind, Arc::clone(&source)))
            .collect();
        Self { catalogs }
    }

    pub fn get(&self, kind: ResourceKind) -> &ResourceCatalog {
        &self.catalogs[kind.index()]
    }

    /// Refresh every catalog concurrently.
    ///
    /// Returns the entry count (or error) per kind; one failing kind does
    /// not stop the others.
    pub async fn refresh_all(&self) -> Vec<(ResourceKind, Result<usize, BackendError>)> {
        let refreshes = self.catalogs.iter().map(|catalog| async move {
            let result = catalog
                .refresh()
                .await
                .map(|snapshot| snapshot.entries.len());
            (catalog.kind(), result)
        });
        futures::future::join_all(refreshes).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
