use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use studytrace_common::{AppModule, StudyTraceError};

/// Resolves a logical (organization, app module, template) triple to the
/// store's current entity-set id for that type.
///
/// `Ok(None)` means the organization has no set configured for the template —
/// a configuration gap the caller surfaces as `NotConfigured`, never a panic.
#[async_trait]
pub trait EntitySetDirectory: Send + Sync {
    async fn entity_set_id(
        &self,
        organization: Option<Uuid>,
        module: AppModule,
        template: &str,
    ) -> Result<Option<Uuid>, StudyTraceError>;
}

// --- Legacy (global) directory ---

/// The pre-organization directory: one global set per template, the
/// organization argument is ignored. Kept as its own implementation so the
/// legacy entry points are just the scoped ones with organization fixed to
/// "none".
pub struct LegacyDirectory {
    sets: HashMap<(AppModule, String), Uuid>,
}

impl LegacyDirectory {
    pub fn new(sets: impl IntoIterator<Item = (AppModule, String, Uuid)>) -> Self {
        Self {
            sets: sets
                .into_iter()
                .map(|(module, template, id)| ((module, template), id))
                .collect(),
        }
    }
}

#[async_trait]
impl EntitySetDirectory for LegacyDirectory {
    async fn entity_set_id(
        &self,
        _organization: Option<Uuid>,
        module: AppModule,
        template: &str,
    ) -> Result<Option<Uuid>, StudyTraceError> {
        Ok(self.sets.get(&(module, template.to_string())).copied())
    }
}

// --- Organization-scoped cached directory ---

/// Loads the full (organization, module, template) → set-id mapping from
/// wherever the deployment keeps installation metadata.
#[async_trait]
pub trait DirectorySource: Send + Sync {
    async fn load(
        &self,
    ) -> Result<HashMap<(Uuid, AppModule, String), Uuid>, StudyTraceError>;
}

struct DirectorySnapshot {
    sets: HashMap<(Uuid, AppModule, String), Uuid>,
    loaded_at: Instant,
}

/// Read-through directory holding an immutable snapshot of the mapping.
/// Lookups never block behind a refresh; a stale snapshot is served until the
/// TTL passes and the next lookup swaps in a fresh one. A failed refresh
/// keeps the previous snapshot and logs.
pub struct CachedDirectory {
    source: Arc<dyn DirectorySource>,
    snapshot: ArcSwap<DirectorySnapshot>,
    ttl: Duration,
}

impl CachedDirectory {
    /// Load the initial snapshot. Fails if the very first load fails — there
    /// is nothing stale to fall back on yet.
    pub async fn load(
        source: Arc<dyn DirectorySource>,
        ttl: Duration,
    ) -> Result<Self, StudyTraceError> {
        let sets = source.load().await?;
        info!(entries = sets.len(), "loaded entity-set directory");
        Ok(Self {
            source,
            snapshot: ArcSwap::new(Arc::new(DirectorySnapshot {
                sets,
                loaded_at: Instant::now(),
            })),
            ttl,
        })
    }

    /// Force a reload regardless of age.
    pub async fn refresh(&self) -> Result<(), StudyTraceError> {
        let sets = self.source.load().await?;
        self.snapshot.store(Arc::new(DirectorySnapshot {
            sets,
            loaded_at: Instant::now(),
        }));
        Ok(())
    }

    async fn refresh_if_stale(&self) {
        if self.snapshot.load().loaded_at.elapsed() < self.ttl {
            return;
        }
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "directory refresh failed, serving stale snapshot");
        }
    }
}

#[async_trait]
impl EntitySetDirectory for CachedDirectory {
    async fn entity_set_id(
        &self,
        organization: Option<Uuid>,
        module: AppModule,
        template: &str,
    ) -> Result<Option<Uuid>, StudyTraceError> {
        let Some(organization) = organization else {
            return Ok(None);
        };
        self.refresh_if_stale().await;
        let snapshot = self.snapshot.load();
        Ok(snapshot
            .sets
            .get(&(organization, module, template.to_string()))
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        loads: AtomicUsize,
        org: Uuid,
        set: Uuid,
    }

    #[async_trait]
    impl DirectorySource for CountingSource {
        async fn load(
            &self,
        ) -> Result<HashMap<(Uuid, AppModule, String), Uuid>, StudyTraceError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(HashMap::from([(
                (self.org, AppModule::DataCollection, "user_app".to_string()),
                self.set,
            )]))
        }
    }

    #[tokio::test]
    async fn fresh_snapshot_is_served_without_reloading() {
        let org = Uuid::from_u128(7);
        let set = Uuid::from_u128(8);
        let source = Arc::new(CountingSource {
            loads: AtomicUsize::new(0),
            org,
            set,
        });
        let directory = CachedDirectory::load(source.clone(), Duration::from_secs(3600))
            .await
            .unwrap();

        for _ in 0..5 {
            let found = directory
                .entity_set_id(Some(org), AppModule::DataCollection, "user_app")
                .await
                .unwrap();
            assert_eq!(found, Some(set));
        }
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_template_is_a_gap_not_an_error() {
        let org = Uuid::from_u128(7);
        let source = Arc::new(CountingSource {
            loads: AtomicUsize::new(0),
            org,
            set: Uuid::from_u128(8),
        });
        let directory = CachedDirectory::load(source, Duration::from_secs(3600))
            .await
            .unwrap();
        let found = directory
            .entity_set_id(Some(org), AppModule::Surveys, "question")
            .await
            .unwrap();
        assert_eq!(found, None);
    }
}
