use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use studytrace_common::{EntityKey, StudyTraceError};

use crate::store::GraphStore;

/// Resolves every pending key of a shape in one store round trip. Batches may
/// carry hundreds of keys; issuing one call per key would dominate ingest
/// latency.
pub struct IdentityResolver {
    store: Arc<dyn GraphStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Map every key to its store id. Keys the store has seen keep their id;
    /// unseen keys get a freshly reserved one. The response must cover every
    /// requested key or the whole batch fails with `ResolutionIncomplete`.
    pub async fn resolve(
        &self,
        keys: Vec<EntityKey>,
    ) -> Result<HashMap<EntityKey, Uuid>, StudyTraceError> {
        let unique: HashSet<EntityKey> = keys.into_iter().collect();
        if unique.is_empty() {
            return Ok(HashMap::new());
        }

        let requested: Vec<EntityKey> = unique.into_iter().collect();
        let resolved = self.store.resolve_or_reserve(&requested).await?;

        if resolved.len() < requested.len() || requested.iter().any(|k| !resolved.contains_key(k)) {
            return Err(StudyTraceError::ResolutionIncomplete {
                requested: requested.len(),
                resolved: resolved.len(),
            });
        }

        debug!(keys = requested.len(), "resolved identity batch");
        Ok(resolved)
    }
}
