use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use studytrace_common::{EntityType, GraphType, PropertyMap, StudyTraceError, WriteMode};

use crate::directory::EntitySetDirectory;
use crate::store::{GraphStore, ResolvedEdge};

/// Applies entity property merges and edge creation using resolved ids.
/// Entities are always merged before edges referencing them are created.
pub struct GraphMergeUpsert {
    store: Arc<dyn GraphStore>,
    directory: Arc<dyn EntitySetDirectory>,
}

impl GraphMergeUpsert {
    pub fn new(store: Arc<dyn GraphStore>, directory: Arc<dyn EntitySetDirectory>) -> Self {
        Self { store, directory }
    }

    /// Merge property maps into the store, one upsert per entity type.
    ///
    /// Properties that only existed to derive keys are stripped here so
    /// derivation-only fields are never persisted.
    pub async fn merge_entities(
        &self,
        organization: Option<Uuid>,
        by_type: HashMap<EntityType, HashMap<Uuid, PropertyMap>>,
        mode: WriteMode,
    ) -> Result<(), StudyTraceError> {
        for (entity_type, entities) in by_type {
            if entities.is_empty() {
                continue;
            }
            let entity_set_id = self.entity_set(organization, entity_type).await?;

            let stripped: HashMap<Uuid, PropertyMap> = entities
                .into_iter()
                .map(|(id, mut properties)| {
                    strip_derivation_only(GraphType::Entity(entity_type), &mut properties);
                    (id, properties)
                })
                .collect();

            debug!(entity_type = %entity_type, count = stripped.len(), ?mode, "upserting entities");
            self.store
                .upsert_entities(entity_set_id, stripped, mode)
                .await?;
        }
        Ok(())
    }

    /// Create edges between already-merged entities. Idempotent at the store:
    /// an edge that already exists is a no-op.
    pub async fn create_edges(&self, mut edges: Vec<ResolvedEdge>) -> Result<(), StudyTraceError> {
        if edges.is_empty() {
            return Ok(());
        }
        for edge in &mut edges {
            strip_derivation_only(GraphType::Edge(edge.edge_type), &mut edge.properties);
        }
        debug!(count = edges.len(), "creating edges");
        self.store.create_edges(&edges).await
    }

    async fn entity_set(
        &self,
        organization: Option<Uuid>,
        entity_type: EntityType,
    ) -> Result<Uuid, StudyTraceError> {
        self.directory
            .entity_set_id(organization, entity_type.module(), entity_type.template())
            .await?
            .ok_or(StudyTraceError::NotConfigured {
                template: entity_type.template(),
                organization,
            })
    }
}

/// Remove the properties a type declares as derivation-only.
pub(crate) fn strip_derivation_only(graph_type: GraphType, properties: &mut PropertyMap) {
    for name in graph_type.derivation_only() {
        properties.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use studytrace_common::{props, EntityType};

    #[test]
    fn derivation_only_fields_are_stripped() {
        let mut properties = PropertyMap::from([
            (props::STUDY.to_string(), json!("s")),
            (props::PARTICIPANT.to_string(), json!("p")),
            (props::DEVICE.to_string(), json!("d")),
            (props::PACKAGE_NAME.to_string(), json!("com.spotify.music")),
        ]);
        strip_derivation_only(GraphType::Entity(EntityType::AppData), &mut properties);
        assert_eq!(properties.len(), 1);
        assert!(properties.contains_key(props::PACKAGE_NAME));
    }
}
