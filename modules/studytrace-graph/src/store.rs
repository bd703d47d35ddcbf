use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use studytrace_common::{
    Bookmark, EdgeType, EntityKey, EntityType, NeighborFilter, PropertyMap, StudyTraceError,
    WriteMode,
};

/// An edge ready for creation: every endpoint and the edge itself carry
/// store-assigned ids resolved from their EntityKeys.
#[derive(Debug, Clone)]
pub struct ResolvedEdge {
    pub src: Uuid,
    pub edge: Uuid,
    pub dst: Uuid,
    pub edge_type: EdgeType,
    pub properties: PropertyMap,
}

/// One neighbor hit: the neighbor entity plus the edge that reached it.
#[derive(Debug, Clone)]
pub struct NeighborRow {
    pub entity_type: EntityType,
    pub entity: PropertyMap,
    pub edge_type: EdgeType,
    pub edge: PropertyMap,
}

/// One page of neighbor results with the cursor for the next page. An empty
/// row set signals traversal completion.
#[derive(Debug, Clone, Default)]
pub struct NeighborPage {
    pub rows: Vec<NeighborRow>,
    pub bookmark: Option<Bookmark>,
}

/// The graph store, consumed through this boundary only. Implementations own
/// persistence, merge semantics (last-write-wins per property), and paging.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Map every key to its store id in one round trip, reserving fresh ids
    /// for keys never seen before. The EntityKey → id binding is append-only:
    /// once assigned, an id is never reassigned.
    async fn resolve_or_reserve(
        &self,
        keys: &[EntityKey],
    ) -> Result<HashMap<EntityKey, Uuid>, StudyTraceError>;

    /// Write property maps for already-resolved entities.
    async fn upsert_entities(
        &self,
        entity_set_id: Uuid,
        entities: HashMap<Uuid, PropertyMap>,
        mode: WriteMode,
    ) -> Result<(), StudyTraceError>;

    /// Create edges between resolved entities. Creating an edge that already
    /// exists is a no-op, not an error.
    async fn create_edges(&self, edges: &[ResolvedEdge]) -> Result<(), StudyTraceError>;

    /// Fetch one entity's current properties, if it has any.
    async fn get_entity(
        &self,
        entity_set_id: Uuid,
        id: Uuid,
    ) -> Result<Option<PropertyMap>, StudyTraceError>;

    /// Fetch one page of neighbors for the filter, starting at the bookmark.
    async fn page_neighbors(
        &self,
        filter: &NeighborFilter,
        bookmark: Option<Bookmark>,
        page_size: usize,
    ) -> Result<NeighborPage, StudyTraceError>;
}
