//! Test doubles for the engine plus a real Neo4j via testcontainers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use studytrace_common::{
    Bookmark, EntityKey, EntityType, GraphType, NeighborFilter, PropertyMap, StudyTraceError,
    WriteMode,
};

use crate::enrollment::EnrollmentLookup;
use crate::store::{GraphStore, NeighborPage, NeighborRow, ResolvedEdge};

// --- In-memory store ---

#[derive(Debug, Clone)]
struct StoredEdge {
    src: Uuid,
    edge: Uuid,
    dst: Uuid,
    edge_type: studytrace_common::EdgeType,
    properties: PropertyMap,
}

#[derive(Default)]
struct Inner {
    ids: HashMap<EntityKey, Uuid>,
    types: HashMap<Uuid, GraphType>,
    entities: HashMap<Uuid, PropertyMap>,
    edges: HashMap<(Uuid, Uuid, Uuid), StoredEdge>,
}

/// GraphStore double with the same observable contract as the Bolt store:
/// append-only key → id bindings, last-write-wins properties, idempotent
/// edge MERGE, stable-order offset paging. Tracks resolve-call counts so
/// tests can assert batching.
#[derive(Default)]
pub struct MemoryGraphStore {
    inner: Mutex<Inner>,
    resolve_calls: AtomicUsize,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many `resolve_or_reserve` round trips the store has served.
    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn entity_count(&self) -> usize {
        self.inner.lock().unwrap().entities.len()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.lock().unwrap().edges.len()
    }

    pub fn id_of(&self, key: &EntityKey) -> Option<Uuid> {
        self.inner.lock().unwrap().ids.get(key).copied()
    }

    pub fn properties_of(&self, id: Uuid) -> Option<PropertyMap> {
        self.inner.lock().unwrap().entities.get(&id).cloned()
    }

    pub fn entities_of_type(&self, entity_type: EntityType) -> Vec<(Uuid, PropertyMap)> {
        let inner = self.inner.lock().unwrap();
        inner
            .entities
            .iter()
            .filter(|(id, _)| {
                inner.types.get(id) == Some(&GraphType::Entity(entity_type))
            })
            .map(|(id, properties)| (*id, properties.clone()))
            .collect()
    }

    pub fn edges_of_type(&self, edge_type: studytrace_common::EdgeType) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .edges
            .values()
            .filter(|e| e.edge_type == edge_type)
            .count()
    }

    /// Seed a pre-resolved entity, as the enrollment registry would have.
    pub fn seed_entity(&self, id: Uuid, entity_type: EntityType, properties: PropertyMap) {
        let mut inner = self.inner.lock().unwrap();
        inner.types.insert(id, GraphType::Entity(entity_type));
        inner.entities.insert(id, properties);
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn resolve_or_reserve(
        &self,
        keys: &[EntityKey],
    ) -> Result<HashMap<EntityKey, Uuid>, StudyTraceError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        let mut resolved = HashMap::new();
        for key in keys {
            let id = match inner.ids.get(key) {
                Some(id) => *id,
                None => {
                    let id = Uuid::new_v4();
                    inner.ids.insert(key.clone(), id);
                    inner.types.insert(id, key.graph_type);
                    id
                }
            };
            resolved.insert(key.clone(), id);
        }
        Ok(resolved)
    }

    async fn upsert_entities(
        &self,
        _entity_set_id: Uuid,
        entities: HashMap<Uuid, PropertyMap>,
        mode: WriteMode,
    ) -> Result<(), StudyTraceError> {
        let mut inner = self.inner.lock().unwrap();
        for (id, properties) in entities {
            match mode {
                WriteMode::Replace => {
                    inner.entities.insert(id, properties);
                }
                WriteMode::Merge | WriteMode::PartialReplace => {
                    inner.entities.entry(id).or_default().extend(properties);
                }
            }
        }
        Ok(())
    }

    async fn create_edges(&self, edges: &[ResolvedEdge]) -> Result<(), StudyTraceError> {
        let mut inner = self.inner.lock().unwrap();
        for edge in edges {
            inner
                .edges
                .entry((edge.src, edge.edge, edge.dst))
                .or_insert_with(|| StoredEdge {
                    src: edge.src,
                    edge: edge.edge,
                    dst: edge.dst,
                    edge_type: edge.edge_type,
                    properties: edge.properties.clone(),
                });
        }
        Ok(())
    }

    async fn get_entity(
        &self,
        _entity_set_id: Uuid,
        id: Uuid,
    ) -> Result<Option<PropertyMap>, StudyTraceError> {
        Ok(self.inner.lock().unwrap().entities.get(&id).cloned())
    }

    async fn page_neighbors(
        &self,
        filter: &NeighborFilter,
        bookmark: Option<Bookmark>,
        page_size: usize,
    ) -> Result<NeighborPage, StudyTraceError> {
        let inner = self.inner.lock().unwrap();

        let mut hits: Vec<(Uuid, Uuid, NeighborRow)> = Vec::new();
        for edge in inner.edges.values() {
            if !filter.edge_types.contains(&edge.edge_type) {
                continue;
            }
            let neighbor = if filter.anchor_ids.contains(&edge.src) {
                let etype = entity_type_of(&inner, edge.dst);
                etype
                    .filter(|t| filter.destination_types.contains(t))
                    .map(|t| (edge.dst, t))
            } else if filter.anchor_ids.contains(&edge.dst) {
                let etype = entity_type_of(&inner, edge.src);
                etype
                    .filter(|t| filter.source_types.contains(t))
                    .map(|t| (edge.src, t))
            } else {
                None
            };
            let Some((neighbor_id, entity_type)) = neighbor else {
                continue;
            };
            hits.push((
                neighbor_id,
                edge.edge,
                NeighborRow {
                    entity_type,
                    entity: inner.entities.get(&neighbor_id).cloned().unwrap_or_default(),
                    edge_type: edge.edge_type,
                    edge: edge.properties.clone(),
                },
            ));
        }
        hits.sort_by_key(|(neighbor_id, edge_id, _)| (*neighbor_id, *edge_id));

        let skip: usize = bookmark.and_then(|b| b.0.parse().ok()).unwrap_or(0);
        let rows: Vec<NeighborRow> = hits
            .into_iter()
            .skip(skip)
            .take(page_size)
            .map(|(_, _, row)| row)
            .collect();
        let bookmark = if rows.len() == page_size {
            Some(Bookmark((skip + page_size).to_string()))
        } else {
            None
        };
        Ok(NeighborPage { rows, bookmark })
    }
}

fn entity_type_of(inner: &Inner, id: Uuid) -> Option<EntityType> {
    match inner.types.get(&id) {
        Some(GraphType::Entity(t)) => Some(*t),
        _ => None,
    }
}

// --- Static enrollment ---

/// Fixed enrollment table for tests.
#[derive(Default)]
pub struct StaticEnrollment {
    pub studies: HashMap<String, Uuid>,
    pub participants: HashMap<(String, String), Uuid>,
}

impl StaticEnrollment {
    pub fn single(study: &str, study_id: Uuid, participant: &str, participant_id: Uuid) -> Self {
        Self {
            studies: HashMap::from([(study.to_string(), study_id)]),
            participants: HashMap::from([(
                (study.to_string(), participant.to_string()),
                participant_id,
            )]),
        }
    }
}

#[async_trait]
impl EnrollmentLookup for StaticEnrollment {
    async fn participant_id(
        &self,
        _organization: Option<Uuid>,
        study: &str,
        participant: &str,
    ) -> Result<Option<Uuid>, StudyTraceError> {
        Ok(self
            .participants
            .get(&(study.to_string(), participant.to_string()))
            .copied())
    }

    async fn study_id(
        &self,
        _organization: Option<Uuid>,
        study: &str,
    ) -> Result<Option<Uuid>, StudyTraceError> {
        Ok(self.studies.get(study).copied())
    }
}

// --- Real Neo4j via testcontainers ---

#[cfg(feature = "test-utils")]
pub use container::neo4j_container;

#[cfg(feature = "test-utils")]
mod container {
    use testcontainers::{
        core::{ContainerPort, WaitFor},
        runners::AsyncRunner,
        ContainerAsync, GenericImage, ImageExt,
    };

    use crate::GraphClient;

    /// Spin up a Neo4j container and return the container handle + connected
    /// GraphClient. The container stops when the handle drops, so callers
    /// must hold it alive for the duration of the test.
    pub async fn neo4j_container() -> (ContainerAsync<GenericImage>, GraphClient) {
        let image = GenericImage::new("neo4j", "5.25.1")
            .with_exposed_port(ContainerPort::Tcp(7687))
            .with_wait_for(WaitFor::message_on_stdout("Started."))
            .with_env_var("NEO4J_AUTH", "neo4j/test");

        let container: ContainerAsync<GenericImage> = image
            .start()
            .await
            .expect("Failed to start Neo4j container");

        let host_port = container
            .get_host_port_ipv4(7687)
            .await
            .expect("Failed to get Neo4j host port");

        let uri = format!("bolt://127.0.0.1:{host_port}");
        let client = GraphClient::connect(&uri, "neo4j", "test")
            .await
            .expect("Failed to connect to Neo4j");

        (container, client)
    }
}
