use std::collections::HashMap;

use async_trait::async_trait;
use neo4rs::query;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use studytrace_common::{
    Bookmark, EdgeType, EntityKey, EntityType, NeighborFilter, PropertyMap, StudyTraceError,
    WriteMode,
};

use crate::store::{GraphStore, NeighborPage, NeighborRow, ResolvedEdge};
use crate::GraphClient;

/// Neo4j-backed GraphStore.
///
/// Every node carries the `Entity` label plus an `etype` property (a single
/// batched MERGE cannot parameterize labels); relationships use their real
/// types, formatted from the trusted `EdgeType` enum only. Write semantics
/// are last-write-wins per property, which is the store contract the rest of
/// the engine assumes.
pub struct BoltGraphStore {
    client: GraphClient,
}

impl BoltGraphStore {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GraphStore for BoltGraphStore {
    /// One query for the whole batch. MERGE on `entity_key` keeps the
    /// key → id binding append-only: an existing node keeps its id, a new
    /// node adopts the id reserved for it client-side.
    async fn resolve_or_reserve(
        &self,
        keys: &[EntityKey],
    ) -> Result<HashMap<EntityKey, Uuid>, StudyTraceError> {
        let digests: Vec<String> = keys.iter().map(|k| k.digest.clone()).collect();
        let reserved: Vec<String> = keys.iter().map(|_| Uuid::new_v4().to_string()).collect();
        let etypes: Vec<String> = keys.iter().map(|k| k.graph_type.name().to_string()).collect();

        let by_digest: HashMap<String, EntityKey> = keys
            .iter()
            .map(|k| (k.digest.clone(), k.clone()))
            .collect();

        let q = query(
            "UNWIND range(0, size($keys) - 1) AS i
             MERGE (n:Entity {entity_key: $keys[i]})
             ON CREATE SET n.id = $ids[i], n.etype = $etypes[i]
             RETURN $keys[i] AS key, n.id AS id",
        )
        .param("keys", digests)
        .param("ids", reserved)
        .param("etypes", etypes);

        let mut resolved = HashMap::new();
        let mut stream = self.client.graph.execute(q).await.map_err(store_err)?;
        while let Some(row) = stream.next().await.map_err(store_err)? {
            let digest: String = row.get("key").map_err(de_err)?;
            let id: String = row.get("id").map_err(de_err)?;
            let id = Uuid::parse_str(&id)
                .map_err(|e| StudyTraceError::StoreUnavailable(format!("bad id from store: {e}")))?;
            if let Some(key) = by_digest.get(&digest) {
                resolved.insert(key.clone(), id);
            }
        }

        debug!(requested = keys.len(), resolved = resolved.len(), "resolved keys");
        Ok(resolved)
    }

    async fn upsert_entities(
        &self,
        _entity_set_id: Uuid,
        entities: HashMap<Uuid, PropertyMap>,
        mode: WriteMode,
    ) -> Result<(), StudyTraceError> {
        for (id, properties) in entities {
            let (set_clause, values) = set_clause("n", &properties);
            if values.is_empty() {
                continue;
            }

            // Replace clears user properties first; Merge and PartialReplace
            // both resolve to per-property last-write-wins at this store.
            let cypher = match mode {
                WriteMode::Replace => format!(
                    "MATCH (n:Entity {{id: $id}})
                     WITH n, {{id: n.id, entity_key: n.entity_key, etype: n.etype}} AS keep
                     SET n = keep
                     {set_clause}"
                ),
                WriteMode::Merge | WriteMode::PartialReplace => {
                    format!("MATCH (n:Entity {{id: $id}}) {set_clause}")
                }
            };

            let mut q = query(&cypher).param("id", id.to_string());
            for (name, value) in &values {
                q = bind(q, name, value);
            }
            let mut stream = self.client.graph.execute(q).await.map_err(store_err)?;
            while stream.next().await.map_err(store_err)?.is_some() {}
        }
        Ok(())
    }

    /// MERGE on the edge's resolved id makes creation idempotent: re-creating
    /// an existing edge matches instead of duplicating.
    async fn create_edges(&self, edges: &[ResolvedEdge]) -> Result<(), StudyTraceError> {
        for edge in edges {
            let (set_clause, values) = set_clause("r", &edge.properties);
            let cypher = format!(
                "MATCH (s:Entity {{id: $src}}), (d:Entity {{id: $dst}})
                 MERGE (s)-[r:{rel} {{id: $edge}}]->(d)
                 {set_clause}",
                rel = edge.edge_type.label(),
            );

            let mut q = query(&cypher)
                .param("src", edge.src.to_string())
                .param("dst", edge.dst.to_string())
                .param("edge", edge.edge.to_string());
            for (name, value) in &values {
                q = bind(q, name, value);
            }
            let mut stream = self.client.graph.execute(q).await.map_err(store_err)?;
            while stream.next().await.map_err(store_err)?.is_some() {}
        }
        Ok(())
    }

    async fn get_entity(
        &self,
        _entity_set_id: Uuid,
        id: Uuid,
    ) -> Result<Option<PropertyMap>, StudyTraceError> {
        let q = query("MATCH (n:Entity {id: $id}) RETURN n").param("id", id.to_string());
        let mut stream = self.client.graph.execute(q).await.map_err(store_err)?;
        match stream.next().await.map_err(store_err)? {
            Some(row) => {
                let node: neo4rs::Node = row.get("n").map_err(de_err)?;
                Ok(Some(node_properties(&node)))
            }
            None => Ok(None),
        }
    }

    /// Stable-order offset paging. The bookmark is opaque to callers; here it
    /// encodes how far into the ordered result set the last page reached.
    async fn page_neighbors(
        &self,
        filter: &NeighborFilter,
        bookmark: Option<Bookmark>,
        page_size: usize,
    ) -> Result<NeighborPage, StudyTraceError> {
        let skip: i64 = bookmark
            .as_ref()
            .and_then(|b| b.0.parse().ok())
            .unwrap_or(0);

        let anchors: Vec<String> = filter.anchor_ids.iter().map(Uuid::to_string).collect();
        let edge_types: Vec<String> = filter
            .edge_types
            .iter()
            .map(|t| t.label().to_string())
            .collect();
        let src_types: Vec<String> = filter
            .source_types
            .iter()
            .map(|t| t.label().to_string())
            .collect();
        let dst_types: Vec<String> = filter
            .destination_types
            .iter()
            .map(|t| t.label().to_string())
            .collect();

        // The anchor may sit at either end; the emitted neighbor is always
        // the other endpoint, filtered by the side it occupies.
        let q = query(
            "MATCH (a:Entity)-[r]-(n:Entity)
             WHERE a.id IN $anchors
               AND type(r) IN $edge_types
               AND (
                 (startNode(r) = a AND n.etype IN $dst_types)
                 OR (endNode(r) = a AND n.etype IN $src_types)
               )
             RETURN type(r) AS edge_type, n.etype AS entity_type, r, n
             ORDER BY n.id, type(r), a.id
             SKIP $skip LIMIT $limit",
        )
        .param("anchors", anchors)
        .param("edge_types", edge_types)
        .param("src_types", src_types)
        .param("dst_types", dst_types)
        .param("skip", skip)
        .param("limit", page_size as i64);

        let mut rows = Vec::new();
        let mut stream = self.client.graph.execute(q).await.map_err(store_err)?;
        while let Some(row) = stream.next().await.map_err(store_err)? {
            let etype: String = row.get("entity_type").map_err(de_err)?;
            let rel_type: String = row.get("edge_type").map_err(de_err)?;
            let (Some(entity_type), Some(edge_type)) =
                (entity_type_from_label(&etype), edge_type_from_label(&rel_type))
            else {
                debug!(etype, rel_type, "row with unknown type labels, skipping");
                continue;
            };

            let node: neo4rs::Node = row.get("n").map_err(de_err)?;
            let relation: neo4rs::Relation = row.get("r").map_err(de_err)?;
            rows.push(NeighborRow {
                entity_type,
                entity: node_properties(&node),
                edge_type,
                edge: relation_properties(&relation),
            });
        }

        let bookmark = if rows.len() == page_size {
            Some(Bookmark((skip + page_size as i64).to_string()))
        } else {
            None
        };
        Ok(NeighborPage { rows, bookmark })
    }
}

// --- Helpers ---

fn store_err(e: neo4rs::Error) -> StudyTraceError {
    StudyTraceError::StoreUnavailable(e.to_string())
}

fn de_err(e: neo4rs::DeError) -> StudyTraceError {
    StudyTraceError::StoreUnavailable(format!("malformed store response: {e}"))
}

/// Build `SET <var>.a = $p0, <var>.b = $p1, ...` with generated parameter
/// names. Property names are backtick-quoted; nulls are dropped.
fn set_clause(var: &str, properties: &PropertyMap) -> (String, Vec<(String, Value)>) {
    let mut parts = Vec::new();
    let mut values = Vec::new();
    let mut names: Vec<&String> = properties.keys().collect();
    names.sort();
    for (i, name) in names.into_iter().enumerate() {
        let value = &properties[name];
        if value.is_null() {
            continue;
        }
        let param = format!("p{i}");
        let quoted = name.replace('`', "");
        parts.push(format!("{var}.`{quoted}` = ${param}"));
        values.push((param, value.clone()));
    }
    if parts.is_empty() {
        (String::new(), values)
    } else {
        (format!("SET {}", parts.join(", ")), values)
    }
}

fn bind(q: neo4rs::Query, name: &str, value: &Value) -> neo4rs::Query {
    match value {
        Value::String(s) => q.param(name, s.as_str()),
        Value::Bool(b) => q.param(name, *b),
        Value::Number(n) if n.is_i64() => q.param(name, n.as_i64().unwrap_or_default()),
        Value::Number(n) => q.param(name, n.as_f64().unwrap_or_default()),
        Value::Array(items) => {
            let rendered: Vec<String> = items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            q.param(name, rendered)
        }
        // Nulls are filtered in set_clause; objects are stored as JSON text.
        other => q.param(name, other.to_string()),
    }
}

fn node_properties(node: &neo4rs::Node) -> PropertyMap {
    node.keys()
        .into_iter()
        .map(|k| {
            let value = node.get::<Value>(k).unwrap_or(Value::Null);
            (k.to_string(), value)
        })
        .collect()
}

fn relation_properties(relation: &neo4rs::Relation) -> PropertyMap {
    relation
        .keys()
        .into_iter()
        .map(|k| {
            let value = relation.get::<Value>(k).unwrap_or(Value::Null);
            (k.to_string(), value)
        })
        .collect()
}

fn entity_type_from_label(label: &str) -> Option<EntityType> {
    Some(match label {
        "Study" => EntityType::Study,
        "Participant" => EntityType::Participant,
        "Device" => EntityType::Device,
        "UserApp" => EntityType::UserApp,
        "AppData" => EntityType::AppData,
        "Metadata" => EntityType::Metadata,
        "Question" => EntityType::Question,
        "Answer" => EntityType::Answer,
        "Submission" => EntityType::Submission,
        "TimeRange" => EntityType::TimeRange,
        _ => return None,
    })
}

fn edge_type_from_label(label: &str) -> Option<EdgeType> {
    Some(match label {
        "USED_BY" => EdgeType::UsedBy,
        "RECORDED_BY" => EdgeType::RecordedBy,
        "RESPONDS_WITH" => EdgeType::RespondsWith,
        "ADDRESSES" => EdgeType::Addresses,
        "REGISTERED_FOR" => EdgeType::RegisteredFor,
        "PART_OF" => EdgeType::PartOf,
        "HAS" => EdgeType::Has,
        "PARTICIPATED_IN" => EdgeType::ParticipatedIn,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_clause_orders_quotes_and_drops_nulls() {
        let properties = PropertyMap::from([
            ("b_value".to_string(), json!(2)),
            ("a_value".to_string(), json!("x")),
            ("gone".to_string(), Value::Null),
        ]);
        let (clause, values) = set_clause("n", &properties);
        assert_eq!(clause, "SET n.`a_value` = $p0, n.`b_value` = $p1");
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn labels_round_trip_through_the_parsers() {
        for t in [
            EntityType::Study,
            EntityType::UserApp,
            EntityType::TimeRange,
        ] {
            assert_eq!(entity_type_from_label(t.label()), Some(t));
        }
        for t in [EdgeType::UsedBy, EdgeType::RespondsWith, EdgeType::Has] {
            assert_eq!(edge_type_from_label(t.label()), Some(t));
        }
        assert_eq!(entity_type_from_label("Unknown"), None);
    }
}
