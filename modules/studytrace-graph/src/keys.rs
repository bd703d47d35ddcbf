use serde_json::Value;
use sha2::{Digest, Sha256};

use studytrace_common::{EntityKey, GraphType, PropertyMap, StudyTraceError};

/// Derive the content-addressed key for an entity or edge.
///
/// The hash covers the type name and each (name, value) pair of the type's
/// identity subset in declared order, with NUL separators so concatenation is
/// unambiguous. Map iteration order never matters: the subset order is fixed
/// by the type, and the all-properties fallback sorts by name.
///
/// Missing or null identity properties fail with `MissingIdentityProperty`.
pub fn derive(graph_type: GraphType, properties: &PropertyMap) -> Result<EntityKey, StudyTraceError> {
    let mut hasher = Sha256::new();
    hasher.update(graph_type.name().as_bytes());

    let subset = graph_type.identity_subset();
    if subset.is_empty() {
        // Raw-occurrence types: hash every property, sorted by name.
        let mut names: Vec<&String> = properties.keys().collect();
        names.sort();
        for name in names {
            hash_pair(&mut hasher, name, &properties[name]);
        }
    } else {
        for name in subset {
            let value = properties
                .get(*name)
                .filter(|v| !v.is_null())
                .ok_or(StudyTraceError::MissingIdentityProperty {
                    graph_type: graph_type.name(),
                    property: name,
                })?;
            hash_pair(&mut hasher, name, value);
        }
    }

    Ok(EntityKey {
        graph_type,
        digest: hex::encode(hasher.finalize()),
    })
}

fn hash_pair(hasher: &mut Sha256, name: &str, value: &Value) {
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical(value).as_bytes());
}

/// Stable rendering of a property value: strings raw, everything else as
/// compact JSON (serde_json keeps object key order, and all values hashed
/// here come from arrays and scalars anyway).
fn canonical(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use studytrace_common::{props, EdgeType, EntityType};

    fn user_app(package: &str) -> PropertyMap {
        PropertyMap::from([(props::PACKAGE_NAME.to_string(), json!(package))])
    }

    #[test]
    fn same_input_same_key() {
        let a = derive(GraphType::Entity(EntityType::UserApp), &user_app("com.spotify.music"));
        let b = derive(GraphType::Entity(EntityType::UserApp), &user_app("com.spotify.music"));
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[test]
    fn key_ignores_map_insertion_order() {
        let mut forward = PropertyMap::new();
        forward.insert(props::START.into(), json!("2024-03-01T09:00:00Z"));
        forward.insert(props::END.into(), json!("2024-03-01T10:00:00Z"));

        let mut reversed = PropertyMap::new();
        reversed.insert(props::END.into(), json!("2024-03-01T10:00:00Z"));
        reversed.insert(props::START.into(), json!("2024-03-01T09:00:00Z"));

        let a = derive(GraphType::Entity(EntityType::TimeRange), &forward).unwrap();
        let b = derive(GraphType::Entity(EntityType::TimeRange), &reversed).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_values_different_keys() {
        let a = derive(GraphType::Entity(EntityType::UserApp), &user_app("com.spotify.music"));
        let b = derive(GraphType::Entity(EntityType::UserApp), &user_app("com.duolingo"));
        assert_ne!(a.unwrap().digest, b.unwrap().digest);
    }

    #[test]
    fn same_values_different_types_different_keys() {
        let props = PropertyMap::from([
            (props::STRING_ID.to_string(), json!("alpha")),
        ]);
        let a = derive(GraphType::Entity(EntityType::Device), &props).unwrap();
        let b = derive(GraphType::Entity(EntityType::Study), &props).unwrap();
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn missing_identity_property_is_reported() {
        let err = derive(GraphType::Entity(EntityType::UserApp), &PropertyMap::new()).unwrap_err();
        match err {
            StudyTraceError::MissingIdentityProperty { property, .. } => {
                assert_eq!(property, props::PACKAGE_NAME)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn null_identity_property_counts_as_missing() {
        let props_map = PropertyMap::from([(props::PACKAGE_NAME.to_string(), Value::Null)]);
        assert!(derive(GraphType::Entity(EntityType::UserApp), &props_map).is_err());
    }

    #[test]
    fn edge_keys_use_the_declared_tuple() {
        let mut props_map = PropertyMap::new();
        props_map.insert(props::RECORDED_DATE.into(), json!("2024-03-01"));
        props_map.insert(props::DEVICE.into(), json!("device-1"));
        props_map.insert(props::PACKAGE_NAME.into(), json!("com.spotify.music"));
        // Extra properties outside the subset do not perturb the key.
        let base = derive(GraphType::Edge(EdgeType::RecordedBy), &props_map).unwrap();
        props_map.insert(props::DATE_TIME.into(), json!("2024-03-01T08:12:00Z"));
        let with_extra = derive(GraphType::Edge(EdgeType::RecordedBy), &props_map).unwrap();
        assert_eq!(base, with_extra);
    }
}
