use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, NaiveTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use studytrace_common::{
    is_system_app, props, EdgeType, EntityKey, EntityType, GraphType, PropertyMap,
    StudyTraceError, SurveySubmission,
};

use crate::keys;

/// Resolved scope of one ingestion call. Study and participant ids come from
/// the enrollment lookup before any shape is built, so nothing is written for
/// unknown participants.
#[derive(Debug, Clone)]
pub struct IngestScope {
    pub organization: Option<Uuid>,
    pub study: String,
    pub participant: String,
    pub study_id: Uuid,
    pub participant_id: Uuid,
    pub device: Option<String>,
}

/// An edge endpoint: either a key still awaiting resolution or an id the
/// enrollment lookup already produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Key(EntityKey),
    Id { id: Uuid, entity_type: EntityType },
}

impl NodeRef {
    /// Stable text form used when an edge is addressed by its endpoints.
    fn digest(&self) -> String {
        match self {
            NodeRef::Key(k) => k.digest.clone(),
            NodeRef::Id { id, .. } => id.to_string(),
        }
    }
}

/// An edge awaiting resolution: its own key plus endpoint references.
#[derive(Debug, Clone)]
pub struct EdgeStub {
    pub key: EntityKey,
    pub src: NodeRef,
    pub dst: NodeRef,
    pub properties: PropertyMap,
}

/// Batch-local date coverage extracted from one app-usage upload. The ingest
/// pipeline reconciles it with stored metadata before the merge.
#[derive(Debug, Clone, PartialEq)]
pub struct DateSummary {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub recorded_dates: BTreeSet<String>,
}

/// Entities-by-key and edge triples describing one upload. Duplicate keys
/// within a batch merge their property maps; duplicate edge triples collapse.
#[derive(Debug, Default)]
pub struct GraphShape {
    pub entities: HashMap<EntityKey, PropertyMap>,
    pub edges: Vec<EdgeStub>,
    seen_edges: HashSet<(String, String, String)>,
    /// Records that made it into the graph.
    pub accepted: usize,
    /// Metadata key + batch-local coverage, at most one per batch.
    pub metadata: Option<(EntityKey, DateSummary)>,
}

impl GraphShape {
    fn entity(
        &mut self,
        entity_type: EntityType,
        properties: PropertyMap,
    ) -> Result<EntityKey, StudyTraceError> {
        let key = keys::derive(GraphType::Entity(entity_type), &properties)?;
        self.entities.entry(key.clone()).or_default().extend(properties);
        Ok(key)
    }

    fn edge(
        &mut self,
        edge_type: EdgeType,
        src: NodeRef,
        dst: NodeRef,
        mut properties: PropertyMap,
    ) -> Result<(), StudyTraceError> {
        let subset = edge_type.identity_subset();
        if subset.contains(&props::SRC) {
            properties.insert(props::SRC.into(), json!(src.digest()));
            properties.insert(props::DST.into(), json!(dst.digest()));
        }
        let key = keys::derive(GraphType::Edge(edge_type), &properties)?;

        let triple = (src.digest(), key.digest.clone(), dst.digest());
        if self.seen_edges.insert(triple) {
            self.edges.push(EdgeStub {
                key,
                src,
                dst,
                properties,
            });
        }
        Ok(())
    }

    /// Every key this shape needs resolved: entities plus edge associations.
    pub fn pending_keys(&self) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self.entities.keys().cloned().collect();
        keys.extend(self.edges.iter().map(|e| e.key.clone()));
        keys
    }
}

/// Converts one upload into the entity/edge batch for the store. Pure with
/// respect to the store: identical input batches produce identical shapes.
pub struct GraphShapeBuilder<'a> {
    scope: &'a IngestScope,
}

impl<'a> GraphShapeBuilder<'a> {
    pub fn new(scope: &'a IngestScope) -> Self {
        Self { scope }
    }

    fn participant_ref(&self) -> NodeRef {
        NodeRef::Id {
            id: self.scope.participant_id,
            entity_type: EntityType::Participant,
        }
    }

    fn study_ref(&self) -> NodeRef {
        NodeRef::Id {
            id: self.scope.study_id,
            entity_type: EntityType::Study,
        }
    }

    /// Shape one app-usage batch.
    ///
    /// Records with a package in the system-app set or an unparsable
    /// `date_logged` are skipped here and never enter the graph. Successfully
    /// parsed dates feed the batch's metadata summary.
    pub fn app_usage(&self, records: &[PropertyMap]) -> Result<GraphShape, StudyTraceError> {
        let mut shape = GraphShape::default();

        let device_ref = match &self.scope.device {
            Some(device) => Some(NodeRef::Key(shape.entity(
                EntityType::Device,
                PropertyMap::from([(props::STRING_ID.to_string(), json!(device))]),
            )?)),
            None => None,
        };

        let mut summary: Option<DateSummary> = None;

        for record in records {
            let Some(package) = record.get(props::PACKAGE_NAME).and_then(Value::as_str) else {
                warn!(participant = %self.scope.participant, "app-usage record has no package name, skipping");
                continue;
            };
            let package = package.to_string();

            if is_system_app(&package) {
                debug!(package, "system app, skipping");
                continue;
            }

            let Some(logged_at) = record.get(props::DATE_LOGGED).and_then(parse_timestamp) else {
                warn!(
                    package,
                    participant = %self.scope.participant,
                    "unparsable date_logged, skipping record"
                );
                continue;
            };
            let midnight = logged_at
                .with_time(NaiveTime::MIN)
                .single()
                .unwrap_or(logged_at);
            let recorded_date = midnight.format("%Y-%m-%d").to_string();

            // Shared nodes: the app itself, merged across every record and batch.
            let mut app_props =
                PropertyMap::from([(props::PACKAGE_NAME.to_string(), json!(package))]);
            if let Some(title) = record.get(props::TITLE) {
                app_props.insert(props::TITLE.into(), title.clone());
            }
            let app_key = shape.entity(EntityType::UserApp, app_props)?;

            // The raw occurrence, addressed by its full content plus scope so
            // identical events from different participants never collide.
            let mut raw = record.clone();
            raw.insert(props::STUDY.into(), json!(self.scope.study));
            raw.insert(props::PARTICIPANT.into(), json!(self.scope.participant));
            if let Some(device) = &self.scope.device {
                raw.insert(props::DEVICE.into(), json!(device));
            }
            let appdata_key = shape.entity(EntityType::AppData, raw)?;

            if let Some(device_ref) = &device_ref {
                let device = self.scope.device.as_deref().unwrap_or_default();
                shape.edge(
                    EdgeType::RecordedBy,
                    NodeRef::Key(appdata_key.clone()),
                    device_ref.clone(),
                    PropertyMap::from([
                        (props::RECORDED_DATE.to_string(), json!(recorded_date)),
                        (props::DEVICE.to_string(), json!(device)),
                        (props::PACKAGE_NAME.to_string(), json!(package)),
                        (props::DATE_TIME.to_string(), json!(logged_at.to_rfc3339())),
                    ]),
                )?;
            }

            shape.edge(
                EdgeType::UsedBy,
                NodeRef::Key(app_key),
                self.participant_ref(),
                PropertyMap::from([
                    (props::PACKAGE_NAME.to_string(), json!(package)),
                    (props::RECORDED_DATE.to_string(), json!(recorded_date)),
                    (props::PARTICIPANT.to_string(), json!(self.scope.participant)),
                    (props::DATE_TIME.to_string(), json!(midnight.to_rfc3339())),
                ]),
            )?;

            let entry = summary.get_or_insert_with(|| DateSummary {
                start: midnight,
                end: midnight,
                recorded_dates: BTreeSet::new(),
            });
            entry.start = entry.start.min(midnight);
            entry.end = entry.end.max(midnight);
            entry.recorded_dates.insert(recorded_date);

            shape.accepted += 1;
        }

        // At most one metadata node per batch, summarizing observed coverage.
        if let Some(summary) = summary {
            let metadata_key = shape.entity(
                EntityType::Metadata,
                PropertyMap::from([
                    (props::STUDY.to_string(), json!(self.scope.study)),
                    (props::PARTICIPANT.to_string(), json!(self.scope.participant)),
                    (
                        props::START_DATE_TIME.to_string(),
                        json!(summary.start.to_rfc3339()),
                    ),
                    (
                        props::END_DATE_TIME.to_string(),
                        json!(summary.end.to_rfc3339()),
                    ),
                    (
                        props::RECORDED_DATES.to_string(),
                        json!(summary.recorded_dates.iter().collect::<Vec<_>>()),
                    ),
                ]),
            )?;
            shape.edge(
                EdgeType::Has,
                self.participant_ref(),
                NodeRef::Key(metadata_key.clone()),
                PropertyMap::new(),
            )?;
            shape.metadata = Some((metadata_key, summary));

            shape.edge(
                EdgeType::ParticipatedIn,
                self.participant_ref(),
                self.study_ref(),
                PropertyMap::new(),
            )?;
        }

        Ok(shape)
    }

    /// Shape one questionnaire or time-use-diary submission.
    ///
    /// One call produces exactly one submission node however many responses it
    /// carries. Identical (start, end) blocks collapse to one time-range node.
    pub fn survey(
        &self,
        submission: &SurveySubmission,
        with_time_ranges: bool,
    ) -> Result<GraphShape, StudyTraceError> {
        let mut shape = GraphShape::default();
        let submitted_at = submission.submitted_at.to_rfc3339();

        let submission_key = shape.entity(
            EntityType::Submission,
            PropertyMap::from([
                (props::STUDY.to_string(), json!(submission.study)),
                (props::PARTICIPANT.to_string(), json!(submission.participant)),
                (props::DATE_TIME.to_string(), json!(submitted_at)),
            ]),
        )?;

        shape.edge(
            EdgeType::RespondsWith,
            self.participant_ref(),
            NodeRef::Key(submission_key.clone()),
            PropertyMap::from([
                (props::STUDY.to_string(), json!(submission.study)),
                (props::PARTICIPANT.to_string(), json!(submission.participant)),
                (props::DATE_TIME.to_string(), json!(submitted_at)),
            ]),
        )?;

        shape.edge(
            EdgeType::ParticipatedIn,
            self.participant_ref(),
            self.study_ref(),
            PropertyMap::new(),
        )?;

        for response in &submission.responses {
            let mut question_props = PropertyMap::from([(
                props::QUESTION_CODE.to_string(),
                json!(response.question_code),
            )]);
            if let Some(title) = &response.question_title {
                question_props.insert(props::TITLE.into(), json!(title));
            }
            let question_key = shape.entity(EntityType::Question, question_props)?;

            let answer_key = shape.entity(
                EntityType::Answer,
                PropertyMap::from([
                    (props::VALUES.to_string(), json!(response.values)),
                    (props::STUDY.to_string(), json!(submission.study)),
                    (
                        props::PARTICIPANT.to_string(),
                        json!(submission.participant),
                    ),
                    (
                        props::QUESTION_CODE.to_string(),
                        json!(response.question_code),
                    ),
                    (props::DATE_TIME.to_string(), json!(submitted_at)),
                ]),
            )?;

            shape.edge(
                EdgeType::Addresses,
                NodeRef::Key(answer_key.clone()),
                NodeRef::Key(question_key),
                PropertyMap::new(),
            )?;
            shape.edge(
                EdgeType::PartOf,
                NodeRef::Key(answer_key.clone()),
                NodeRef::Key(submission_key.clone()),
                PropertyMap::new(),
            )?;

            if with_time_ranges {
                match (response.start, response.end) {
                    (Some(start), Some(end)) => {
                        let range_key = shape.entity(
                            EntityType::TimeRange,
                            PropertyMap::from([
                                (props::START.to_string(), json!(start.to_rfc3339())),
                                (props::END.to_string(), json!(end.to_rfc3339())),
                            ]),
                        )?;
                        shape.edge(
                            EdgeType::RegisteredFor,
                            NodeRef::Key(answer_key.clone()),
                            NodeRef::Key(range_key),
                            PropertyMap::new(),
                        )?;
                    }
                    _ => {
                        warn!(
                            question = %response.question_code,
                            "diary response without a complete time range"
                        );
                    }
                }
            }

            shape.accepted += 1;
        }

        Ok(shape)
    }
}

/// Accepts RFC 3339 strings and epoch milliseconds; anything else is malformed.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> IngestScope {
        IngestScope {
            organization: None,
            study: "sleep-study".into(),
            participant: "p-001".into(),
            study_id: Uuid::from_u128(1),
            participant_id: Uuid::from_u128(2),
            device: Some("device-abc".into()),
        }
    }

    fn usage_record(package: &str, logged: &str) -> PropertyMap {
        PropertyMap::from([
            (props::PACKAGE_NAME.to_string(), json!(package)),
            (props::DATE_LOGGED.to_string(), json!(logged)),
        ])
    }

    #[test]
    fn malformed_dates_are_skipped_not_fatal() {
        let scope = scope();
        let records = vec![
            usage_record("com.spotify.music", "2024-03-01T08:00:00Z"),
            usage_record("com.duolingo", "not-a-date"),
            usage_record("com.signal.app", "2024-03-02T09:30:00Z"),
        ];
        let shape = GraphShapeBuilder::new(&scope).app_usage(&records).unwrap();
        assert_eq!(shape.accepted, 2);
        // Skipped record contributes neither a USED_BY nor a RECORDED_BY edge.
        let used_by = shape
            .edges
            .iter()
            .filter(|e| matches!(e.key.graph_type, GraphType::Edge(EdgeType::UsedBy)))
            .count();
        assert_eq!(used_by, 2);
    }

    #[test]
    fn system_apps_never_enter_the_graph() {
        let scope = scope();
        let records = vec![
            usage_record("com.android.systemui", "2024-03-01T08:00:00Z"),
            usage_record("com.spotify.music", "2024-03-01T08:05:00Z"),
        ];
        let shape = GraphShapeBuilder::new(&scope).app_usage(&records).unwrap();
        assert_eq!(shape.accepted, 1);
        assert!(!shape.entities.iter().any(|(_, p)| {
            p.get(props::PACKAGE_NAME).and_then(Value::as_str) == Some("com.android.systemui")
        }));
    }

    #[test]
    fn identical_batches_shape_identically() {
        let scope = scope();
        let records = vec![
            usage_record("com.spotify.music", "2024-03-01T08:00:00Z"),
            usage_record("com.duolingo", "2024-03-03T10:00:00Z"),
        ];
        let builder = GraphShapeBuilder::new(&scope);
        let a = builder.app_usage(&records).unwrap();
        let b = builder.app_usage(&records).unwrap();

        let mut a_keys: Vec<String> = a.entities.keys().map(|k| k.digest.clone()).collect();
        let mut b_keys: Vec<String> = b.entities.keys().map(|k| k.digest.clone()).collect();
        a_keys.sort();
        b_keys.sort();
        assert_eq!(a_keys, b_keys);
        assert_eq!(a.edges.len(), b.edges.len());
    }

    #[test]
    fn metadata_summarizes_min_max_and_unique_days() {
        let scope = scope();
        let records = vec![
            usage_record("com.spotify.music", "2024-03-05T23:59:00Z"),
            usage_record("com.duolingo", "2024-03-01T08:00:00Z"),
            usage_record("com.signal.app", "2024-03-01T12:00:00Z"),
        ];
        let shape = GraphShapeBuilder::new(&scope).app_usage(&records).unwrap();
        let (_, summary) = shape.metadata.expect("batch with parsed dates has metadata");
        assert_eq!(summary.start.format("%Y-%m-%d").to_string(), "2024-03-01");
        assert_eq!(summary.end.format("%Y-%m-%d").to_string(), "2024-03-05");
        assert_eq!(
            summary.recorded_dates.into_iter().collect::<Vec<_>>(),
            vec!["2024-03-01".to_string(), "2024-03-05".to_string()]
        );
    }

    #[test]
    fn batch_without_usable_dates_has_no_metadata() {
        let scope = scope();
        let shape = GraphShapeBuilder::new(&scope)
            .app_usage(&[usage_record("com.spotify.music", "garbage")])
            .unwrap();
        assert!(shape.metadata.is_none());
        assert_eq!(shape.accepted, 0);
    }

    fn submission(responses: Vec<studytrace_common::QuestionResponse>) -> SurveySubmission {
        SurveySubmission::builder()
            .study("sleep-study".into())
            .participant("p-001".into())
            .submitted_at("2024-03-10T18:00:00Z".parse().unwrap())
            .responses(responses)
            .build()
    }

    fn response(code: &str, values: &[&str]) -> studytrace_common::QuestionResponse {
        studytrace_common::QuestionResponse::builder()
            .question_code(code.into())
            .values(values.iter().map(|s| s.to_string()).collect())
            .build()
    }

    #[test]
    fn one_submission_node_regardless_of_question_count() {
        let scope = scope();
        let shape = GraphShapeBuilder::new(&scope)
            .survey(
                &submission(vec![
                    response("q1", &["7"]),
                    response("q2", &["poor"]),
                    response("q3", &["yes", "no"]),
                ]),
                false,
            )
            .unwrap();

        let submissions = shape
            .entities
            .keys()
            .filter(|k| k.graph_type == GraphType::Entity(EntityType::Submission))
            .count();
        assert_eq!(submissions, 1);
        assert_eq!(shape.accepted, 3);
    }

    #[test]
    fn identical_time_ranges_collapse_to_one_node() {
        let scope = scope();
        let start = "2024-03-10T09:00:00Z".parse().unwrap();
        let end = "2024-03-10T10:00:00Z".parse().unwrap();
        let mut r1 = response("activity", &["reading"]);
        r1.start = Some(start);
        r1.end = Some(end);
        let mut r2 = response("location", &["home"]);
        r2.start = Some(start);
        r2.end = Some(end);

        let shape = GraphShapeBuilder::new(&scope)
            .survey(&submission(vec![r1, r2]), true)
            .unwrap();

        let ranges = shape
            .entities
            .keys()
            .filter(|k| k.graph_type == GraphType::Entity(EntityType::TimeRange))
            .count();
        assert_eq!(ranges, 1);
    }

    #[test]
    fn same_answer_values_from_different_questions_stay_distinct() {
        let scope = scope();
        let shape = GraphShapeBuilder::new(&scope)
            .survey(
                &submission(vec![response("q1", &["yes"]), response("q2", &["yes"])]),
                false,
            )
            .unwrap();
        let answers = shape
            .entities
            .keys()
            .filter(|k| k.graph_type == GraphType::Entity(EntityType::Answer))
            .count();
        assert_eq!(answers, 2);
    }
}
