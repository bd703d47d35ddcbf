use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::info;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use studytrace_common::{
    props, EntityKey, EntityType, GraphType, PropertyMap, StudyTraceError, SurveySubmission,
    UploadBatch, WriteMode,
};

use crate::directory::EntitySetDirectory;
use crate::enrollment::EnrollmentLookup;
use crate::resolver::IdentityResolver;
use crate::shape::{DateSummary, GraphShape, GraphShapeBuilder, IngestScope, NodeRef};
use crate::store::{GraphStore, ResolvedEdge};
use crate::upsert::GraphMergeUpsert;

/// Long-lived, cloneable dependencies shared by every ingestion call.
#[derive(Clone, TypedBuilder)]
pub struct IngestDeps {
    pub store: Arc<dyn GraphStore>,
    pub directory: Arc<dyn EntitySetDirectory>,
    pub enrollment: Arc<dyn EnrollmentLookup>,
}

/// The ingestion surface: one synchronous derive → resolve → merge →
/// create-edges pipeline per batch. Independent batches may run concurrently;
/// the store is the only shared mutable state. Retried identical batches are
/// no-ops on the graph apart from revised metadata ranges.
pub struct IngestService {
    deps: IngestDeps,
    resolver: IdentityResolver,
    upsert: GraphMergeUpsert,
}

impl IngestService {
    pub fn new(deps: IngestDeps) -> Self {
        let resolver = IdentityResolver::new(deps.store.clone());
        let upsert = GraphMergeUpsert::new(deps.store.clone(), deps.directory.clone());
        Self {
            deps,
            resolver,
            upsert,
        }
    }

    /// Ingest one app-usage batch. Returns the number of records accepted,
    /// which may be less than submitted: system apps and records with
    /// unparsable log dates are dropped, not fatal.
    pub async fn upload_app_usage(&self, batch: UploadBatch) -> Result<usize, StudyTraceError> {
        let scope = self
            .scope(
                batch.organization,
                &batch.study,
                &batch.participant,
                batch.device.clone(),
            )
            .await?;

        let shape = GraphShapeBuilder::new(&scope).app_usage(&batch.records)?;
        if shape.accepted == 0 {
            info!(
                participant = %scope.participant,
                submitted = batch.records.len(),
                "no usable app-usage records, nothing written"
            );
            return Ok(0);
        }

        let accepted = shape.accepted;
        self.commit(&scope, shape).await?;
        info!(
            participant = %scope.participant,
            accepted,
            submitted = batch.records.len(),
            "app-usage batch committed"
        );
        Ok(accepted)
    }

    /// Ingest one questionnaire submission. One call, one submission node.
    pub async fn submit_questionnaire(
        &self,
        submission: SurveySubmission,
    ) -> Result<usize, StudyTraceError> {
        self.submit_survey(submission, false).await
    }

    /// Ingest one time-use-diary submission: a questionnaire whose responses
    /// additionally collapse onto shared time-range nodes.
    pub async fn submit_time_use_diary(
        &self,
        submission: SurveySubmission,
    ) -> Result<usize, StudyTraceError> {
        self.submit_survey(submission, true).await
    }

    async fn submit_survey(
        &self,
        submission: SurveySubmission,
        with_time_ranges: bool,
    ) -> Result<usize, StudyTraceError> {
        let scope = self
            .scope(
                submission.organization,
                &submission.study,
                &submission.participant,
                None,
            )
            .await?;

        let shape = GraphShapeBuilder::new(&scope).survey(&submission, with_time_ranges)?;
        if shape.accepted == 0 {
            return Ok(0);
        }

        let accepted = shape.accepted;
        self.commit(&scope, shape).await?;
        info!(
            participant = %scope.participant,
            responses = accepted,
            "survey submission committed"
        );
        Ok(accepted)
    }

    /// Precondition checks happen here, before any store mutation: an unknown
    /// study or participant writes nothing.
    async fn scope(
        &self,
        organization: Option<Uuid>,
        study: &str,
        participant: &str,
        device: Option<String>,
    ) -> Result<IngestScope, StudyTraceError> {
        let study_id = self
            .deps
            .enrollment
            .study_id(organization, study)
            .await?
            .ok_or_else(|| StudyTraceError::UnknownStudy(study.to_string()))?;
        let participant_id = self
            .deps
            .enrollment
            .participant_id(organization, study, participant)
            .await?
            .ok_or_else(|| StudyTraceError::UnknownParticipant(participant.to_string()))?;

        Ok(IngestScope {
            organization,
            study: study.to_string(),
            participant: participant.to_string(),
            study_id,
            participant_id,
            device,
        })
    }

    /// Resolve every pending key in one round trip, merge entities grouped by
    /// write mode, then create edges. Entities always land before the edges
    /// that reference them.
    async fn commit(
        &self,
        scope: &IngestScope,
        mut shape: GraphShape,
    ) -> Result<(), StudyTraceError> {
        let ids = self.resolver.resolve(shape.pending_keys()).await?;

        if let Some((metadata_key, summary)) = shape.metadata.take() {
            let reconciled = self
                .reconcile_metadata(scope, &ids, &metadata_key, &summary)
                .await?;
            shape.entities.insert(metadata_key, reconciled);
        }

        let mut merged: HashMap<EntityType, HashMap<Uuid, PropertyMap>> = HashMap::new();
        let mut replaced: HashMap<EntityType, HashMap<Uuid, PropertyMap>> = HashMap::new();
        let mut partial: HashMap<EntityType, HashMap<Uuid, PropertyMap>> = HashMap::new();

        for (key, properties) in shape.entities.drain() {
            let GraphType::Entity(entity_type) = key.graph_type else {
                continue;
            };
            let id = ids[&key];
            let group = match entity_type {
                // Raw occurrences are always newly created, never merged.
                EntityType::AppData | EntityType::Answer => &mut replaced,
                // Reconciled date fields overwrite stored values wholesale.
                EntityType::Metadata => &mut partial,
                _ => &mut merged,
            };
            group.entry(entity_type).or_default().insert(id, properties);
        }

        let organization = scope.organization;
        self.upsert
            .merge_entities(organization, merged, WriteMode::Merge)
            .await?;
        self.upsert
            .merge_entities(organization, replaced, WriteMode::Replace)
            .await?;
        self.upsert
            .merge_entities(organization, partial, WriteMode::PartialReplace)
            .await?;

        let edges: Vec<ResolvedEdge> = shape
            .edges
            .iter()
            .map(|stub| {
                let GraphType::Edge(edge_type) = stub.key.graph_type else {
                    unreachable!("edge stubs always carry edge keys");
                };
                ResolvedEdge {
                    src: node_id(&stub.src, &ids),
                    edge: ids[&stub.key],
                    dst: node_id(&stub.dst, &ids),
                    edge_type,
                    properties: stub.properties.clone(),
                }
            })
            .collect();
        self.upsert.create_edges(edges).await
    }

    /// Merge the batch's observed date range with whatever is already stored:
    /// start is the min over all time, end the max, recorded days a union.
    async fn reconcile_metadata(
        &self,
        scope: &IngestScope,
        ids: &HashMap<EntityKey, Uuid>,
        metadata_key: &EntityKey,
        summary: &DateSummary,
    ) -> Result<PropertyMap, StudyTraceError> {
        let metadata_id = ids[metadata_key];
        let entity_set_id = self
            .deps
            .directory
            .entity_set_id(
                scope.organization,
                EntityType::Metadata.module(),
                EntityType::Metadata.template(),
            )
            .await?
            .ok_or(StudyTraceError::NotConfigured {
                template: EntityType::Metadata.template(),
                organization: scope.organization,
            })?;

        let stored = self
            .deps
            .store
            .get_entity(entity_set_id, metadata_id)
            .await?
            .unwrap_or_default();

        let start = match stored_datetime(&stored, props::START_DATE_TIME) {
            Some(prev) => prev.min(summary.start),
            None => summary.start,
        };
        let end = match stored_datetime(&stored, props::END_DATE_TIME) {
            Some(prev) => prev.max(summary.end),
            None => summary.end,
        };

        let mut dates: BTreeSet<String> = summary.recorded_dates.clone();
        if let Some(Value::Array(stored_dates)) = stored.get(props::RECORDED_DATES) {
            dates.extend(
                stored_dates
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string),
            );
        }

        Ok(PropertyMap::from([
            (props::STUDY.to_string(), json!(scope.study)),
            (props::PARTICIPANT.to_string(), json!(scope.participant)),
            (props::START_DATE_TIME.to_string(), json!(start.to_rfc3339())),
            (props::END_DATE_TIME.to_string(), json!(end.to_rfc3339())),
            (
                props::RECORDED_DATES.to_string(),
                json!(dates.into_iter().collect::<Vec<_>>()),
            ),
        ]))
    }
}

fn node_id(node: &NodeRef, ids: &HashMap<EntityKey, Uuid>) -> Uuid {
    match node {
        NodeRef::Key(key) => ids[key],
        NodeRef::Id { id, .. } => *id,
    }
}

fn stored_datetime(properties: &PropertyMap, name: &str) -> Option<DateTime<Utc>> {
    properties
        .get(name)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
