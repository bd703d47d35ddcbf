// Download-side integration tests: ingest through the real pipeline, then
// stream the participant's neighborhood back out.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use studytrace_common::{props, EntityType, PropertyMap, UploadBatch};
use studytrace_graph::testutil::{MemoryGraphStore, StaticEnrollment};
use studytrace_graph::{
    EntitySetDirectory, ExportService, IngestDeps, IngestService, LegacyDirectory, NeighborKind,
};

const STUDY: &str = "sleep-study";
const PARTICIPANT: &str = "p-001";

fn participant_id() -> Uuid {
    Uuid::from_u128(0xa1)
}

fn directory() -> Arc<dyn EntitySetDirectory> {
    let types = [
        EntityType::Study,
        EntityType::Participant,
        EntityType::Device,
        EntityType::UserApp,
        EntityType::AppData,
        EntityType::Metadata,
        EntityType::Question,
        EntityType::Answer,
        EntityType::Submission,
        EntityType::TimeRange,
    ];
    Arc::new(LegacyDirectory::new(types.iter().enumerate().map(|(i, t)| {
        (t.module(), t.template().to_string(), Uuid::from_u128(0x1000 + i as u128))
    })))
}

fn ingest(store: Arc<MemoryGraphStore>) -> IngestService {
    let enrollment = Arc::new(StaticEnrollment::single(
        STUDY,
        Uuid::from_u128(0x51),
        PARTICIPANT,
        participant_id(),
    ));
    IngestService::new(
        IngestDeps::builder()
            .store(store)
            .directory(directory())
            .enrollment(enrollment)
            .build(),
    )
}

fn usage_record(package: &str, logged: &str) -> PropertyMap {
    PropertyMap::from([
        (props::PACKAGE_NAME.to_string(), json!(package)),
        (props::DATE_LOGGED.to_string(), json!(logged)),
    ])
}

async fn seeded_store() -> Arc<MemoryGraphStore> {
    let store = Arc::new(MemoryGraphStore::new());
    let service = ingest(store.clone());
    let batch = UploadBatch::builder()
        .study(STUDY.into())
        .participant(PARTICIPANT.into())
        .device(Some("device-abc".into()))
        .records(vec![
            usage_record("com.spotify.music", "2024-03-01T08:00:00Z"),
            usage_record("com.duolingo", "2024-03-02T19:30:00Z"),
        ])
        .build();
    service.upload_app_usage(batch).await.unwrap();
    store
}

#[tokio::test]
async fn app_usage_download_streams_apps_and_metadata() {
    let store = seeded_store().await;
    let export = ExportService::new(store, 100);
    let mut iter = export.participant_neighborhood(
        participant_id(),
        NeighborKind::AppUsage,
        HashSet::new(),
    );

    let mut packages = Vec::new();
    let mut metadata_rows = 0;
    while let Some(row) = iter.next().await.unwrap() {
        if let Some(package) = row.get("user_app.package_name") {
            packages.push(package.as_str().unwrap().to_string());
            // The USED_BY timestamp came along from the edge side.
            assert!(row.contains_key("used_by.date_time"));
        } else {
            assert!(row.contains_key("metadata.recorded_dates"));
            metadata_rows += 1;
        }
    }

    packages.sort();
    assert_eq!(packages, vec!["com.duolingo", "com.spotify.music"]);
    assert_eq!(metadata_rows, 1);
}

#[tokio::test]
async fn small_pages_traverse_the_whole_neighborhood() {
    let store = seeded_store().await;
    // Page size 1 forces a bookmark round trip per row.
    let export = ExportService::new(store, 1);
    let mut iter = export.participant_neighborhood(
        participant_id(),
        NeighborKind::AppUsage,
        HashSet::new(),
    );

    let mut rows = 0;
    while iter.next().await.unwrap().is_some() {
        rows += 1;
    }
    // Two USED_BY rows plus the metadata HAS row.
    assert_eq!(rows, 3);
    // Exhaustion is terminal.
    assert!(iter.next().await.unwrap().is_none());
}

#[tokio::test]
async fn caller_exclusions_remove_columns_from_every_row() {
    let store = seeded_store().await;
    let export = ExportService::new(store, 100);
    let mut iter = export.participant_neighborhood(
        participant_id(),
        NeighborKind::AppUsage,
        HashSet::from([props::PACKAGE_NAME.to_string()]),
    );

    while let Some(row) = iter.next().await.unwrap() {
        assert!(!row.contains_key("user_app.package_name"));
    }
}

#[tokio::test]
async fn questionnaire_download_sees_only_submissions() {
    let store = seeded_store().await;
    let service = ingest(store.clone());
    let submission = studytrace_common::SurveySubmission::builder()
        .study(STUDY.into())
        .participant(PARTICIPANT.into())
        .submitted_at("2024-01-10T18:00:00Z".parse().unwrap())
        .responses(vec![studytrace_common::QuestionResponse::builder()
            .question_code("q1".into())
            .values(vec!["7".into()])
            .build()])
        .build();
    service.submit_questionnaire(submission).await.unwrap();

    let export = ExportService::new(store, 100);
    let mut iter = export.participant_neighborhood(
        participant_id(),
        NeighborKind::Questionnaire,
        HashSet::new(),
    );

    let mut rows = Vec::new();
    while let Some(row) = iter.next().await.unwrap() {
        rows.push(row);
    }
    assert_eq!(rows.len(), 1);
    // Submission timestamp renders in the default export timezone.
    let value = rows[0]["submission.date_time"].as_str().unwrap();
    assert!(value.ends_with("-08:00"));
    // Edge-origin column is prefixed separately from the entity-origin one.
    assert!(rows[0].contains_key("responds_with.date_time"));
}
