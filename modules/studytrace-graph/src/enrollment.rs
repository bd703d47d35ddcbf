use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use studytrace_common::StudyTraceError;

/// Resolves participant and study string ids to store ids. Checked before any
/// mutation so an unknown participant never writes anything.
#[async_trait]
pub trait EnrollmentLookup: Send + Sync {
    async fn participant_id(
        &self,
        organization: Option<Uuid>,
        study: &str,
        participant: &str,
    ) -> Result<Option<Uuid>, StudyTraceError>;

    async fn study_id(
        &self,
        organization: Option<Uuid>,
        study: &str,
    ) -> Result<Option<Uuid>, StudyTraceError>;
}

/// Full enrollment mapping as loaded from the deployment's registry.
#[derive(Debug, Default, Clone)]
pub struct EnrollmentTable {
    pub studies: HashMap<(Option<Uuid>, String), Uuid>,
    pub participants: HashMap<(Option<Uuid>, String, String), Uuid>,
}

#[async_trait]
pub trait EnrollmentSource: Send + Sync {
    async fn load(&self) -> Result<EnrollmentTable, StudyTraceError>;
}

struct EnrollmentSnapshot {
    table: EnrollmentTable,
    loaded_at: Instant,
}

/// Periodically refreshed snapshot of enrollments, same contract as the
/// entity-set directory: stale reads over blocked reads, failed refreshes
/// keep the previous snapshot.
pub struct CachedEnrollment {
    source: Arc<dyn EnrollmentSource>,
    snapshot: ArcSwap<EnrollmentSnapshot>,
    ttl: Duration,
}

impl CachedEnrollment {
    pub async fn load(
        source: Arc<dyn EnrollmentSource>,
        ttl: Duration,
    ) -> Result<Self, StudyTraceError> {
        let table = source.load().await?;
        info!(
            studies = table.studies.len(),
            participants = table.participants.len(),
            "loaded enrollment table"
        );
        Ok(Self {
            source,
            snapshot: ArcSwap::new(Arc::new(EnrollmentSnapshot {
                table,
                loaded_at: Instant::now(),
            })),
            ttl,
        })
    }

    pub async fn refresh(&self) -> Result<(), StudyTraceError> {
        let table = self.source.load().await?;
        self.snapshot.store(Arc::new(EnrollmentSnapshot {
            table,
            loaded_at: Instant::now(),
        }));
        Ok(())
    }

    async fn refresh_if_stale(&self) {
        if self.snapshot.load().loaded_at.elapsed() < self.ttl {
            return;
        }
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "enrollment refresh failed, serving stale snapshot");
        }
    }
}

#[async_trait]
impl EnrollmentLookup for CachedEnrollment {
    async fn participant_id(
        &self,
        organization: Option<Uuid>,
        study: &str,
        participant: &str,
    ) -> Result<Option<Uuid>, StudyTraceError> {
        self.refresh_if_stale().await;
        let snapshot = self.snapshot.load();
        Ok(snapshot
            .table
            .participants
            .get(&(organization, study.to_string(), participant.to_string()))
            .copied())
    }

    async fn study_id(
        &self,
        organization: Option<Uuid>,
        study: &str,
    ) -> Result<Option<Uuid>, StudyTraceError> {
        self.refresh_if_stale().await;
        let snapshot = self.snapshot.load();
        Ok(snapshot
            .table
            .studies
            .get(&(organization, study.to_string()))
            .copied())
    }
}
