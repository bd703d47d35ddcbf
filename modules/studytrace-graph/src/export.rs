use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use studytrace_common::{EdgeType, EntityType, NeighborFilter};

use crate::neighbors::NeighborPageIterator;
use crate::store::GraphStore;

/// Which slice of a participant's neighborhood a download covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborKind {
    AppUsage,
    Questionnaire,
    TimeUseDiary,
}

impl NeighborKind {
    /// Traversal scope for this kind, anchored at the participant.
    fn filter(&self, participant_id: Uuid) -> NeighborFilter {
        match self {
            // Apps point at the participant via USED_BY; the coverage
            // metadata hangs off the participant via HAS.
            NeighborKind::AppUsage => NeighborFilter {
                anchor_ids: vec![participant_id],
                source_types: vec![EntityType::UserApp],
                destination_types: vec![EntityType::Metadata],
                edge_types: vec![EdgeType::UsedBy, EdgeType::Has],
            },
            NeighborKind::Questionnaire | NeighborKind::TimeUseDiary => NeighborFilter {
                anchor_ids: vec![participant_id],
                source_types: vec![],
                destination_types: vec![EntityType::Submission],
                edge_types: vec![EdgeType::RespondsWith],
            },
        }
    }
}

/// Read surface for participant downloads. Rows stream lazily; any store
/// failure mid-traversal surfaces as an error on `next`, and callers abort
/// the whole response rather than ship a partial file.
pub struct ExportService {
    store: Arc<dyn GraphStore>,
    page_size: usize,
}

impl ExportService {
    pub fn new(store: Arc<dyn GraphStore>, page_size: usize) -> Self {
        Self { store, page_size }
    }

    /// Lazily iterate one participant's neighborhood of the given kind.
    /// `excluded` names extra properties to drop from every row, on top of
    /// the derivation-only and bookkeeping properties that never export.
    pub fn participant_neighborhood(
        &self,
        participant_id: Uuid,
        kind: NeighborKind,
        excluded: HashSet<String>,
    ) -> NeighborPageIterator {
        NeighborPageIterator::new(
            self.store.clone(),
            kind.filter(participant_id),
            excluded,
            self.page_size,
        )
    }
}
