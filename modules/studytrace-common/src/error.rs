use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StudyTraceError {
    /// A record lacks a property required to derive its key. Recovered
    /// locally: the record is dropped and the batch continues.
    #[error("record is missing identity property '{property}' for {graph_type}")]
    MissingIdentityProperty {
        graph_type: &'static str,
        property: &'static str,
    },

    /// The store failed to return ids for every requested key. Fatal for the
    /// batch; the store protocol guarantees a 1:1 response.
    #[error("store resolved {resolved} of {requested} keys")]
    ResolutionIncomplete { requested: usize, resolved: usize },

    #[error("unknown participant '{0}'")]
    UnknownParticipant(String),

    #[error("unknown study '{0}'")]
    UnknownStudy(String),

    /// The organization has no entity set configured for a template. A
    /// configuration gap, not a crash.
    #[error("no entity set configured for template '{template}' (organization: {organization:?})")]
    NotConfigured {
        template: &'static str,
        organization: Option<Uuid>,
    },

    #[error("graph store unavailable: {0}")]
    StoreUnavailable(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
