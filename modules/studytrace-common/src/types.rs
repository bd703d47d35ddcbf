use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Dynamic, sparse property bag attached to entities and edges.
pub type PropertyMap = HashMap<String, serde_json::Value>;

// --- Property names ---

/// Canonical property names shared by the shape builder, the store, and export.
pub mod props {
    pub const ID: &str = "id";
    pub const STRING_ID: &str = "string_id";
    pub const PACKAGE_NAME: &str = "package_name";
    pub const TITLE: &str = "title";
    pub const DATE_LOGGED: &str = "date_logged";
    pub const RECORDED_DATE: &str = "recorded_date";
    pub const RECORDED_DATES: &str = "recorded_dates";
    pub const START_DATE_TIME: &str = "start_date_time";
    pub const END_DATE_TIME: &str = "end_date_time";
    pub const DATE_TIME: &str = "date_time";
    pub const START: &str = "start";
    pub const END: &str = "end";
    pub const VALUES: &str = "values";
    pub const QUESTION_CODE: &str = "question_code";
    pub const TIMEZONE: &str = "timezone";

    // Derivation-only context fields. Mixed into identity hashes so raw
    // occurrences from different participants/devices never collide, then
    // stripped before anything is persisted.
    pub const PARTICIPANT: &str = "participant";
    pub const STUDY: &str = "study";
    pub const DEVICE: &str = "device";
    pub const SRC: &str = "src";
    pub const DST: &str = "dst";
}

// --- Constants ---

/// Timezone applied when an entity carries no `timezone` property of its own.
pub const DEFAULT_TIMEZONE: &str = "America/Los_Angeles";

/// Android packages that report usage events but carry no behavioral signal.
/// Records for these are dropped before they ever reach the graph.
pub const SYSTEM_APP_PACKAGES: &[&str] = &[
    "com.android.systemui",
    "com.android.launcher",
    "com.android.settings",
    "com.android.vending",
    "com.android.phone",
    "com.android.server.telecom",
    "com.samsung.android.incallui",
    "com.samsung.android.app.launcher",
    "com.google.android.gms",
    "com.google.android.packageinstaller",
    "com.google.android.setupwizard",
];

/// True for packages in the exclusion set, including vendor launcher variants.
pub fn is_system_app(package: &str) -> bool {
    SYSTEM_APP_PACKAGES.contains(&package)
        || package.starts_with("com.android.internal")
        || package.ends_with(".launcher")
}

// --- App modules ---

/// Which installable app module owns an entity/edge template. Organizations
/// enable modules independently; a template lookup for a module the
/// organization lacks is a configuration gap, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppModule {
    DataCollection,
    Surveys,
}

impl std::fmt::Display for AppModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppModule::DataCollection => write!(f, "data_collection"),
            AppModule::Surveys => write!(f, "surveys"),
        }
    }
}

// --- Entity types ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Study,
    Participant,
    Device,
    UserApp,
    AppData,
    Metadata,
    Question,
    Answer,
    Submission,
    TimeRange,
}

impl EntityType {
    /// Graph label, also used as the entity-origin column prefix source.
    pub fn label(&self) -> &'static str {
        match self {
            EntityType::Study => "Study",
            EntityType::Participant => "Participant",
            EntityType::Device => "Device",
            EntityType::UserApp => "UserApp",
            EntityType::AppData => "AppData",
            EntityType::Metadata => "Metadata",
            EntityType::Question => "Question",
            EntityType::Answer => "Answer",
            EntityType::Submission => "Submission",
            EntityType::TimeRange => "TimeRange",
        }
    }

    /// Template name the entity-set directory resolves per organization.
    pub fn template(&self) -> &'static str {
        match self {
            EntityType::Study => "study",
            EntityType::Participant => "participant",
            EntityType::Device => "device",
            EntityType::UserApp => "user_app",
            EntityType::AppData => "app_data",
            EntityType::Metadata => "metadata",
            EntityType::Question => "question",
            EntityType::Answer => "answer",
            EntityType::Submission => "submission",
            EntityType::TimeRange => "time_range",
        }
    }

    pub fn module(&self) -> AppModule {
        match self {
            EntityType::Study
            | EntityType::Participant
            | EntityType::Device
            | EntityType::UserApp
            | EntityType::AppData
            | EntityType::Metadata => AppModule::DataCollection,
            EntityType::Question
            | EntityType::Answer
            | EntityType::Submission
            | EntityType::TimeRange => AppModule::Surveys,
        }
    }

    /// Ordered property names hashed into this type's EntityKey.
    ///
    /// An empty subset means "all properties, sorted by name" — raw-occurrence
    /// types (AppData, Answer) are addressed by their full content so that
    /// re-uploads converge while distinct occurrences stay distinct.
    pub fn identity_subset(&self) -> &'static [&'static str] {
        match self {
            EntityType::Study => &[props::STRING_ID],
            EntityType::Participant => &[props::STUDY, props::STRING_ID],
            EntityType::Device => &[props::STRING_ID],
            EntityType::UserApp => &[props::PACKAGE_NAME],
            EntityType::AppData => &[],
            EntityType::Metadata => &[props::STUDY, props::PARTICIPANT],
            EntityType::Question => &[props::QUESTION_CODE],
            EntityType::Answer => &[],
            EntityType::Submission => &[props::STUDY, props::PARTICIPANT, props::DATE_TIME],
            EntityType::TimeRange => &[props::START, props::END],
        }
    }

    /// Properties that only exist to derive the key and are stripped before
    /// anything is written to the store.
    pub fn derivation_only(&self) -> &'static [&'static str] {
        match self {
            EntityType::AppData => &[props::STUDY, props::PARTICIPANT, props::DEVICE],
            EntityType::Metadata => &[props::STUDY, props::PARTICIPANT],
            EntityType::Answer => &[
                props::STUDY,
                props::PARTICIPANT,
                props::QUESTION_CODE,
                props::DATE_TIME,
            ],
            EntityType::Submission => &[props::STUDY, props::PARTICIPANT],
            _ => &[],
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

// --- Edge types ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    UsedBy,
    RecordedBy,
    RespondsWith,
    Addresses,
    RegisteredFor,
    PartOf,
    Has,
    ParticipatedIn,
}

impl EdgeType {
    /// Relationship type in the graph, also the edge-origin column prefix source.
    pub fn label(&self) -> &'static str {
        match self {
            EdgeType::UsedBy => "USED_BY",
            EdgeType::RecordedBy => "RECORDED_BY",
            EdgeType::RespondsWith => "RESPONDS_WITH",
            EdgeType::Addresses => "ADDRESSES",
            EdgeType::RegisteredFor => "REGISTERED_FOR",
            EdgeType::PartOf => "PART_OF",
            EdgeType::Has => "HAS",
            EdgeType::ParticipatedIn => "PARTICIPATED_IN",
        }
    }

    pub fn template(&self) -> &'static str {
        match self {
            EdgeType::UsedBy => "used_by",
            EdgeType::RecordedBy => "recorded_by",
            EdgeType::RespondsWith => "responds_with",
            EdgeType::Addresses => "addresses",
            EdgeType::RegisteredFor => "registered_for",
            EdgeType::PartOf => "part_of",
            EdgeType::Has => "has",
            EdgeType::ParticipatedIn => "participated_in",
        }
    }

    pub fn module(&self) -> AppModule {
        match self {
            EdgeType::UsedBy
            | EdgeType::RecordedBy
            | EdgeType::Has
            | EdgeType::ParticipatedIn => AppModule::DataCollection,
            EdgeType::RespondsWith
            | EdgeType::Addresses
            | EdgeType::RegisteredFor
            | EdgeType::PartOf => AppModule::Surveys,
        }
    }

    /// Identity tuple for the edge's own EntityKey. Edges without a
    /// protocol-assigned tuple are addressed by their endpoint digests.
    pub fn identity_subset(&self) -> &'static [&'static str] {
        match self {
            EdgeType::RecordedBy => &[props::RECORDED_DATE, props::DEVICE, props::PACKAGE_NAME],
            EdgeType::UsedBy => &[props::PACKAGE_NAME, props::RECORDED_DATE, props::PARTICIPANT],
            EdgeType::RespondsWith => &[props::STUDY, props::PARTICIPANT, props::DATE_TIME],
            EdgeType::Addresses
            | EdgeType::RegisteredFor
            | EdgeType::PartOf
            | EdgeType::Has
            | EdgeType::ParticipatedIn => &[props::SRC, props::DST],
        }
    }

    pub fn derivation_only(&self) -> &'static [&'static str] {
        match self {
            EdgeType::RecordedBy => &[props::RECORDED_DATE, props::DEVICE, props::PACKAGE_NAME],
            EdgeType::UsedBy => &[props::PACKAGE_NAME, props::RECORDED_DATE, props::PARTICIPANT],
            EdgeType::RespondsWith => &[props::STUDY, props::PARTICIPANT],
            EdgeType::Addresses
            | EdgeType::RegisteredFor
            | EdgeType::PartOf
            | EdgeType::Has
            | EdgeType::ParticipatedIn => &[props::SRC, props::DST],
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

// --- Keys ---

/// The subject of identity derivation: a node type or an edge type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphType {
    Entity(EntityType),
    Edge(EdgeType),
}

impl GraphType {
    pub fn name(&self) -> &'static str {
        match self {
            GraphType::Entity(t) => t.label(),
            GraphType::Edge(t) => t.label(),
        }
    }

    pub fn identity_subset(&self) -> &'static [&'static str] {
        match self {
            GraphType::Entity(t) => t.identity_subset(),
            GraphType::Edge(t) => t.identity_subset(),
        }
    }

    pub fn derivation_only(&self) -> &'static [&'static str] {
        match self {
            GraphType::Entity(t) => t.derivation_only(),
            GraphType::Edge(t) => t.derivation_only(),
        }
    }
}

/// Content-derived identifier for an entity or edge, independent of the store.
/// Two records with equal identity-subset values map to the same key, which is
/// what makes re-uploads converge instead of duplicating.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub graph_type: GraphType,
    pub digest: String,
}

// --- Write modes ---

/// How an upsert treats properties already present on the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Union with stored properties; stored values for absent names survive.
    Merge,
    /// The entity's property set becomes exactly the given map.
    Replace,
    /// Given properties overwrite stored values wholesale; others survive.
    PartialReplace,
}

// --- Request-scoped batch types ---

/// One app-usage ingestion call: scope plus raw records. Lives for the
/// duration of processing only.
#[derive(Debug, Clone, TypedBuilder)]
pub struct UploadBatch {
    #[builder(default)]
    pub organization: Option<Uuid>,
    pub study: String,
    pub participant: String,
    #[builder(default)]
    pub device: Option<String>,
    pub records: Vec<PropertyMap>,
}

/// One answered question within a questionnaire or time-use-diary submission.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct QuestionResponse {
    pub question_code: String,
    #[builder(default)]
    pub question_title: Option<String>,
    pub values: Vec<String>,
    /// Start/end of the diary time block this response covers, if any.
    #[builder(default)]
    pub start: Option<DateTime<Utc>>,
    #[builder(default)]
    pub end: Option<DateTime<Utc>>,
}

/// One questionnaire or time-use-diary submission call.
#[derive(Debug, Clone, TypedBuilder)]
pub struct SurveySubmission {
    #[builder(default)]
    pub organization: Option<Uuid>,
    pub study: String,
    pub participant: String,
    pub submitted_at: DateTime<Utc>,
    pub responses: Vec<QuestionResponse>,
}

// --- Traversal types ---

/// Scopes one neighbor-traversal query.
#[derive(Debug, Clone)]
pub struct NeighborFilter {
    pub anchor_ids: Vec<Uuid>,
    pub source_types: Vec<EntityType>,
    pub destination_types: Vec<EntityType>,
    pub edge_types: Vec<EdgeType>,
}

/// Opaque pagination cursor returned by the store. Re-submitting the same
/// filter with it yields the next page; callers never inspect the contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark(pub String);
