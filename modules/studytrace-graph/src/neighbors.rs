use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use chrono::DateTime;
use chrono_tz::Tz;
use futures::Stream;
use serde_json::Value;

use studytrace_common::{
    props, Bookmark, NeighborFilter, PropertyMap, StudyTraceError, DEFAULT_TIMEZONE,
};

use crate::store::{GraphStore, NeighborRow};

/// One export row: a flat, sparse, string-keyed map ready for JSON or CSV.
/// Column names are prefixed by origin so entity and edge properties cannot
/// collide when flattened together.
pub type ExportRow = BTreeMap<String, Value>;

/// Store-side bookkeeping properties, never exported.
const INTERNAL_PROPS: &[&str] = &["entity_key", "etype"];

/// Lazy, bookmark-paginated iterator over a participant's filtered graph
/// neighborhood. Fetches one page per store round trip and transforms items
/// on the way out; nothing is materialized beyond the current page.
///
/// Sequential consumption only: `next` takes `&mut self`, so concurrent
/// consumers need their own external serialization. A fetch already issued
/// always completes; cancellation is just not calling `next` again.
pub struct NeighborPageIterator {
    store: Arc<dyn GraphStore>,
    filter: NeighborFilter,
    excluded: HashSet<String>,
    page_size: usize,
    bookmark: Option<Bookmark>,
    page: Vec<NeighborRow>,
    offset: usize,
    started: bool,
    exhausted: bool,
}

impl NeighborPageIterator {
    pub fn new(
        store: Arc<dyn GraphStore>,
        filter: NeighborFilter,
        excluded: HashSet<String>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            filter,
            excluded,
            page_size,
            bookmark: None,
            page: Vec::new(),
            offset: 0,
            started: false,
            exhausted: false,
        }
    }

    /// Next transformed row, or `Ok(None)` once the traversal is exhausted.
    /// Exhaustion is terminal: every later call returns `Ok(None)`.
    pub async fn next(&mut self) -> Result<Option<ExportRow>, StudyTraceError> {
        loop {
            if self.exhausted {
                return Ok(None);
            }

            if self.offset < self.page.len() {
                let row = transform(&self.page[self.offset], &self.excluded);
                self.offset += 1;
                return Ok(Some(row));
            }

            // Current page drained. No bookmark after the first fetch means
            // the store has nothing further.
            if self.started && self.bookmark.is_none() {
                self.exhausted = true;
                return Ok(None);
            }

            let page = self
                .store
                .page_neighbors(&self.filter, self.bookmark.take(), self.page_size)
                .await?;
            self.started = true;

            if page.rows.is_empty() {
                self.exhausted = true;
                return Ok(None);
            }
            self.bookmark = page.bookmark;
            self.page = page.rows;
            self.offset = 0;
        }
    }

    /// Adapt into a `Stream` for async consumers. Errors end the stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<ExportRow, StudyTraceError>> + Send {
        futures::stream::try_unfold(self, |mut iter| async move {
            Ok(iter.next().await?.map(|row| (row, iter)))
        })
    }
}

/// Per-item transform, in order: property exclusion, timezone normalization,
/// column relabeling.
fn transform(row: &NeighborRow, excluded: &HashSet<String>) -> ExportRow {
    let timezone = row
        .entity
        .get(props::TIMEZONE)
        .and_then(Value::as_str)
        .and_then(|name| Tz::from_str(name).ok())
        .unwrap_or_else(|| {
            Tz::from_str(DEFAULT_TIMEZONE).expect("default timezone is always valid")
        });

    let mut out = ExportRow::new();
    flatten(
        &row.entity,
        row.entity_type.derivation_only(),
        excluded,
        timezone,
        row.entity_type.template(),
        &mut out,
    );
    flatten(
        &row.edge,
        row.edge_type.derivation_only(),
        excluded,
        timezone,
        row.edge_type.template(),
        &mut out,
    );
    out
}

fn flatten(
    properties: &PropertyMap,
    derivation_only: &[&str],
    excluded: &HashSet<String>,
    timezone: Tz,
    prefix: &str,
    out: &mut ExportRow,
) {
    for (name, value) in properties {
        if INTERNAL_PROPS.contains(&name.as_str())
            || derivation_only.contains(&name.as_str())
            || excluded.contains(name)
        {
            continue;
        }
        out.insert(format!("{prefix}.{name}"), normalize(value, timezone));
    }
}

/// Date/time-typed values are reinterpreted in the entity's timezone and
/// rendered as strings; everything else passes through untouched.
fn normalize(value: &Value, timezone: Tz) -> Value {
    match value {
        Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(dt) => Value::String(dt.with_timezone(&timezone).to_rfc3339()),
            Err(_) => value.clone(),
        },
        Value::Array(items) => Value::Array(
            items.iter().map(|item| normalize(item, timezone)).collect(),
        ),
        other => other.clone(),
    }
}
