//! Chunking and merge strategies for critical operations.
//!
//! A [`ChunkPlan`] is resolved per operation name when a target is registered,
//! so the executor never dispatches on operation strings at call time.

use crate::core::{FleetError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;

// ============================================================================
// Split
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SplitStrategy {
    /// One chunk carrying the payload unchanged.
    Passthrough,
    /// Caps a result-count parameter, paging through larger requests with an offset.
    Paged {
        #[serde(default = "default_limit_field")]
        limit_field: String,
        #[serde(default = "default_offset_field")]
        offset_field: String,
        page_size: usize,
        /// Requests needing more pages than this are rejected.
        #[serde(default = "default_max_chunks")]
        max_chunks: usize,
    },
    /// Slices an array-valued field into groups of `size`.
    Partition { field: String, size: usize },
}

fn default_limit_field() -> String {
    "limit".to_string()
}

fn default_offset_field() -> String {
    "offset".to_string()
}

pub(crate) fn default_max_chunks() -> usize {
    50
}

impl SplitStrategy {
    pub fn paged(page_size: usize, max_chunks: usize) -> Self {
        Self::Paged {
            limit_field: default_limit_field(),
            offset_field: default_offset_field(),
            page_size,
            max_chunks,
        }
    }

    /// Splits `payload` into an ordered, non-empty sequence of chunk payloads.
    ///
    /// Paged chunks are produced lazily. Fails with `InvalidPayload` when the
    /// requested window overflows or needs more than `max_chunks` pages.
    pub fn split(&self, payload: &Value) -> Result<Chunks> {
        match self {
            Self::Passthrough => Ok(Chunks::ready(vec![payload.clone()])),
            Self::Paged {
                limit_field,
                offset_field,
                page_size,
                max_chunks,
            } => split_paged(
                payload,
                limit_field,
                offset_field,
                (*page_size).max(1),
                (*max_chunks).max(1),
            ),
            Self::Partition { field, size } => {
                Ok(Chunks::ready(split_partition(payload, field, (*size).max(1))))
            }
        }
    }
}

/// Chunk payloads in dispatch order.
#[derive(Debug)]
pub enum Chunks {
    Ready(std::vec::IntoIter<Value>),
    Pages(PageIter),
}

impl Chunks {
    fn ready(values: Vec<Value>) -> Self {
        Self::Ready(values.into_iter())
    }
}

impl Iterator for Chunks {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            Self::Ready(values) => values.next(),
            Self::Pages(pages) => pages.next(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            Self::Ready(values) => values.size_hint(),
            Self::Pages(pages) => pages.size_hint(),
        }
    }
}

impl ExactSizeIterator for Chunks {}

/// Builds one `{offset, limit}` page payload per call to `next`.
#[derive(Debug)]
pub struct PageIter {
    template: Map<String, Value>,
    limit_field: String,
    offset_field: String,
    page: u64,
    base_offset: u64,
    limit: u64,
    start: u64,
}

impl Iterator for PageIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        if self.start >= self.limit {
            return None;
        }
        let mut chunk = self.template.clone();
        chunk.insert(self.offset_field.clone(), json!(self.base_offset + self.start));
        chunk.insert(
            self.limit_field.clone(),
            json!(self.page.min(self.limit - self.start)),
        );
        self.start = self.start.saturating_add(self.page);
        Some(Value::Object(chunk))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.limit.saturating_sub(self.start).div_ceil(self.page) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PageIter {}

fn split_paged(
    payload: &Value,
    limit_field: &str,
    offset_field: &str,
    page_size: usize,
    max_chunks: usize,
) -> Result<Chunks> {
    let Some(object) = payload.as_object() else {
        return Ok(Chunks::ready(vec![payload.clone()]));
    };

    let requested = object.get(limit_field).and_then(Value::as_u64);
    let page = page_size as u64;
    match requested {
        None => {
            let mut capped = object.clone();
            capped.insert(limit_field.to_string(), json!(page));
            Ok(Chunks::ready(vec![Value::Object(capped)]))
        }
        Some(limit) if limit <= page => Ok(Chunks::ready(vec![payload.clone()])),
        Some(limit) => {
            let base_offset = object.get(offset_field).and_then(Value::as_u64).unwrap_or(0);
            if base_offset.checked_add(limit).is_none() {
                return Err(FleetError::InvalidPayload(format!(
                    "{} {} plus {} {} overflows",
                    offset_field, base_offset, limit_field, limit
                )));
            }
            let pages = limit.div_ceil(page);
            if pages > max_chunks as u64 {
                return Err(FleetError::InvalidPayload(format!(
                    "{} {} needs {} chunks of {}, at most {} allowed",
                    limit_field, limit, pages, page, max_chunks
                )));
            }
            Ok(Chunks::Pages(PageIter {
                template: object.clone(),
                limit_field: limit_field.to_string(),
                offset_field: offset_field.to_string(),
                page,
                base_offset,
                limit,
                start: 0,
            }))
        }
    }
}

fn split_partition(payload: &Value, field: &str, size: usize) -> Vec<Value> {
    let items = match payload.get(field).and_then(Value::as_array) {
        Some(items) if items.len() > size => items,
        _ => return vec![payload.clone()],
    };

    items
        .chunks(size)
        .map(|slice| {
            let mut chunk = payload.clone();
            chunk[field] = Value::Array(slice.to_vec());
            chunk
        })
        .collect()
}

// ============================================================================
// Merge
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Concatenates list-bearing responses and sums their totals.
    Concatenate {
        #[serde(default = "default_list_field")]
        list_field: String,
        #[serde(default = "default_total_field")]
        total_field: String,
    },
    /// Takes the first successful chunk result.
    FirstSuccess,
}

fn default_list_field() -> String {
    "results".to_string()
}

fn default_total_field() -> String {
    "total".to_string()
}

impl MergeStrategy {
    pub fn concatenate() -> Self {
        Self::Concatenate {
            list_field: default_list_field(),
            total_field: default_total_field(),
        }
    }

    /// Merges chunk results in order; `None` entries are failed chunks.
    pub fn merge(&self, results: &[Option<Value>]) -> Result<Value> {
        let successes: Vec<&Value> = results.iter().flatten().collect();
        if successes.is_empty() {
            return Err(FleetError::AttemptFailure("all chunks failed".to_string()));
        }

        match self {
            Self::FirstSuccess => Ok(successes[0].clone()),
            Self::Concatenate {
                list_field,
                total_field,
            } => {
                let mut merged_list = Vec::new();
                let mut total = 0u64;
                for value in successes {
                    if let Some(items) = value.get(list_field).and_then(Value::as_array) {
                        merged_list.extend(items.iter().cloned());
                    }
                    total += value.get(total_field).and_then(Value::as_u64).unwrap_or(0);
                }

                let mut out = Map::new();
                out.insert(list_field.clone(), Value::Array(merged_list));
                out.insert(total_field.clone(), json!(total));
                out.insert("chunked".to_string(), Value::Bool(true));
                Ok(Value::Object(out))
            }
        }
    }
}

// ============================================================================
// Failure policy
// ============================================================================

/// How failures of chunks after the first weigh on the attempt.
/// A failed first chunk is always fatal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkFailurePolicy {
    /// Fail when more than half of all chunks failed.
    #[default]
    Majority,
    /// Any chunk failure fails the attempt.
    Strict,
    /// Later chunks may all fail; they merge as `null`.
    Lenient,
}

impl ChunkFailurePolicy {
    pub fn aborts_on_failure(&self) -> bool {
        matches!(self, Self::Strict)
    }

    pub fn check(&self, total: usize, failed: usize) -> Result<()> {
        let fatal = match self {
            Self::Strict => failed > 0,
            Self::Majority => failed * 2 > total,
            Self::Lenient => false,
        };
        if fatal {
            return Err(FleetError::AttemptFailure(format!(
                "{} of {} chunks failed",
                failed, total
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Plans
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkPlan {
    pub split: SplitStrategy,
    pub merge: MergeStrategy,
    #[serde(default)]
    pub failure: ChunkFailurePolicy,
}

impl ChunkPlan {
    pub fn passthrough() -> Self {
        Self {
            split: SplitStrategy::Passthrough,
            merge: MergeStrategy::FirstSuccess,
            failure: ChunkFailurePolicy::default(),
        }
    }

    pub fn paged_list(page_size: usize, max_chunks: usize) -> Self {
        Self {
            split: SplitStrategy::paged(page_size, max_chunks),
            merge: MergeStrategy::concatenate(),
            failure: ChunkFailurePolicy::default(),
        }
    }
}

/// Operation name -> plan lookup used when targets are registered.
#[derive(Debug, Clone)]
pub struct PlanTable {
    entries: HashMap<String, ChunkPlan>,
    fallback: ChunkPlan,
}

impl PlanTable {
    pub fn new(fallback: ChunkPlan) -> Self {
        Self {
            entries: HashMap::new(),
            fallback,
        }
    }

    /// Built-in plans: record searches page by `chunk_size`, everything else passes through.
    pub fn builtin(chunk_size: usize, max_chunks: usize) -> Self {
        Self::new(ChunkPlan::passthrough())
            .with("search_clients", ChunkPlan::paged_list(chunk_size, max_chunks))
            .with("search_trips", ChunkPlan::paged_list(chunk_size, max_chunks))
    }

    pub fn with(mut self, operation: impl Into<String>, plan: ChunkPlan) -> Self {
        self.entries.insert(operation.into(), plan);
        self
    }

    pub fn resolve(&self, operation: &str) -> ChunkPlan {
        self.entries
            .get(operation)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}
