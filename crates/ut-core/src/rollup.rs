//! Rollups over persisted hour buckets.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::bucket::{BucketAggregate, BucketWidth};
use crate::store::AggregateStore;

/// Total usage across entities for one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageTotal {
    pub bucket_start_ms: i64,
    pub total_duration_ms: i64,
    pub total_count: i64,
}

/// Total usage of one entity over a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityUsage {
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub total_duration_ms: i64,
    pub total_count: i64,
}

impl EntityUsage {
    /// Display name if registered, otherwise the raw id.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.entity_id)
    }
}

/// Group rows into `width` buckets and keep those starting in `[start_ms, end_ms)`.
///
/// The range filter is applied after re-bucketing, so a row is attributed
/// to the bucket containing its own start instant.
pub fn rebucket(
    rows: &[BucketAggregate],
    width: BucketWidth,
    start_ms: i64,
    end_ms: i64,
) -> Vec<UsageTotal> {
    let mut grouped: BTreeMap<i64, (i64, i64)> = BTreeMap::new();
    for row in rows {
        let (duration, count) = grouped.entry(width.floor(row.bucket_start_ms)).or_default();
        *duration += row.duration_ms;
        *count += row.occurrence_count;
    }

    grouped
        .range(start_ms..end_ms.max(start_ms))
        .map(|(&bucket_start_ms, &(total_duration_ms, total_count))| UsageTotal {
            bucket_start_ms,
            total_duration_ms,
            total_count,
        })
        .collect()
}

/// Sum rows per entity, sorted by duration descending then entity id.
pub fn summarize_entities(
    rows: &[BucketAggregate],
    display_names: &HashMap<String, String>,
) -> Vec<EntityUsage> {
    let mut totals: HashMap<&str, (i64, i64)> = HashMap::new();
    for row in rows {
        let (duration, count) = totals.entry(row.entity_id.as_str()).or_default();
        *duration += row.duration_ms;
        *count += row.occurrence_count;
    }

    let mut summary: Vec<EntityUsage> = totals
        .into_iter()
        .map(|(entity_id, (total_duration_ms, total_count))| EntityUsage {
            entity_id: entity_id.to_string(),
            display_name: display_names.get(entity_id).cloned(),
            total_duration_ms,
            total_count,
        })
        .collect();
    summary.sort_by(|a, b| {
        b.total_duration_ms
            .cmp(&a.total_duration_ms)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    summary
}

/// Usage totals per bucket of `width` in `[start_ms, end_ms)`.
pub fn usage_totals<St: AggregateStore>(
    store: &St,
    width: BucketWidth,
    start_ms: i64,
    end_ms: i64,
) -> Result<Vec<UsageTotal>, St::Error> {
    let rows = store.query_buckets(width.floor(start_ms), end_ms)?;
    Ok(rebucket(&rows, width, start_ms, end_ms))
}

pub fn usage_totals_by_hour<St: AggregateStore>(
    store: &St,
    start_ms: i64,
    end_ms: i64,
) -> Result<Vec<UsageTotal>, St::Error> {
    usage_totals(store, BucketWidth::Hour, start_ms, end_ms)
}

pub fn usage_totals_by_day<St: AggregateStore>(
    store: &St,
    start_ms: i64,
    end_ms: i64,
) -> Result<Vec<UsageTotal>, St::Error> {
    usage_totals(store, BucketWidth::Day, start_ms, end_ms)
}

/// Usage totals per bucket for a single entity.
pub fn entity_usage_totals<St: AggregateStore>(
    store: &St,
    entity_id: &str,
    width: BucketWidth,
    start_ms: i64,
    end_ms: i64,
) -> Result<Vec<UsageTotal>, St::Error> {
    let rows = store.query_buckets_for_entity(entity_id, width.floor(start_ms), end_ms)?;
    Ok(rebucket(&rows, width, start_ms, end_ms))
}

/// Per-entity totals for hour buckets starting in `[start_ms, end_ms)`.
pub fn entity_usage_summary<St: AggregateStore>(
    store: &St,
    start_ms: i64,
    end_ms: i64,
) -> Result<Vec<EntityUsage>, St::Error> {
    let rows = store.query_buckets(start_ms, end_ms)?;
    let names = store.display_names()?;
    Ok(summarize_entities(&rows, &names))
}
