//! Bucketed aggregation of foreground intervals.
//!
//! Each interval is cut at bucket boundaries; every piece adds its duration
//! and one occurrence to the `(entity, bucket_start)` accumulator. An interval
//! therefore counts once per bucket it touches, not once overall.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::reconstruct::ForegroundInterval;

/// One hour in milliseconds.
pub const HOUR_MS: i64 = 3_600_000;

/// One day in milliseconds.
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Granularity of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketWidth {
    #[default]
    Hour,
    Day,
}

impl BucketWidth {
    #[must_use]
    pub const fn as_millis(&self) -> i64 {
        match self {
            Self::Hour => HOUR_MS,
            Self::Day => DAY_MS,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Start of the bucket containing `timestamp_ms`.
    #[must_use]
    pub const fn floor(&self, timestamp_ms: i64) -> i64 {
        floor_to(timestamp_ms, self.as_millis())
    }
}

impl fmt::Display for BucketWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BucketWidth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" | "hourly" => Ok(Self::Hour),
            "day" | "daily" => Ok(Self::Day),
            _ => Err(format!("invalid bucket width: {s}")),
        }
    }
}

/// Align `timestamp_ms` down to a multiple of `width_ms`.
///
/// Uses Euclidean division so pre-epoch timestamps floor toward negative
/// infinity. `width_ms` must be positive.
#[must_use]
pub const fn floor_to(timestamp_ms: i64, width_ms: i64) -> i64 {
    timestamp_ms.div_euclid(width_ms) * width_ms
}

/// Unique key of a bucket row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub entity_id: String,
    pub bucket_start_ms: i64,
}

/// Accumulated usage for one entity in one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketAggregate {
    pub entity_id: String,
    pub bucket_start_ms: i64,
    pub duration_ms: i64,
    pub occurrence_count: i64,
}

pub type BucketMap = HashMap<BucketKey, BucketAggregate>;

/// Split intervals into buckets of `bucket_width_ms` and sum per bucket.
///
/// The fold is order-independent: any permutation of `intervals` produces
/// the same map. Zero-length and inverted intervals are skipped; a
/// non-positive width yields an empty map.
pub fn aggregate(intervals: &[ForegroundInterval], bucket_width_ms: i64) -> BucketMap {
    if bucket_width_ms <= 0 {
        tracing::warn!(bucket_width_ms, "refusing to aggregate with non-positive width");
        return BucketMap::new();
    }

    intervals
        .par_iter()
        .fold(BucketMap::new, |mut acc, interval| {
            split_interval(&mut acc, interval, bucket_width_ms);
            acc
        })
        .reduce(BucketMap::new, merge)
}

/// Flatten a bucket map into rows ordered by entity then bucket start.
pub fn into_sorted_rows(buckets: BucketMap) -> Vec<BucketAggregate> {
    let mut rows: Vec<BucketAggregate> = buckets.into_values().collect();
    rows.sort_by(|a, b| {
        a.entity_id
            .cmp(&b.entity_id)
            .then(a.bucket_start_ms.cmp(&b.bucket_start_ms))
    });
    rows
}

fn split_interval(acc: &mut BucketMap, interval: &ForegroundInterval, width: i64) {
    if interval.end_ms <= interval.start_ms {
        return;
    }

    let mut cursor = interval.start_ms;
    while cursor < interval.end_ms {
        let bucket_start = floor_to(cursor, width);
        let segment_end = interval.end_ms.min(bucket_start + width);
        add(acc, &interval.entity_id, bucket_start, segment_end - cursor, 1);
        cursor = segment_end;
    }
}

fn add(acc: &mut BucketMap, entity_id: &str, bucket_start_ms: i64, duration_ms: i64, count: i64) {
    let key = BucketKey {
        entity_id: entity_id.to_string(),
        bucket_start_ms,
    };
    let row = acc.entry(key).or_insert_with(|| BucketAggregate {
        entity_id: entity_id.to_string(),
        bucket_start_ms,
        duration_ms: 0,
        occurrence_count: 0,
    });
    row.duration_ms += duration_ms;
    row.occurrence_count += count;
}

fn merge(mut left: BucketMap, right: BucketMap) -> BucketMap {
    if left.len() < right.len() {
        return merge(right, left);
    }
    for (key, row) in right {
        add(
            &mut left,
            &key.entity_id,
            key.bucket_start_ms,
            row.duration_ms,
            row.occurrence_count,
        );
    }
    left
}
