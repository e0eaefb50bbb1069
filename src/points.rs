//! Step-bucketed series built from a raw daemon reply.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::protocol::Reply;

/// Cached datapoints for one metric, aligned to `step`-second buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Points {
    /// Bucket timestamp to value.
    pub datapoints: BTreeMap<i64, f64>,
    /// Smallest bucket present.
    pub from: i64,
    /// Largest bucket present.
    pub until: i64,
    /// Bucket width in seconds. Zero marks the "unavailable" sentinel.
    pub step: i64,
}

impl Points {
    /// An empty series for `step`.
    pub fn new(step: i64) -> Self {
        Self {
            step,
            ..Default::default()
        }
    }

    /// The sentinel handed out when no connection could serve a query.
    pub fn unavailable() -> Self {
        Self::new(0)
    }

    /// True for the degraded-pool sentinel.
    ///
    /// A daemon reply with no samples still carries the caller's step, so
    /// `step == 0` is what separates "nothing cached" from "nobody asked".
    pub fn is_unavailable(&self) -> bool {
        self.step == 0
    }

    pub fn is_empty(&self) -> bool {
        self.datapoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.datapoints.len()
    }

    /// Bucket `reply` by `step`.
    ///
    /// Later samples overwrite earlier ones in the same bucket. A
    /// non-positive step yields an empty series. Samples whose bucket does
    /// not fit in an `i64` are dropped.
    pub fn convert_from(reply: &Reply, step: i64) -> Self {
        let mut points = Self::new(step);
        if step <= 0 {
            return points;
        }

        for &(timestamp, value) in &reply.datapoints {
            let Some(bucket) = bucket_of(timestamp, step) else {
                debug!(timestamp, step, "Dropping sample outside bucketable range");
                continue;
            };

            if points.datapoints.is_empty() {
                points.from = bucket;
                points.until = bucket;
            } else {
                points.from = points.from.min(bucket);
                points.until = points.until.max(bucket);
            }
            points.datapoints.insert(bucket, value);
        }

        points
    }
}

/// `floor(timestamp / step) * step`, or `None` for a non-positive step or
/// when the floored bucket falls below `i64::MIN`.
#[inline]
pub fn bucket_of(timestamp: i64, step: i64) -> Option<i64> {
    if step <= 0 {
        return None;
    }
    timestamp.div_euclid(step).checked_mul(step)
}
