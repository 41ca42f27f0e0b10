//! Measurement values, wire records, and per-parameter history series.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::id::{DeviceId, ParamName};
use crate::time::{Clock, Timestamp};

/// A single typed measurement value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MeasurementValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Json(serde_json::Value),
}

/// One measurement as delivered by the host platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementRecord {
    pub device_id: DeviceId,
    pub name: String,
    /// Channel index appended to the name to disambiguate (`buttonStatus.1`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    pub value: MeasurementValue,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: Timestamp,
    /// `true` for a fresh reading, `false` for a metadata/sync record.
    #[serde(default)]
    pub updated: bool,
}

impl MeasurementRecord {
    /// The parameter this record feeds, index suffix applied.
    #[must_use]
    pub fn param(&self) -> ParamName {
        ParamName::indexed(&self.name, self.index)
    }
}

/// The eviction window applied to measurement histories.
#[must_use]
pub fn retention_window() -> Duration {
    Duration::days(7)
}

/// One retained sample of a parameter's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub value: MeasurementValue,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: Timestamp,
}

fn default_min_retained() -> usize {
    1
}

/// Newest-first history of one parameter.
///
/// Invariant: samples are strictly descending by timestamp with
/// pairwise-unique timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSeries {
    samples: Vec<Sample>,
    /// Lower bound on retained samples regardless of the eviction window.
    #[serde(default = "default_min_retained")]
    min_retained: usize,
}

impl Default for MeasurementSeries {
    fn default() -> Self {
        Self {
            samples: Vec::new(),
            min_retained: default_min_retained(),
        }
    }
}

impl MeasurementSeries {
    /// An empty series keeping at least `min_retained` samples.
    #[must_use]
    pub fn with_min_retained(min_retained: usize) -> Self {
        Self {
            samples: Vec::new(),
            min_retained: min_retained.max(1),
        }
    }

    /// Insert a sample, keeping the series strictly descending and unique.
    ///
    /// A sample at an already-present timestamp replaces the stored value.
    /// Returns `true` when the *latest observable value* changed: the first
    /// sample ever, a new head with a different value than the previous
    /// head, or an in-place replacement of the head with a different value.
    /// Backfills behind the head never count as a change.
    pub fn insert(&mut self, value: MeasurementValue, time: Timestamp) -> bool {
        match self.samples.binary_search_by(|s| time.cmp(&s.time)) {
            Ok(position) => {
                let changed = position == 0 && self.samples[position].value != value;
                self.samples[position].value = value;
                changed
            }
            Err(position) => {
                let changed = position == 0
                    && self
                        .samples
                        .first()
                        .is_none_or(|head| head.value != value);
                self.samples.insert(position, Sample { value, time });
                changed
            }
        }
    }

    /// Drop samples older than `window` before `clock`, but never below the
    /// minimum retained count.
    pub fn evict(&mut self, window: Duration, clock: Clock) {
        let cutoff = clock.earlier(window);
        let floor = self.min_retained.max(1);
        while self.samples.len() > floor
            && self.samples.last().is_some_and(|s| s.time < cutoff)
        {
            self.samples.pop();
        }
    }

    /// Re-establish the ordering invariant on deserialized data: sort
    /// newest-first and drop duplicate timestamps, keeping the first
    /// (newest-first) occurrence.
    pub fn normalize(&mut self) {
        self.samples.sort_by(|a, b| b.time.cmp(&a.time));
        self.samples.dedup_by(|next, kept| next.time == kept.time);
        if self.min_retained == 0 {
            self.min_retained = 1;
        }
    }

    /// The most recent sample.
    #[must_use]
    pub fn latest(&self) -> Option<&Sample> {
        self.samples.first()
    }

    /// All samples, newest first.
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn min_retained(&self) -> usize {
        self.min_retained
    }

    /// Raise (never lower) the minimum retained count.
    pub fn retain_at_least(&mut self, min_retained: usize) {
        self.min_retained = self.min_retained.max(min_retained.max(1));
    }
}
