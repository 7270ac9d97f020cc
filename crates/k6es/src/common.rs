//! 📦 Common data structures — the building blocks of k6es
//!
//! 🎬 COLD OPEN — INT. LOAD GENERATOR — T-MINUS 0
//!
//! Fifty virtual users hammer an API that was "definitely ready for prod".
//! Every request leaves behind a little number: how long it took, whether it
//! failed, which method it used. Those numbers are [`Sample`]s. They arrive in
//! [`SampleBatch`]es, because the engine, like a responsible adult, carries all
//! the groceries in one trip.
//!
//! These structs are the postal workers of this codebase. They carry the data.
//! They don't ask questions. Please tip your postal workers. 🦆

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 📊 What kind of metric a sample belongs to.
///
/// Four flavours, like a very boring ice cream shop:
/// counters go up, gauges go wherever, rates are ratios, trends are histograms
/// in a trench coat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Rate,
    Trend,
}

impl MetricType {
    /// 🏷️ The lowercase name the store indexes as a keyword.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Rate => "rate",
            MetricType::Trend => "trend",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 🎯 A single observation — one number, one moment, one set of tags.
///
/// Tags live in a `BTreeMap` so iteration order is stable. Stable order means the
/// serialized document is byte-identical every time, which means nobody has to
/// debug a "flaky" snapshot at 3am.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// 📛 Metric name, e.g. `http_req_duration`.
    pub metric: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub value: f64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// ⏱️ When the engine observed it. UTC, because timezones are a social construct.
    pub time: DateTime<Utc>,
}

impl Sample {
    /// 🏗️ Build a sample with no tags. Add them with [`Sample::with_tag`].
    pub fn new(
        metric: impl Into<String>,
        metric_type: MetricType,
        value: f64,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            metric: metric.into(),
            metric_type,
            value,
            tags: BTreeMap::new(),
            time,
        }
    }

    /// 🏷️ Builder-style tag setter. Later writes to the same key win.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// 📦 A `SampleBatch` — because one sample is never enough.
///
/// An ordered sequence handed over by the engine in a single call. Order inside
/// the batch is preserved through one drain; after that, the bulk workers do what
/// bulk workers do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    pub samples: Vec<Sample>,
}

impl SampleBatch {
    /// 🏗️ Wrap a vec of samples. No validation. Samples are immutable facts.
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl From<Vec<Sample>> for SampleBatch {
    fn from(samples: Vec<Sample>) -> Self {
        Self::new(samples)
    }
}

impl IntoIterator for SampleBatch {
    type Item = Sample;
    type IntoIter = std::vec::IntoIter<Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.into_iter()
    }
}
