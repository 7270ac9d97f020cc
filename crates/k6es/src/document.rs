//! 🔄 Document — the one and only transform in this crate 🎭
//!
//! 🎬 INT. CUSTOMS BOOTH — a `Sample` walks up. It has a name, a type, a number,
//! some tags, a timestamp. It leaves as a [`Document`]: same facts, flatter hat,
//! field names the index mapping recognises.
//!
//! 🧠 Knowledge graph:
//! - Input: `common::Sample` (owned by the flush cycle that drained it)
//! - Output: `Document` → JSON string → one line of a `_bulk` body
//! - Pure: no I/O, no state, no clock. Same sample in, same bytes out.
//! - Field names (`MetricName`, `MetricType`, `Value`, `Tags`, `Time`) match `mapping.json`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::common::Sample;

/// 📄 The flattened, index-ready form of one [`Sample`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    #[serde(rename = "MetricName")]
    pub metric_name: String,
    #[serde(rename = "MetricType")]
    pub metric_type: String,
    #[serde(rename = "Value")]
    pub value: f64,
    #[serde(rename = "Tags")]
    pub tags: BTreeMap<String, String>,
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,
}

impl From<&Sample> for Document {
    fn from(sample: &Sample) -> Self {
        Self {
            metric_name: sample.metric.clone(),
            metric_type: sample.metric_type.to_string(),
            value: sample.value,
            tags: sample.tags.clone(),
            time: sample.time,
        }
    }
}

impl From<Sample> for Document {
    fn from(sample: Sample) -> Self {
        Self {
            metric_name: sample.metric,
            metric_type: sample.metric_type.to_string(),
            value: sample.value,
            tags: sample.tags,
            time: sample.time,
        }
    }
}

impl Document {
    /// 📦 Serialize into the document line of a `_bulk` request.
    ///
    /// ⚠️ A failure here means the mapper contract broke. Callers treat it as a bug,
    /// not as weather.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).with_context(|| {
            format!(
                "💀 Cannot encode document for metric '{}' (value {}). Documents are supposed to be boring JSON; this one wasn't.",
                self.metric_name, self.value
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MetricType;
    use chrono::TimeZone;

    fn the_classic_sample() -> Sample {
        Sample::new(
            "http_req_duration",
            MetricType::Trend,
            123.4,
            Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap(),
        )
        .with_tag("method", "GET")
    }

    #[test]
    fn the_one_where_a_trend_sample_becomes_exactly_the_document_we_expect() -> Result<()> {
        let sample = the_classic_sample();
        let document = Document::from(&sample);

        let the_json: serde_json::Value = serde_json::from_str(&document.to_json()?)?;
        assert_eq!(
            the_json,
            serde_json::json!({
                "MetricName": "http_req_duration",
                "MetricType": "trend",
                "Value": 123.4,
                "Tags": {"method": "GET"},
                "Time": "2024-05-06T07:08:09Z",
            })
        );
        Ok(())
    }

    #[test]
    fn the_one_where_mapping_twice_is_byte_for_byte_boring() -> Result<()> {
        let sample = the_classic_sample()
            .with_tag("status", "200")
            .with_tag("name", "https://test.k6.io/")
            .with_tag("expected_response", "true");

        let first = Document::from(&sample).to_json()?;
        let second = Document::from(&sample).to_json()?;
        let owned = Document::from(sample).to_json()?;

        assert_eq!(first, second);
        assert_eq!(first, owned);
        Ok(())
    }

    #[test]
    fn the_one_where_nan_sneaks_through_as_null() {
        let sample = Sample::new(
            "checks",
            MetricType::Rate,
            f64::NAN,
            Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap(),
        );
        // serde_json writes NaN as null rather than failing; the document must still be
        // valid JSON so the store can reject it per-item instead of us crashing the run.
        let line = Document::from(&sample).to_json().expect("NaN serializes as null");
        assert!(line.contains(r#""Value":null"#));
    }
}
