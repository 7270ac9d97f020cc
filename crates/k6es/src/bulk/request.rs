//! 📦 `_bulk` wire format — NDJSON out, per-item verdicts back in.
//!
//! Each document becomes two lines:
//! 1. an action line, `{"create":{"_index":"k6-metrics"}}`
//! 2. the document itself, verbatim
//!
//! Trailing `\n` included. ES bulk requires it, and nobody complains.

use std::collections::HashMap;
use std::io::Write;

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Deserialize;

use crate::bulk::outcome::{ItemFailure, ItemOutcome};
use crate::bulk::{BulkAction, BulkItem};

/// 📡 HTTP statuses worth another try: throttling and flaky proxies.
pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

/// 📏 Bytes an item adds to the NDJSON body (action line estimated).
pub(crate) fn estimated_len(item: &BulkItem, action_line_len: usize) -> usize {
    item.document.len() + action_line_len + 2
}

/// 🏷️ The action line every document in this pipeline shares.
pub(crate) fn action_line(action: BulkAction, index_name: &str) -> String {
    serde_json::json!({ action.as_str(): { "_index": index_name } }).to_string()
}

/// 📦 Render items into one NDJSON `_bulk` body.
pub(crate) fn render_body(items: &[BulkItem], action_line: &str) -> String {
    let estimated_size: usize = items.iter().map(|item| estimated_len(item, action_line.len())).sum();
    let mut body = String::with_capacity(estimated_size);
    for item in items {
        body.push_str(action_line);
        body.push('\n');
        body.push_str(&item.document);
        body.push('\n');
    }
    body
}

/// 🫁 gzip a body. Bytes are squishy.
pub(crate) fn gzip(body: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 4), Compression::default());
    encoder
        .write_all(body)
        .context("💀 gzip refused to squish the bulk body")?;
    encoder.finish().context("💀 gzip could not finish squishing the bulk body")
}

#[derive(Debug, Deserialize)]
pub(crate) struct BulkResponse {
    #[serde(default)]
    pub(crate) errors: bool,
    #[serde(default)]
    pub(crate) items: Vec<HashMap<String, BulkResponseItem>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BulkResponseItem {
    pub(crate) status: u16,
    #[serde(default)]
    pub(crate) error: Option<RemoteError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RemoteError {
    #[serde(rename = "type")]
    pub(crate) kind: String,
    #[serde(default)]
    pub(crate) reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: RemoteError,
}

impl BulkResponseItem {
    pub(crate) fn outcome(&self) -> ItemOutcome {
        match &self.error {
            None if self.status < 300 => ItemOutcome::Success { status: self.status },
            None => ItemOutcome::Failure(ItemFailure::Remote {
                status: self.status,
                kind: "unknown".to_string(),
                reason: format!("item rejected with status {}", self.status),
            }),
            Some(error) => ItemOutcome::Failure(ItemFailure::Remote {
                status: self.status,
                kind: error.kind.clone(),
                reason: error.reason.clone().unwrap_or_default(),
            }),
        }
    }
}

impl BulkResponse {
    pub(crate) fn parse(body: &str) -> Result<Self> {
        serde_json::from_str(body).context("💀 The _bulk response wasn't the JSON we were promised")
    }

    /// 🎯 Each response item is a one-key map (`create`/`index`/...); we only want the value.
    pub(crate) fn into_items(self) -> impl Iterator<Item = Option<BulkResponseItem>> {
        self.items.into_iter().map(|entry| entry.into_values().next())
    }
}

/// 💀 A whole-request failure, with the error type pulled from the body when there is one.
pub(crate) fn request_failure(status: u16, body: &str) -> ItemFailure {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope { error }) => ItemFailure::Remote {
            status,
            kind: error.kind,
            reason: error.reason.unwrap_or_default(),
        },
        Err(_) => ItemFailure::Remote {
            status,
            kind: "http_error".to_string(),
            reason: if body.is_empty() {
                format!("bulk request failed with status {status}")
            } else {
                body.to_string()
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn the_one_where_two_documents_become_four_sacred_lines() {
        let line = action_line(BulkAction::Create, "k6-metrics");
        let body = render_body(
            &[BulkItem::new(r#"{"a":1}"#), BulkItem::new(r#"{"b":2}"#)],
            &line,
        );
        assert_eq!(
            body,
            "{\"create\":{\"_index\":\"k6-metrics\"}}\n{\"a\":1}\n{\"create\":{\"_index\":\"k6-metrics\"}}\n{\"b\":2}\n"
        );
    }

    #[test]
    fn the_one_where_the_index_verb_is_respected_too() {
        assert_eq!(action_line(BulkAction::Index, "x"), r#"{"index":{"_index":"x"}}"#);
    }

    #[test]
    fn the_one_where_per_item_verdicts_are_read_in_order() -> Result<()> {
        let response = BulkResponse::parse(
            r#"{"took":3,"errors":true,"items":[
                {"create":{"_index":"k6-metrics","status":201,"result":"created"}},
                {"create":{"_index":"k6-metrics","status":400,"error":{"type":"mapper_parsing_exception","reason":"failed to parse"}}},
                {"create":{"status":429,"error":{"type":"es_rejected_execution_exception"}}}
            ]}"#,
        )?;
        assert!(response.errors);
        let outcomes: Vec<ItemOutcome> = response
            .into_items()
            .map(|item| item.expect("item present").outcome())
            .collect();

        assert_eq!(outcomes[0], ItemOutcome::Success { status: 201 });
        assert_eq!(
            outcomes[1],
            ItemOutcome::Failure(ItemFailure::Remote {
                status: 400,
                kind: "mapper_parsing_exception".into(),
                reason: "failed to parse".into(),
            })
        );
        assert!(matches!(
            &outcomes[2],
            ItemOutcome::Failure(ItemFailure::Remote { status: 429, reason, .. }) if reason.is_empty()
        ));
        Ok(())
    }

    #[test]
    fn the_one_where_a_whole_request_failure_keeps_the_store_vocabulary() {
        let failure = request_failure(
            401,
            r#"{"error":{"type":"security_exception","reason":"missing authentication credentials"},"status":401}"#,
        );
        assert_eq!(failure.to_string(), "security_exception: missing authentication credentials");

        let plain = request_failure(502, "Bad Gateway");
        assert_eq!(plain.to_string(), "http_error: Bad Gateway");
    }

    #[test]
    fn the_one_where_gzip_round_trips_a_bulk_body() -> Result<()> {
        let body = "{\"create\":{}}\n{\"a\":1}\n".repeat(100);
        let squished = gzip(body.as_bytes())?;
        assert!(squished.len() < body.len());

        let mut unsquished = String::new();
        GzDecoder::new(squished.as_slice()).read_to_string(&mut unsquished)?;
        assert_eq!(unsquished, body);
        Ok(())
    }

    #[test]
    fn the_one_where_retryable_statuses_are_the_usual_suspects() {
        for status in [429, 502, 503, 504] {
            assert!(is_retryable_status(status));
        }
        for status in [200, 400, 401, 403, 404, 500] {
            assert!(!is_retryable_status(status));
        }
    }
}
