//! 🏗️ Index Initializer — make sure the house exists before the furniture arrives.
//!
//! One `PUT /{index}` with the mapping baked into the binary at build time.
//! If the index is already there, great, we move in. If the cluster says anything
//! else, startup stops here with the response body in hand.

use anyhow::{Context, Result, bail};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use crate::client::ElasticsearchClient;

/// 🗺️ The field mapping every k6 metrics index gets. Keyword names, double values,
/// flattened tags, date timestamps.
pub const INDEX_MAPPING: &str = include_str!("../mapping.json");

const ALREADY_EXISTS: &str = "resource_already_exists_exception";

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: String,
}

/// 🎯 What happened when we asked for the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Created,
    AlreadyExists,
}

/// 🚀 Create `index_name` with [`INDEX_MAPPING`], treating "already exists" as success.
///
/// 💀 Any other non-2xx answer is fatal, and the error carries the index name and body.
pub async fn ensure_index(client: &ElasticsearchClient, index_name: &str) -> Result<IndexStatus> {
    let response = client
        .request(Method::PUT, &format!("/{index_name}"))
        .header(CONTENT_TYPE, "application/json")
        .body(INDEX_MAPPING)
        .send()
        .await
        .with_context(|| format!("💀 The create-index request for '{index_name}' never got an answer."))?;

    let status = response.status();
    if status.is_success() {
        info!("✅ Created index '{index_name}' with the k6 metrics mapping");
        return Ok(IndexStatus::Created);
    }

    let body = response
        .text()
        .await
        .with_context(|| format!("💀 could not read response after failure to create index {index_name}"))?;

    if status == StatusCode::BAD_REQUEST && is_already_exists(&body) {
        debug!("📦 Index '{index_name}' already exists; moving right in");
        return Ok(IndexStatus::AlreadyExists);
    }

    bail!(
        "💀 could not create index {} (status code {}): {}",
        index_name,
        status.as_u16(),
        body
    )
}

fn is_already_exists(body: &str) -> bool {
    serde_json::from_str::<ErrorEnvelope>(body)
        .map(|envelope| envelope.error.kind == ALREADY_EXISTS)
        .unwrap_or(false)
}
