//! 🧪 Shared test doubles: a fake `_bulk` endpoint and a handler that remembers everything.

use std::collections::HashSet;
use std::io::Read;
use std::sync::{Arc, Mutex};

use flate2::read::GzDecoder;
use serde_json::{Value, json};
use wiremock::{Request, Respond, ResponseTemplate};

use crate::bulk::BulkItem;
use crate::bulk::outcome::{ItemOutcome, OutcomeHandler};

/// 🎭 Answers `_bulk` like a tiny Elasticsearch would.
///
/// - documents containing `poison` are rejected with a `mapper_parsing_exception`
/// - with `throttle_first`, every document gets one 429 before it's accepted
/// - everything else is created, and remembered in `accepted()`
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeBulk {
    throttle_first: bool,
    seen: Arc<Mutex<HashSet<String>>>,
    accepted: Arc<Mutex<Vec<Value>>>,
}

impl FakeBulk {
    pub(crate) fn throttling_first_attempts() -> Self {
        Self {
            throttle_first: true,
            ..Self::default()
        }
    }

    pub(crate) fn accepted(&self) -> Vec<Value> {
        self.accepted.lock().expect("accepted lock").clone()
    }

    fn body_of(request: &Request) -> String {
        let gzipped = request
            .headers
            .get("content-encoding")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == "gzip");
        if gzipped {
            let mut body = String::new();
            GzDecoder::new(request.body.as_slice())
                .read_to_string(&mut body)
                .expect("gzip body");
            body
        } else {
            String::from_utf8_lossy(&request.body).to_string()
        }
    }
}

impl Respond for FakeBulk {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body = Self::body_of(request);
        let lines: Vec<&str> = body.lines().filter(|line| !line.is_empty()).collect();
        let mut errors = false;
        let items: Vec<Value> = lines
            .chunks(2)
            .map(|pair| {
                let document = pair.get(1).copied().unwrap_or_default();
                if document.contains("poison") {
                    errors = true;
                    return json!({"create": {"status": 400, "error": {
                        "type": "mapper_parsing_exception",
                        "reason": "failed to parse field [n]"
                    }}});
                }
                if self.throttle_first && self.seen.lock().expect("seen lock").insert(document.to_string()) {
                    errors = true;
                    return json!({"create": {"status": 429, "error": {
                        "type": "es_rejected_execution_exception",
                        "reason": "rejected execution of coordinating operation"
                    }}});
                }
                let parsed: Value = serde_json::from_str(document).expect("documents are JSON");
                self.accepted.lock().expect("accepted lock").push(parsed);
                json!({"create": {"_index": "k6-metrics", "status": 201, "result": "created"}})
            })
            .collect();

        ResponseTemplate::new(200).set_body_json(json!({"took": 1, "errors": errors, "items": items}))
    }
}

/// 📒 Remembers every (document, outcome) pair in arrival order.
#[derive(Debug, Default)]
pub(crate) struct RecordingOutcomeHandler {
    outcomes: Mutex<Vec<(String, ItemOutcome)>>,
}

impl RecordingOutcomeHandler {
    pub(crate) fn outcomes(&self) -> Vec<(String, ItemOutcome)> {
        self.outcomes.lock().expect("outcomes lock").clone()
    }
}

impl OutcomeHandler for RecordingOutcomeHandler {
    fn on_outcome(&self, item: &BulkItem, outcome: &ItemOutcome) {
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .push((item.document.clone(), outcome.clone()));
    }
}
