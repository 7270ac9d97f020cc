//! 🧵 BulkWorker — drains the shared queue, batches locally, ships `_bulk` requests.
//!
//! Several of these share one receiver. Whoever is free takes the next document,
//! so a worker stuck waiting on a slow request doesn't stall the others.

use std::sync::Arc;

use anyhow::Result;
use async_channel::Receiver;
use reqwest::Method;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::outcome::{ItemFailure, ItemOutcome, OutcomeHandler};
use super::request::{self, BulkResponse};
use super::{BulkItem, BulkSettings, BulkStats};
use crate::client::ElasticsearchClient;
use crate::workers::Worker;

/// 🔄 Items that should be sent again, each with the failure it'd get if we gave up now.
type Retryable = Vec<(BulkItem, ItemFailure)>;

pub(super) struct BulkWorker {
    id: usize,
    rx: Receiver<BulkItem>,
    client: Arc<ElasticsearchClient>,
    settings: Arc<BulkSettings>,
    handler: Arc<dyn OutcomeHandler>,
    stats: Arc<BulkStats>,
    action_line: String,
    buffer: Vec<BulkItem>,
    buffer_bytes: usize,
}

impl BulkWorker {
    pub(super) fn new(
        id: usize,
        rx: Receiver<BulkItem>,
        client: Arc<ElasticsearchClient>,
        settings: Arc<BulkSettings>,
        handler: Arc<dyn OutcomeHandler>,
        stats: Arc<BulkStats>,
    ) -> Self {
        let action_line = request::action_line(settings.action, &settings.index_name);
        Self {
            id,
            rx,
            client,
            settings,
            handler,
            stats,
            action_line,
            buffer: Vec::new(),
            buffer_bytes: 0,
        }
    }

    async fn push(&mut self, item: BulkItem) {
        self.buffer_bytes += request::estimated_len(&item, self.action_line.len());
        self.buffer.push(item);
        if self.buffer_bytes >= self.settings.flush_bytes {
            self.flush().await;
        }
    }

    /// 🚽 Send everything buffered, retrying what's worth retrying, and report every outcome.
    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut pending = std::mem::take(&mut self.buffer);
        self.buffer_bytes = 0;
        self.stats.record_flushed(pending.len());
        debug!("🚽 BulkWorker {} flushing {} document(s)", self.id, pending.len());

        let mut attempt = 0;
        loop {
            let retryable = self.attempt(pending).await;
            if retryable.is_empty() {
                return;
            }
            if attempt >= self.settings.max_retries {
                warn!(
                    "💀 BulkWorker {} giving up on {} document(s) after {} retries",
                    self.id,
                    retryable.len(),
                    attempt
                );
                for (item, failure) in retryable {
                    self.report(&item, ItemOutcome::Failure(failure));
                }
                return;
            }

            attempt += 1;
            let delay = self.settings.backoff(attempt);
            warn!(
                "🔄 BulkWorker {} retrying {} document(s) in {:?} (attempt {}/{}): {}",
                self.id,
                retryable.len(),
                delay,
                attempt,
                self.settings.max_retries,
                retryable[0].1
            );
            self.stats.record_retry();
            tokio::time::sleep(delay).await;
            pending = retryable.into_iter().map(|(item, _)| item).collect();
        }
    }

    /// 📡 One `_bulk` round trip. Terminal outcomes are reported here; retryable ones come back.
    async fn attempt(&self, items: Vec<BulkItem>) -> Retryable {
        self.stats.record_request();
        let (status, text) = match self.send(&items).await {
            Ok(answer) => answer,
            Err(err) => {
                let failure = ItemFailure::Transport {
                    message: format!("{err:#}"),
                };
                return items.into_iter().map(|item| (item, failure.clone())).collect();
            }
        };

        if !(200..300).contains(&status) {
            let failure = request::request_failure(status, &text);
            if request::is_retryable_status(status) {
                return items.into_iter().map(|item| (item, failure.clone())).collect();
            }
            for item in &items {
                self.report(item, ItemOutcome::Failure(failure.clone()));
            }
            return Vec::new();
        }

        let response = match BulkResponse::parse(&text) {
            Ok(response) => response,
            Err(err) => {
                let failure = ItemFailure::Remote {
                    status,
                    kind: "invalid_response".to_string(),
                    reason: format!("{err:#}"),
                };
                for item in &items {
                    self.report(item, ItemOutcome::Failure(failure.clone()));
                }
                return Vec::new();
            }
        };

        let mut verdicts = response.into_items();
        let mut retryable = Vec::new();
        for item in items {
            let outcome = match verdicts.next().flatten() {
                Some(verdict) => verdict.outcome(),
                None => ItemOutcome::Failure(ItemFailure::Remote {
                    status,
                    kind: "missing_item".to_string(),
                    reason: "the _bulk response had no entry for this document".to_string(),
                }),
            };
            match outcome {
                ItemOutcome::Failure(failure @ ItemFailure::Remote { status: 429, .. }) => {
                    retryable.push((item, failure));
                }
                outcome => self.report(&item, outcome),
            }
        }
        retryable
    }

    async fn send(&self, items: &[BulkItem]) -> Result<(u16, String)> {
        let body = request::render_body(items, &self.action_line);
        let mut builder = self
            .client
            .request(Method::POST, "/_bulk")
            .header(CONTENT_TYPE, "application/x-ndjson");
        builder = if self.settings.compress {
            builder
                .header(CONTENT_ENCODING, "gzip")
                .body(request::gzip(body.as_bytes())?)
        } else {
            builder.body(body)
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        Ok((status, text))
    }

    fn report(&self, item: &BulkItem, outcome: ItemOutcome) {
        self.stats.record_outcome(outcome.is_success());
        self.handler.on_outcome(item, &outcome);
    }
}

impl Worker for BulkWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("📥 BulkWorker {} started draining the queue", self.id);
            let mut ticker = tokio::time::interval(self.settings.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // ⏱️ interval's first tick is immediate; burn it so we don't flush nothing at t=0
            ticker.tick().await;

            loop {
                tokio::select! {
                    received = self.rx.recv() => match received {
                        Ok(item) => self.push(item).await,
                        Err(_) => {
                            // Channel is empty and closed
                            self.flush().await;
                            debug!("🏁 BulkWorker {}: queue closed. Shutting down.", self.id);
                            return Ok(());
                        }
                    },
                    _ = ticker.tick() => self.flush().await,
                }
            }
        })
    }
}
