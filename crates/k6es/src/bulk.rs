//! 📦 Bulk Delivery Pipeline — documents in, `_bulk` requests out, outcomes back.
//!
//! ```text
//!   submit() ──▶ [bounded async_channel] ──▶ BulkWorker × N ──▶ POST /_bulk
//!                                                    │
//!                                                    └──▶ OutcomeHandler (once per document)
//! ```
//!
//! 🔒 The channel is bounded, so `submit` waits when the workers fall behind.
//! That wait is the backpressure; the flush cycle that called `submit` slows down
//! with it and the next tick gets skipped instead of piling up.
//!
//! 🧵 Workers buffer locally and flush when the buffer crosses `flush_bytes`,
//! when their `flush_interval` ticks, or when the channel closes.
//! `close` closes the channel and joins every worker, so by the time it returns
//! every submitted document has had its outcome delivered.

pub mod outcome;
pub(crate) mod request;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_channel::{Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::app_config::Config;
use crate::client::ElasticsearchClient;
use crate::workers::Worker;
use outcome::OutcomeHandler;
use worker::BulkWorker;

/// 🏷️ The `_bulk` action verb for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAction {
    /// Append-only. Pairs well with data streams and with `auto_id`.
    Create,
    /// Create-or-overwrite.
    Index,
}

impl BulkAction {
    pub fn as_str(self) -> &'static str {
        match self {
            BulkAction::Create => "create",
            BulkAction::Index => "index",
        }
    }
}

/// 🏷️ Every metric document is written with this verb.
pub const DEFAULT_ACTION: BulkAction = BulkAction::Create;

/// 📄 One serialized document waiting for its `_bulk` ride.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItem {
    pub document: String,
}

impl BulkItem {
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
        }
    }
}

/// 🔧 Knobs for the pipeline. Usually built from [`Config`].
#[derive(Debug, Clone)]
pub struct BulkSettings {
    pub index_name: String,
    pub action: BulkAction,
    pub workers: usize,
    pub flush_bytes: usize,
    pub flush_interval: Duration,
    pub queue_capacity: usize,
    pub max_retries: u32,
    /// ⏳ First retry delay; doubles per attempt up to [`MAX_RETRY_BACKOFF`].
    pub retry_backoff: Duration,
    pub compress: bool,
}

pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

impl From<&Config> for BulkSettings {
    fn from(config: &Config) -> Self {
        Self {
            index_name: config.index_name.clone(),
            action: DEFAULT_ACTION,
            workers: config.bulk_workers,
            flush_bytes: config.bulk_flush_bytes,
            flush_interval: config.bulk_flush_interval,
            queue_capacity: config.bulk_queue_capacity,
            max_retries: config.bulk_max_retries,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            compress: config.compress_request_body,
        }
    }
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl BulkSettings {
    /// ⏳ Delay before retry number `attempt` (1-based).
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff.saturating_mul(factor).min(MAX_RETRY_BACKOFF)
    }
}

/// 📊 Running counters shared by the handle and every worker.
#[derive(Debug, Default)]
pub(crate) struct BulkStats {
    added: AtomicU64,
    flushed: AtomicU64,
    indexed: AtomicU64,
    failed: AtomicU64,
    requests: AtomicU64,
    retries: AtomicU64,
}

impl BulkStats {
    pub(crate) fn record_added(&self) {
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flushed(&self, count: usize) {
        self.flushed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, success: bool) {
        let counter = if success { &self.indexed } else { &self.failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> BulkStatsSnapshot {
        BulkStatsSnapshot {
            added: self.added.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// 📊 A point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkStatsSnapshot {
    /// Documents accepted by `submit`.
    pub added: u64,
    /// Documents taken out of a worker buffer for a first send.
    pub flushed: u64,
    /// Documents with a success outcome.
    pub indexed: u64,
    /// Documents with a failure outcome.
    pub failed: u64,
    /// `_bulk` HTTP attempts, retries included.
    pub requests: u64,
    /// Retry rounds.
    pub retries: u64,
}

/// 📬 A cheap, cloneable way to push documents into a running [`BulkIndexer`].
#[derive(Debug, Clone)]
pub struct BulkSubmitter {
    tx: Sender<BulkItem>,
    stats: Arc<BulkStats>,
}

impl BulkSubmitter {
    /// 📥 Enqueue one document. Waits while the queue is full.
    ///
    /// 💀 Errors only once the indexer has been closed.
    pub async fn submit(&self, item: BulkItem) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| anyhow!("💀 The bulk indexer is closed; document dropped at the door"))?;
        self.stats.record_added();
        Ok(())
    }
}

/// 🚀 The running pipeline: a queue, N workers, and the counters they share.
pub struct BulkIndexer {
    submitter: BulkSubmitter,
    workers: Vec<JoinHandle<Result<()>>>,
    stats: Arc<BulkStats>,
}

impl BulkIndexer {
    /// 🧵 Spin up the queue and `settings.workers` workers (at least one).
    pub fn start(
        client: Arc<ElasticsearchClient>,
        settings: BulkSettings,
        handler: Arc<dyn OutcomeHandler>,
    ) -> Self {
        let (tx, rx): (Sender<BulkItem>, Receiver<BulkItem>) =
            async_channel::bounded(settings.queue_capacity.max(1));
        let stats = Arc::new(BulkStats::default());
        let settings = Arc::new(settings);
        let worker_count = settings.workers.max(1);

        let workers = (0..worker_count)
            .map(|id| {
                BulkWorker::new(
                    id,
                    rx.clone(),
                    Arc::clone(&client),
                    Arc::clone(&settings),
                    Arc::clone(&handler),
                    Arc::clone(&stats),
                )
                .start()
            })
            .collect();

        info!(
            "🚀 Bulk indexer started: {} worker(s) writing to '{}' ({} action)",
            worker_count,
            settings.index_name,
            settings.action.as_str()
        );

        Self {
            submitter: BulkSubmitter {
                tx,
                stats: Arc::clone(&stats),
            },
            workers,
            stats,
        }
    }

    pub fn submitter(&self) -> BulkSubmitter {
        self.submitter.clone()
    }

    pub async fn submit(&self, item: BulkItem) -> Result<()> {
        self.submitter.submit(item).await
    }

    pub fn stats(&self) -> BulkStatsSnapshot {
        self.stats.snapshot()
    }

    /// 🏁 Stop accepting documents, flush what's buffered, wait for every outcome.
    ///
    /// 💀 Per-document failures don't fail this; they already went to the handler.
    /// Only a worker that crashed does.
    pub async fn close(self) -> Result<BulkStatsSnapshot> {
        self.submitter.tx.close();
        debug!("🚪 Bulk queue closed; waiting for {} worker(s) to drain", self.workers.len());

        let mut first_error = None;
        for handle in self.workers {
            let joined = handle
                .await
                .context("💀 A bulk worker panicked or was cancelled")
                .and_then(|result| result);
            if let Err(err) = joined {
                first_error.get_or_insert(err);
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let stats = self.stats.snapshot();
        info!(
            "🏁 Bulk indexer closed: {} added, {} indexed, {} failed, {} request(s)",
            stats.added, stats.indexed, stats.failed, stats.requests
        );
        Ok(stats)
    }
}
