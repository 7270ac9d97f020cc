//! 🎬 Lifecycle Controller — the part the metrics engine actually talks to.
//!
//! ```text
//!   new(params)  → config consolidated, client built, cluster probed
//!   start()      → index ensured, bulk indexer up, flusher ticking
//!   add_metric_samples(batch)  → into the buffer, any time after new()
//!   stop()       → flusher stopped (final flush), bulk indexer drained and closed
//! ```
//!
//! Startup problems are errors and the output never starts. Once running,
//! per-document failures only ever reach the log.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::app_config::{Config, load_config};
use crate::buffer::SampleBuffer;
use crate::bulk::outcome::{LoggingOutcomeHandler, OutcomeHandler};
use crate::bulk::{BulkIndexer, BulkItem, BulkSettings, BulkSubmitter};
use crate::client::ElasticsearchClient;
use crate::common::SampleBatch;
use crate::document::Document;
use crate::flusher::{FlushTarget, PeriodicFlusher};
use crate::index::ensure_index;

pub const DESCRIPTION: &str = "Output k6 metrics to Elasticsearch";

/// 📦 Everything the host hands an output at construction time.
#[derive(Debug, Clone, Default)]
pub struct OutputParams {
    /// Raw JSON from the persisted config, if any.
    pub json_config: Option<String>,
    /// The environment the output should read `K6_ELASTICSEARCH_*` from.
    pub environment: HashMap<String, String>,
    /// The `key=value,...` string from `--out name=...`.
    pub config_argument: Option<String>,
}

/// 🔌 The host-facing surface of a metrics output.
#[async_trait]
pub trait Output: Send + Sync {
    fn description(&self) -> String;

    async fn start(&mut self) -> Result<()>;

    /// 📥 Hand over one batch. Never blocks on the network.
    fn add_metric_samples(&self, batch: SampleBatch);

    async fn stop(&mut self) -> Result<()>;
}

enum State {
    Configured,
    Running {
        flusher: PeriodicFlusher,
        indexer: BulkIndexer,
    },
    Stopped,
}

/// 🚀 k6 metrics → Elasticsearch.
pub struct ElasticsearchOutput {
    config: Config,
    client: Arc<ElasticsearchClient>,
    buffer: Arc<SampleBuffer>,
    handler: Arc<dyn OutcomeHandler>,
    state: State,
    /// 🛑 Set by `stop`; later batches have no flush cycle left to drain them.
    stopped: AtomicBool,
}

impl ElasticsearchOutput {
    /// 🔧 Consolidate config, build the client, probe the cluster. Fails fast.
    pub async fn new(params: OutputParams) -> Result<Self> {
        let config = load_config(
            params.json_config.as_deref(),
            &params.environment,
            params.config_argument.as_deref(),
        )
        .context("💀 The Elasticsearch output configuration is not usable")?;
        Self::with_config(config).await
    }

    /// 🔧 Same as [`ElasticsearchOutput::new`], for a [`Config`] that's already consolidated.
    pub async fn with_config(config: Config) -> Result<Self> {
        config.validate()?;
        let client = ElasticsearchClient::connect(&config).await?;
        info!(
            "📡 Elasticsearch output configured for {:?}, index '{}', flushing every {:?}",
            client.addresses(),
            config.index_name,
            config.flush_period
        );
        Ok(Self {
            config,
            client: Arc::new(client),
            buffer: Arc::new(SampleBuffer::new()),
            handler: Arc::new(LoggingOutcomeHandler),
            state: State::Configured,
            stopped: AtomicBool::new(false),
        })
    }

    /// 📬 Swap who hears about per-document outcomes. Takes effect on `start`.
    pub fn with_outcome_handler(mut self, handler: Arc<dyn OutcomeHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[async_trait]
impl Output for ElasticsearchOutput {
    fn description(&self) -> String {
        DESCRIPTION.to_string()
    }

    async fn start(&mut self) -> Result<()> {
        if !matches!(self.state, State::Configured) {
            bail!("💀 The Elasticsearch output can only be started once");
        }
        debug!("🚀 Starting Elasticsearch output");

        ensure_index(&self.client, &self.config.index_name).await?;

        let indexer = BulkIndexer::start(
            Arc::clone(&self.client),
            BulkSettings::from(&self.config),
            Arc::clone(&self.handler),
        );
        let cycle = FlushCycle {
            buffer: Arc::clone(&self.buffer),
            submitter: indexer.submitter(),
        };
        let flusher = match PeriodicFlusher::start(self.config.flush_period, Arc::new(cycle)) {
            Ok(flusher) => flusher,
            Err(err) => {
                let _ = indexer.close().await;
                return Err(err);
            }
        };

        self.state = State::Running { flusher, indexer };
        info!("✅ Elasticsearch output started");
        Ok(())
    }

    fn add_metric_samples(&self, batch: SampleBatch) {
        if self.stopped.load(Ordering::Acquire) {
            debug!("🗑️ Dropping {} sample(s) that arrived after stop", batch.len());
            return;
        }
        self.buffer.add(batch);
    }

    async fn stop(&mut self) -> Result<()> {
        self.stopped.store(true, Ordering::Release);
        match std::mem::replace(&mut self.state, State::Stopped) {
            State::Running { flusher, indexer } => {
                debug!("🛑 Stopping Elasticsearch output");
                flusher.stop().await;
                match indexer.close().await {
                    Ok(stats) => {
                        info!(
                            "🏁 Elasticsearch output stopped: {} document(s) indexed, {} failed",
                            stats.indexed, stats.failed
                        );
                        Ok(())
                    }
                    Err(err) => {
                        error!("💀 Could not close the bulk indexer: {err:#}");
                        Err(err.context("💀 Could not close the bulk indexer"))
                    }
                }
            }
            State::Configured => {
                debug!("🛑 Elasticsearch output stopped before it ever started");
                Ok(())
            }
            State::Stopped => Ok(()),
        }
    }
}

/// 🚽 One flush cycle: drain the buffer, map every sample, submit every document.
struct FlushCycle {
    buffer: Arc<SampleBuffer>,
    submitter: BulkSubmitter,
}

#[async_trait]
impl FlushTarget for FlushCycle {
    async fn flush(&self) {
        let batches = self.buffer.drain_all();
        if batches.is_empty() {
            return;
        }
        let started = Instant::now();
        let mut count = 0usize;

        for sample in batches.iter().flat_map(|batch| batch.samples.iter()) {
            let document = match Document::from(sample).to_json() {
                Ok(document) => document,
                Err(err) => {
                    error!("💀 Could not serialize metric sample '{}': {err:#}", sample.metric);
                    panic!("could not serialize metric sample '{}': {err:#}", sample.metric);
                }
            };
            if let Err(err) = self.submitter.submit(BulkItem::new(document)).await {
                warn!("⚠️ Flush cycle cut short after {count} document(s): {err:#}");
                return;
            }
            count += 1;
        }

        debug!("🚽 Flushed {count} sample(s) in {:?}", started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{MetricType, Sample};
    use crate::test_support::{FakeBulk, RecordingOutcomeHandler};
    use chrono::{TimeZone, Utc};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_healthy_cluster(server: &MockServer, fake: &FakeBulk) {
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"version": {"number": "8.13.0"}})))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/k6-metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"acknowledged": true})))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(fake.clone())
            .mount(server)
            .await;
    }

    fn params_for(server: &MockServer) -> OutputParams {
        OutputParams {
            json_config: Some(format!(r#"{{"url":"{}","flushPeriod":"50ms"}}"#, server.uri())),
            ..OutputParams::default()
        }
    }

    fn vus_batch(value: f64) -> SampleBatch {
        let time = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single().expect("valid time");
        SampleBatch::new(vec![
            Sample::new("vus", MetricType::Gauge, value, time).with_tag("scenario", "default"),
        ])
    }

    #[tokio::test]
    async fn the_one_where_samples_make_the_whole_trip() -> Result<()> {
        let server = MockServer::start().await;
        let fake = FakeBulk::default();
        mount_healthy_cluster(&server, &fake).await;

        let handler = Arc::new(RecordingOutcomeHandler::default());
        let mut output = ElasticsearchOutput::new(params_for(&server))
            .await?
            .with_outcome_handler(handler.clone());
        assert_eq!(output.description(), "Output k6 metrics to Elasticsearch");

        output.add_metric_samples(vus_batch(1.0));
        output.start().await?;
        output.add_metric_samples(vus_batch(2.0));
        output.add_metric_samples(vus_batch(3.0));
        output.stop().await?;

        let accepted = fake.accepted();
        assert_eq!(accepted.len(), 3);
        assert_eq!(
            accepted[0],
            serde_json::json!({
                "MetricName": "vus",
                "MetricType": "gauge",
                "Value": 1.0,
                "Tags": {"scenario": "default"},
                "Time": "2024-01-02T03:04:05Z"
            })
        );
        assert_eq!(handler.outcomes().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_ticker_flushes_while_running() -> Result<()> {
        let server = MockServer::start().await;
        let fake = FakeBulk::default();
        mount_healthy_cluster(&server, &fake).await;

        let handler = Arc::new(RecordingOutcomeHandler::default());
        let mut output = ElasticsearchOutput::new(OutputParams {
            json_config: Some(format!(
                r#"{{"url":"{}","flushPeriod":"20ms","bulkFlushInterval":"20ms"}}"#,
                server.uri()
            )),
            ..OutputParams::default()
        })
        .await?
        .with_outcome_handler(handler.clone());
        output.start().await?;
        output.add_metric_samples(vus_batch(42.0));

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while handler.outcomes().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(fake.accepted().len(), 1, "document should arrive before stop");
        output.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_index_already_exists_and_start_shrugs() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/k6-metrics"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"type": "resource_already_exists_exception", "reason": "already exists"},
                "status": 400
            })))
            .mount(&server)
            .await;

        let mut output = ElasticsearchOutput::new(params_for(&server)).await?;
        output.start().await?;
        output.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_500_on_index_creation_stops_the_show() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/k6-metrics"))
            .respond_with(ResponseTemplate::new(500).set_body_string("shard on fire"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut output = ElasticsearchOutput::new(params_for(&server)).await?;
        output.add_metric_samples(vus_batch(1.0));
        let err = output.start().await.expect_err("500 must abort start");
        let message = format!("{err:#}");
        assert!(message.contains("k6-metrics"), "got: {message}");
        assert!(message.contains("shard on fire"), "got: {message}");
        output.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_unreachable_cluster_never_gets_configured() {
        let result = ElasticsearchOutput::new(OutputParams {
            json_config: Some(r#"{"url":"http://127.0.0.1:1"}"#.to_string()),
            ..OutputParams::default()
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn the_one_where_bad_config_never_touches_the_network() {
        let result = ElasticsearchOutput::new(OutputParams {
            config_argument: Some("flushPeriod=sometimes".to_string()),
            ..OutputParams::default()
        })
        .await;
        let err = result.err().expect("bad duration must fail");
        assert!(format!("{err:#}").contains("flushPeriod"));
    }

    #[tokio::test]
    async fn the_one_where_samples_after_stop_are_shown_the_door() -> Result<()> {
        let server = MockServer::start().await;
        let fake = FakeBulk::default();
        mount_healthy_cluster(&server, &fake).await;

        let mut output = ElasticsearchOutput::new(params_for(&server)).await?;
        output.start().await?;
        output.add_metric_samples(vus_batch(1.0));
        output.stop().await?;

        output.add_metric_samples(vus_batch(2.0));
        output.add_metric_samples(vus_batch(3.0));
        assert!(output.buffer.is_empty(), "nothing drains the buffer after stop");
        assert_eq!(fake.accepted().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_start_twice_is_once_too_many() -> Result<()> {
        let server = MockServer::start().await;
        let fake = FakeBulk::default();
        mount_healthy_cluster(&server, &fake).await;

        let mut output = ElasticsearchOutput::new(params_for(&server)).await?;
        output.start().await?;
        assert!(output.start().await.is_err());
        output.stop().await?;
        output.stop().await?;
        Ok(())
    }
}
