//! 📊 k6es — ship k6 metric samples to Elasticsearch.
//!
//! 🧠 Knowledge graph:
//! - `app_config` → layered settings (defaults → JSON → env → argument)
//! - `client` → connection builder + startup probe
//! - `index` → creates the metrics index with the embedded mapping
//! - `buffer` → where sample batches wait between flushes
//! - `flusher` → ticks, one flush at a time, one last flush on stop
//! - `document` → sample → JSON document
//! - `bulk` → bounded queue + workers + `_bulk` + per-document outcomes
//! - `output` → the lifecycle the host drives
//! - `registry` → output names → factories

pub mod app_config;
pub mod buffer;
pub mod bulk;
pub mod client;
pub mod common;
pub mod document;
pub mod flusher;
pub mod index;
pub mod output;
pub mod registry;
mod workers;

#[cfg(test)]
mod test_support;

pub use app_config::{Config, load_config};
pub use common::{MetricType, Sample, SampleBatch};
pub use output::{ElasticsearchOutput, Output, OutputParams};
pub use registry::{ELASTICSEARCH_OUTPUT, OutputRegistry};
