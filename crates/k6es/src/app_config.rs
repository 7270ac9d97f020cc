//! 🔧 App Configuration — the sacred four-layer config cake.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the K6_ELASTICSEARCH_* env vars. Nothing." — every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment, because manually merging four config sources is a form of
//! self-harm that even the borrow checker wouldn't approve of.
//!
//! 📐 Layers, lowest to highest. Each layer only overrides the keys it actually sets:
//!   1. built-in defaults (`http://localhost:9200`, `k6-metrics`, `1s`)
//!   2. the persisted JSON config the host hands us
//!   3. `K6_ELASTICSEARCH_*` environment variables
//!   4. the explicit `key=value,key=value` argument
//!
//! A JSON `null` is "not set", not "set to nothing". The bottom layer survives it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::{Figment, providers::Serialized};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// 📡 Where metrics go when nobody says otherwise. Localhost: the comfort food of URLs.
pub const DEFAULT_URL: &str = "http://localhost:9200";
/// 📦 The index name k6 dashboards expect out of the box.
pub const DEFAULT_INDEX_NAME: &str = "k6-metrics";
/// ⏱️ One flush per second. Snappy, but not clingy.
pub const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(1);

/// 🌍 Every env var we read starts with this. No prefix, no party.
pub const ENV_PREFIX: &str = "K6_ELASTICSEARCH_";

/// 🚫 Characters Elasticsearch refuses in index names (`/`, `?`, `#` would also reroute the request).
const INDEX_NAME_FORBIDDEN: &[char] = &['/', '\\', '*', '?', '"', '<', '>', '|', ' ', ',', '#', ':'];

/// 📦 The consolidated configuration. Built once at startup, read-only forever after,
/// like a tattoo, but for HTTP clients.
///
/// Field names on the wire are camelCase (plus the lone kebab-case rebel, `cloud-id`,
/// which we keep because dashboards and docs in the wild already use it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// 📡 One address, or several separated by commas. Include scheme + port.
    #[serde(default = "default_url")]
    pub url: String,
    /// ☁️ Elastic Cloud deployment id. Wins over `url` when both are set.
    #[serde(rename = "cloud-id", default, skip_serializing_if = "Option::is_none")]
    pub cloud_id: Option<String>,
    /// 🔒 PEM bundle of extra trusted CAs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_file: Option<PathBuf>,
    /// ⚠️ Skip server certificate verification. For labs. Not for prod. Not for anything you love.
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// 🔒 Client certificate for mutual TLS. Must come with `client_key_file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_file: Option<PathBuf>,
    /// 🔒 Basic auth username. The bouncer at the club. Except the club is a database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// 🔒 "password123" is not a password. It is a confession.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// 🔒 API key — the velvet rope variant of authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// 🔒 Service account bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_token: Option<String>,
    /// ⏱️ How often the sample buffer gets drained.
    #[serde(default = "default_flush_period", with = "humantime_serde")]
    pub flush_period: Duration,
    #[serde(default = "default_index_name")]
    pub index_name: String,

    // 🚚 Bulk pipeline knobs. Sensible defaults; nobody has to touch them.
    #[serde(default = "default_bulk_workers")]
    pub bulk_workers: usize,
    /// 📦 Flush a worker's buffer once its NDJSON body reaches this many bytes.
    #[serde(default = "default_bulk_flush_bytes")]
    pub bulk_flush_bytes: usize,
    /// ⏱️ Flush a worker's buffer at least this often, even if it's small.
    #[serde(default = "default_bulk_flush_interval", with = "humantime_serde")]
    pub bulk_flush_interval: Duration,
    /// 🚧 Bounded queue between the flush cycle and the workers. Full queue = backpressure.
    #[serde(default = "default_bulk_queue_capacity")]
    pub bulk_queue_capacity: usize,
    #[serde(default = "default_bulk_max_retries")]
    pub bulk_max_retries: u32,
    /// 🫁 gzip the `_bulk` bodies.
    #[serde(default)]
    pub compress_request_body: bool,
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_index_name() -> String {
    DEFAULT_INDEX_NAME.to_string()
}

fn default_flush_period() -> Duration {
    DEFAULT_FLUSH_PERIOD
}

// 🧵 Two workers: one to send, one to send while the first is waiting on the network.
fn default_bulk_workers() -> usize {
    2
}

// 📦 5MB — the same flush threshold the official Go bulk indexer ships with.
fn default_bulk_flush_bytes() -> usize {
    5_000_000
}

fn default_bulk_flush_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_bulk_queue_capacity() -> usize {
    4096
}

fn default_bulk_max_retries() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: default_url(),
            cloud_id: None,
            ca_cert_file: None,
            insecure_skip_verify: false,
            client_cert_file: None,
            client_key_file: None,
            user: None,
            password: None,
            api_key: None,
            service_account_token: None,
            flush_period: default_flush_period(),
            index_name: default_index_name(),
            bulk_workers: default_bulk_workers(),
            bulk_flush_bytes: default_bulk_flush_bytes(),
            bulk_flush_interval: default_bulk_flush_interval(),
            bulk_queue_capacity: default_bulk_queue_capacity(),
            bulk_max_retries: default_bulk_max_retries(),
            compress_request_body: false,
        }
    }
}

impl Config {
    /// 📡 The `url` field, split on commas, trimmed, empties dropped.
    pub fn addresses(&self) -> Vec<String> {
        self.url
            .split(',')
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// 🔒 Reject configs that would only fail later, and louder.
    pub fn validate(&self) -> Result<()> {
        if self.flush_period.is_zero() {
            bail!("💀 flushPeriod must be greater than zero. A zero-second timer is just a busy loop with extra steps.");
        }
        if self.index_name.trim().is_empty() {
            bail!("💀 indexName is empty. Documents need a home; an empty string is not an address.");
        }
        // 🏷️ The name becomes a URL path segment; these would point the request somewhere else.
        if let Some(bad) = self.index_name.chars().find(|c| INDEX_NAME_FORBIDDEN.contains(c)) {
            bail!(
                "💀 indexName '{}' contains '{}'. Elasticsearch index names can't contain any of {:?}.",
                self.index_name,
                bad,
                INDEX_NAME_FORBIDDEN
            );
        }
        if matches!(self.index_name.as_str(), "." | "..") {
            bail!("💀 indexName '{}' is a path, not an index.", self.index_name);
        }
        if self.cloud_id.is_none() && self.addresses().is_empty() {
            bail!("💀 Neither url nor cloud-id is set. We'd love to send metrics somewhere, anywhere, but you have to tell us where.");
        }
        match (&self.client_cert_file, &self.client_key_file) {
            (Some(cert), None) => bail!(
                "💀 clientCertFile '{}' is set but clientKeyFile is not. Mutual TLS needs both halves of the friendship bracelet.",
                cert.display()
            ),
            (None, Some(key)) => bail!(
                "💀 clientKeyFile '{}' is set but clientCertFile is not. Mutual TLS needs both halves of the friendship bracelet.",
                key.display()
            ),
            _ => {}
        }
        if self.bulk_workers == 0 {
            bail!("💀 bulkWorkers must be at least 1. Zero workers is a union strike, not a pipeline.");
        }
        if self.bulk_flush_interval.is_zero() {
            bail!("💀 bulkFlushInterval must be greater than zero. Workers need at least a moment to collect themselves.");
        }
        if self.bulk_queue_capacity == 0 {
            bail!("💀 bulkQueueCapacity must be at least 1. A queue that holds nothing is a wall.");
        }
        Ok(())
    }
}

/// 🏷️ How to read a raw string from env or the argument into a typed config value.
#[derive(Debug, Clone, Copy)]
enum Kind {
    Text,
    Bool,
    Duration,
    Unsigned,
}

/// 🗺️ The one table that knows every key: (JSON/arg key, env suffix, kind).
const KEYS: &[(&str, &str, Kind)] = &[
    ("url", "URL", Kind::Text),
    ("cloud-id", "CLOUD_ID", Kind::Text),
    ("caCertFile", "CA_CERT_FILE", Kind::Text),
    ("insecureSkipVerify", "INSECURE_SKIP_VERIFY", Kind::Bool),
    ("clientCertFile", "CLIENT_CERT_FILE", Kind::Text),
    ("clientKeyFile", "CLIENT_KEY_FILE", Kind::Text),
    ("user", "USER", Kind::Text),
    ("password", "PASSWORD", Kind::Text),
    ("apiKey", "API_KEY", Kind::Text),
    ("serviceAccountToken", "SERVICE_ACCOUNT_TOKEN", Kind::Text),
    ("flushPeriod", "FLUSH_PERIOD", Kind::Duration),
    ("indexName", "INDEX_NAME", Kind::Text),
    ("bulkWorkers", "BULK_WORKERS", Kind::Unsigned),
    ("bulkFlushBytes", "BULK_FLUSH_BYTES", Kind::Unsigned),
    ("bulkFlushInterval", "BULK_FLUSH_INTERVAL", Kind::Duration),
    ("bulkQueueCapacity", "BULK_QUEUE_CAPACITY", Kind::Unsigned),
    ("bulkMaxRetries", "BULK_MAX_RETRIES", Kind::Unsigned),
    ("compressRequestBody", "COMPRESS_REQUEST_BODY", Kind::Bool),
];

/// 🚀 Consolidate defaults + JSON + env + argument into one validated [`Config`].
///
/// `env` is the host's environment map (not necessarily the process env; tests thank us).
/// Every layer only contributes keys it actually sets.
///
/// 💀 Returns an error naming the layer that broke. Which one it was matters at 3am.
pub fn load_config(
    json_config: Option<&str>,
    env: &HashMap<String, String>,
    arg: Option<&str>,
) -> Result<Config> {
    // 🏗️ Defaults are the sourdough starter. Everything else gets folded in on top.
    let mut figment = Figment::from(Serialized::defaults(Config::default()));

    if let Some(raw) = json_config.filter(|raw| !raw.trim().is_empty()) {
        let layer = json_layer(raw).context(
            "💀 The persisted JSON config for the Elasticsearch output could not be parsed. \
             It's JSON. It has rules. One of them was broken.",
        )?;
        debug!("🔧 JSON config layer sets {} key(s)", layer.len());
        figment = figment.merge(Serialized::defaults(layer));
    }

    let layer = env_layer(env).context(format!(
        "💀 One of the {ENV_PREFIX}* environment variables has a value we can't read."
    ))?;
    debug!("🔧 Environment layer sets {} key(s)", layer.len());
    figment = figment.merge(Serialized::defaults(layer));

    if let Some(arg) = arg.filter(|arg| !arg.trim().is_empty()) {
        let layer = arg_layer(arg).context(format!(
            "💀 Failed to parse the output argument '{arg}'. Expected key=value pairs separated by commas."
        ))?;
        debug!("🔧 Argument layer sets {} key(s)", layer.len());
        figment = figment.merge(Serialized::defaults(layer));
    }

    let config: Config = figment.extract().context(
        "💀 The merged Elasticsearch output configuration doesn't fit the schema. \
         Check durations (\"1s\", \"500ms\") and booleans (true/false).",
    )?;
    config.validate()?;
    Ok(config)
}

/// 📄 Persisted JSON → layer. Nulls are dropped ("unset"); numeric durations are milliseconds.
fn json_layer(raw: &str) -> Result<Map<String, Value>> {
    let parsed: Value = serde_json::from_str(raw)?;
    let Value::Object(object) = parsed else {
        bail!("💀 Expected a JSON object at the top level, got something else entirely.");
    };

    let mut layer = Map::new();
    for (key, value) in object {
        match (&value, kind_of(&key)) {
            (Value::Null, _) => continue,
            (Value::Number(millis), Some(Kind::Duration)) => {
                let millis = millis
                    .as_u64()
                    .with_context(|| format!("💀 '{key}' must be a non-negative number of milliseconds"))?;
                layer.insert(key, Value::String(format!("{millis}ms")));
            }
            _ => {
                layer.insert(key, value);
            }
        }
    }
    Ok(layer)
}

/// 🌍 `K6_ELASTICSEARCH_*` → layer.
fn env_layer(env: &HashMap<String, String>) -> Result<Map<String, Value>> {
    let mut layer = Map::new();
    for (key, env_suffix, kind) in KEYS {
        let env_name = format!("{ENV_PREFIX}{env_suffix}");
        if let Some(raw) = env.get(&env_name) {
            let value = typed_value(*kind, raw).with_context(|| format!("💀 {env_name}='{raw}'"))?;
            layer.insert((*key).to_string(), value);
        }
    }
    Ok(layer)
}

/// 🎛️ `url=http://es:9200,indexName=perf` → layer.
///
/// Commas separate pairs; a backslash escapes a literal comma (handy for multi-node urls).
/// Unknown keys are ignored with a warning, the same way unknown JSON keys are.
fn arg_layer(arg: &str) -> Result<Map<String, Value>> {
    let mut layer = Map::new();
    for pair in split_unescaped_commas(arg) {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("💀 key '{pair}' has no value");
        };
        let key = key.trim();
        match kind_of(key) {
            Some(kind) => {
                let value = typed_value(kind, raw).with_context(|| format!("💀 {key}='{raw}'"))?;
                layer.insert(key.to_string(), value);
            }
            None => warn!("⚠️ Ignoring unknown Elasticsearch output argument key '{key}'"),
        }
    }
    Ok(layer)
}

fn kind_of(key: &str) -> Option<Kind> {
    KEYS.iter()
        .find(|(name, _, _)| *name == key)
        .map(|(_, _, kind)| *kind)
}

fn typed_value(kind: Kind, raw: &str) -> Result<Value> {
    Ok(match kind {
        Kind::Text => Value::String(raw.to_string()),
        Kind::Bool => Value::Bool(parse_bool(raw)?),
        Kind::Duration => Value::String(humantime::format_duration(parse_duration(raw)?).to_string()),
        Kind::Unsigned => Value::from(
            raw.trim()
                .parse::<u64>()
                .with_context(|| format!("'{raw}' is not a non-negative integer"))?,
        ),
    })
}

/// ✅/❌ The same spellings Go's `strconv.ParseBool` accepts. Folks copy env files between tools.
fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim() {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        other => bail!("'{other}' is not a boolean"),
    }
}

/// ⏳ humantime syntax, or a bare integer meaning milliseconds.
pub(crate) fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if let Ok(millis) = raw.parse::<u64>() {
        return Ok(Duration::from_millis(millis));
    }
    humantime::parse_duration(raw).with_context(|| format!("'{raw}' is not a duration (try \"1s\" or \"500ms\")"))
}

fn split_unescaped_commas(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(',') => current.push(','),
                Some(other) => {
                    current.push('\\');
                    current.push(other);
                }
                None => current.push('\\'),
            },
            ',' => parts.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    parts.push(current);
    parts
}
