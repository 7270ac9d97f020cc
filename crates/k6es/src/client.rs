//! # 📡 THE ELASTICSEARCH CLIENT
//!
//! 🎬 COLD OPEN — INT. STAGING CLUSTER — 9:58 AM, TWO MINUTES BEFORE THE LOAD TEST
//!
//! Someone pasted a cloud id into the env. Someone else pasted a url. A third
//! person added an API key "just in case". This module takes all of it, decides
//! who wins, builds one `reqwest::Client` with the right TLS material, and then
//! knocks on the cluster's front door exactly once to make sure somebody's home.
//!
//! 🧠 Knowledge graph:
//! - Address resolution: cloud id beats url; url may list several nodes (round-robin).
//! - Credentials: API key > service-account token > basic auth. Highest rank wins, no merging.
//! - TLS: extra CA from file, optional client cert/key for mutual TLS, optional "yolo" mode.
//! - Probe: `GET /`; on 403 fall back to `_has_privileges` on the target index.
//!
//! 🦆

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::app_config::Config;

// ⏱️ 10s to shake hands, 30s for the whole conversation. Bulk requests can be meaty.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// 🔒 Who we claim to be when we knock.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Basic {
        username: String,
        password: Option<String>,
    },
    ApiKey(String),
    ServiceToken(String),
}

impl Credentials {
    /// 🔒 Pick the highest-ranked credential the config carries.
    pub fn from_config(config: &Config) -> Self {
        if let Some(api_key) = &config.api_key {
            Credentials::ApiKey(api_key.clone())
        } else if let Some(token) = &config.service_account_token {
            Credentials::ServiceToken(token.clone())
        } else if let Some(username) = &config.user {
            Credentials::Basic {
                username: username.clone(),
                password: config.password.clone(),
            }
        } else {
            Credentials::Anonymous
        }
    }

    /// 🏷️ Human label for error messages. Never includes the secret.
    pub fn describe(&self) -> String {
        match self {
            Credentials::Anonymous => "no credentials".to_string(),
            Credentials::Basic { username, .. } => format!("basic auth as user '{username}'"),
            Credentials::ApiKey(_) => "API key".to_string(),
            Credentials::ServiceToken(_) => "service account token".to_string(),
        }
    }

    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Credentials::Anonymous => request,
            Credentials::Basic { username, password } => request.basic_auth(username, password.as_ref()),
            Credentials::ApiKey(key) => request.header(AUTHORIZATION, format!("ApiKey {key}")),
            Credentials::ServiceToken(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
        }
    }
}

// 🎭 Hand-rolled Debug so secrets never end up in a `{:?}` log line.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// 📡 A ready-to-use handle on one Elasticsearch deployment.
///
/// Cheap to share behind an `Arc`; the inner `reqwest::Client` pools connections
/// and the address cursor is atomic.
#[derive(Debug)]
pub struct ElasticsearchClient {
    http: reqwest::Client,
    addresses: Vec<String>,
    credentials: Credentials,
    next_address: AtomicUsize,
}

#[derive(Debug, Deserialize)]
struct HasPrivilegesResponse {
    #[serde(default)]
    has_all_requested: Option<bool>,
}

impl ElasticsearchClient {
    /// 🏗️ Build the client from config. No network I/O happens here.
    ///
    /// Fails on unreadable/invalid TLS material or a malformed cloud id, naming the culprit.
    pub fn from_config(config: &Config) -> Result<Self> {
        let addresses = resolve_addresses(config)?;
        let credentials = Credentials::from_config(config);

        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);

        if let Some(ca_path) = &config.ca_cert_file {
            let pem = read_pem(ca_path, "CA certificate")?;
            let certificates = reqwest::Certificate::from_pem_bundle(&pem).with_context(|| {
                format!("💀 CA certificate file '{}' is not a valid PEM certificate.", ca_path.display())
            })?;
            // 🔒 A PEM with zero certificates parses "fine" and trusts nothing. Not fine.
            if certificates.is_empty() {
                bail!(
                    "💀 CA certificate file '{}' holds no PEM certificates.",
                    ca_path.display()
                );
            }
            for certificate in certificates {
                builder = builder.add_root_certificate(certificate);
            }
        }

        if let (Some(cert_path), Some(key_path)) = (&config.client_cert_file, &config.client_key_file) {
            // 🔐 reqwest wants key + cert in one PEM buffer. Concatenation: the oldest trick in TLS.
            let mut pem = read_pem(cert_path, "client certificate")?;
            pem.push(b'\n');
            pem.extend(read_pem(key_path, "client key")?);
            let identity = reqwest::Identity::from_pem(&pem).with_context(|| {
                format!(
                    "💀 Client certificate '{}' and key '{}' do not form a usable identity.",
                    cert_path.display(),
                    key_path.display()
                )
            })?;
            builder = builder.identity(identity);
        }

        if config.insecure_skip_verify {
            warn!("⚠️ TLS certificate verification is disabled for Elasticsearch. Please don't do this in prod.");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .context("💀 The HTTP client refused to be born. The TLS stack wept. Check the certificate settings.")?;

        debug!(
            "📡 Elasticsearch client targets {:?} using {}",
            addresses,
            credentials.describe()
        );

        Ok(Self {
            http,
            addresses,
            credentials,
            next_address: AtomicUsize::new(0),
        })
    }

    /// 🚀 Build the client and run the one-time reachability/authorization probe.
    pub async fn connect(config: &Config) -> Result<Self> {
        let client = Self::from_config(config)?;
        client.verify(&config.index_name).await?;
        Ok(client)
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// 📡 A request against the next node in the rotation, credentials attached.
    ///
    /// `path` starts with `/`.
    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let slot = self.next_address.fetch_add(1, Ordering::Relaxed) % self.addresses.len();
        let url = format!("{}{}", self.addresses[slot], path);
        self.credentials.apply(self.http.request(method, url))
    }

    /// 🚪 "Hello? Is this thing on?" — `GET /`, with a polite fallback for locked-down users.
    ///
    /// The info endpoint needs the `monitor` privilege. A 403 only happens when security
    /// is on, so we ask `_has_privileges` instead, which every authenticated user may call.
    pub async fn verify(&self, index_name: &str) -> Result<()> {
        let response = self.request(Method::GET, "/").send().await.with_context(|| {
            format!(
                "💀 Could not reach Elasticsearch at {}. Is the cluster up? Is the url right?",
                self.addresses.join(", ")
            )
        })?;

        match response.status() {
            StatusCode::OK => {
                info!("✅ Connected to Elasticsearch at {}", self.addresses.join(", "));
                Ok(())
            }
            StatusCode::FORBIDDEN => {
                debug!("🔒 Info endpoint said 403; falling back to the privileges check for '{index_name}'");
                self.check_privileges(index_name).await
            }
            other => bail!(
                "💀 cannot connect to Elasticsearch (status code {}) at {} using {}",
                other.as_u16(),
                self.addresses.join(", "),
                self.credentials.describe()
            ),
        }
    }

    async fn check_privileges(&self, index_name: &str) -> Result<()> {
        let body = serde_json::json!({
            "index": [
                {
                    "names": [index_name],
                    "privileges": ["write", "create_index"]
                }
            ]
        });

        let response = self
            .request(Method::POST, "/_security/user/_has_privileges")
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .with_context(|| {
                format!(
                    "💀 The privileges check against {} never got an answer.",
                    self.addresses.join(", ")
                )
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            bail!(
                "💀 cannot connect to Elasticsearch (status code {}) — privileges check for index '{}' failed using {}",
                status.as_u16(),
                index_name,
                self.credentials.describe()
            );
        }

        let text = response.text().await.unwrap_or_default();
        if let Ok(HasPrivilegesResponse { has_all_requested: Some(false) }) = serde_json::from_str::<HasPrivilegesResponse>(&text) {
            warn!(
                "⚠️ Connected, but {} lacks write/create_index on '{}'. Expect per-document failures.",
                self.credentials.describe(),
                index_name
            );
        } else {
            info!("✅ Connected to Elasticsearch (privileges check passed for '{index_name}')");
        }
        Ok(())
    }
}

fn resolve_addresses(config: &Config) -> Result<Vec<String>> {
    // ☁️ Cloud id takes precedence over a url, which is localhost by default anyway.
    let addresses = match &config.cloud_id {
        Some(cloud_id) => vec![decode_cloud_id(cloud_id)?],
        None => config.addresses(),
    };
    if addresses.is_empty() {
        bail!("💀 No Elasticsearch address configured. Set url or cloud-id.");
    }
    Ok(addresses
        .into_iter()
        .map(|address| address.trim_end_matches('/').to_string())
        .collect())
}

/// ☁️ `name:base64(host[:port]$es_uuid$kibana_uuid)` → `https://es_uuid.host[:port]`.
pub fn decode_cloud_id(cloud_id: &str) -> Result<String> {
    let mut pieces = cloud_id.split(':');
    let (Some(_name), Some(encoded), None) = (pieces.next(), pieces.next(), pieces.next()) else {
        bail!("💀 Cloud id '{cloud_id}' has an unexpected format; expected 'name:base64data'.");
    };

    let decoded = STANDARD
        .decode(encoded)
        .or_else(|_| STANDARD_NO_PAD.decode(encoded))
        .with_context(|| format!("💀 Cloud id '{cloud_id}' does not carry valid base64."))?;
    let decoded = String::from_utf8(decoded).with_context(|| format!("💀 Cloud id '{cloud_id}' decodes to non-UTF-8 bytes."))?;

    let parts: Vec<&str> = decoded.split('$').collect();
    if parts.len() < 2 || parts[0].is_empty() || parts[1].is_empty() {
        bail!("💀 Cloud id '{cloud_id}' decodes to '{decoded}', which is missing the host or the Elasticsearch id.");
    }
    Ok(format!("https://{}.{}", parts[1], parts[0]))
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("💀 Could not read {what} file '{}'.", path.display()))
}
