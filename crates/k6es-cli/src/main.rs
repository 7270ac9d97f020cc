//! 🚀 k6es-cli — a tiny host that plays the metrics engine's part.
//!
//! 🎬 *[narrator voice]* "It reads samples. It hands them over in batches. It says goodbye politely."
//! 📦 Loads config the way the engine would (JSON file, process env, `--arg`),
//! builds the output through the registry, replays an NDJSON file of samples,
//! and stops. Handy for smoke-testing a cluster without running a load test. 🦆

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use k6es::{ELASTICSEARCH_OUTPUT, Output, OutputParams, OutputRegistry, Sample, SampleBatch};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// 📊 Replay k6 metric samples into a metrics output.
#[derive(Debug, Parser)]
#[command(name = "k6es", version)]
struct Cli {
    /// Registered output name.
    #[arg(long, default_value = ELASTICSEARCH_OUTPUT)]
    output: String,

    /// JSON config file (same keys as the k6 config's output section).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Config argument, e.g. `url=http://localhost:9200,indexName=perf`.
    #[arg(long)]
    arg: Option<String>,

    /// Samples per batch handed to the output.
    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Pause between batches, e.g. `250ms`.
    #[arg(long, value_parser = humantime::parse_duration)]
    pace: Option<Duration>,

    /// NDJSON file of samples, or `-` for stdin.
    samples: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 📡 RUST_LOG decides how chatty we are
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = run(cli).await;

    if let Err(err) = result {
        error!("💀 error: {}", err);
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
        }
        if connectivity_hint(&err) {
            error!(
                "🔧 hint: Elasticsearch didn't pick up. Check the url (or cloud-id), \
                the credentials, and that the cluster is actually running. \
                If you're using Docker, `docker ps` will tell you who showed up to work. ☕"
            );
        }
        std::process::exit(1);
    }

    Ok(())
}

/// 🕵️ Does this error smell like "the cluster isn't there" (or won't let us in)?
///
/// Matches what the output itself says at startup, plus the reqwest transport wording
/// that ends up underneath it.
fn connectivity_hint(err: &anyhow::Error) -> bool {
    const TELLTALES: &[&str] = &[
        "Could not reach Elasticsearch at",
        "cannot connect to Elasticsearch (status code",
        "privileges check against",
        "error sending request",
        "tcp connect error",
        "dns error",
    ];
    err.chain().any(|cause| {
        let cause = cause.to_string();
        TELLTALES.iter().any(|telltale| cause.contains(telltale))
    })
}

async fn run(cli: Cli) -> Result<()> {
    let json_config = match &cli.config {
        Some(path) => Some(tokio::fs::read_to_string(path).await.with_context(|| {
            format!(
                "💀 Couldn't read the config file '{}'. Relative paths are relative to where you ran this from.",
                path.display()
            )
        })?),
        None => None,
    };

    let params = OutputParams {
        json_config,
        environment: std::env::vars().collect(),
        config_argument: cli.arg.clone(),
    };

    let registry = OutputRegistry::default();
    let mut output = registry
        .create(&cli.output, params)
        .await
        .with_context(|| format!("💀 Could not configure output '{}'", cli.output))?;
    info!("🚀 {}", output.description());

    output.start().await.context("💀 The output refused to start")?;

    let reader = open_samples(&cli.samples).await?;
    let fed = feed(output.as_ref(), reader, cli.batch_size.max(1), cli.pace).await;
    let stopped = output.stop().await.context("💀 The output did not stop cleanly");

    let count = fed?;
    stopped?;
    info!("✅ Replayed {count} sample(s)");
    Ok(())
}

async fn open_samples(source: &str) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    if source == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(source)
        .await
        .with_context(|| format!("💀 Couldn't open the samples file '{source}'"))?;
    Ok(Box::new(BufReader::new(file)))
}

/// 📥 Read NDJSON samples and hand them to the output `batch_size` at a time.
async fn feed(
    output: &dyn Output,
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
    batch_size: usize,
    pace: Option<Duration>,
) -> Result<usize> {
    let mut lines = reader.lines();
    let mut line_number = 0usize;
    let mut count = 0usize;
    let mut pending = Vec::with_capacity(batch_size);

    while let Some(line) = lines.next_line().await.context("💀 Failed reading samples")? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let sample: Sample = serde_json::from_str(&line)
            .with_context(|| format!("💀 Line {line_number} is not a valid sample"))?;
        pending.push(sample);
        count += 1;

        if pending.len() >= batch_size {
            output.add_metric_samples(SampleBatch::new(std::mem::take(&mut pending)));
            if let Some(pace) = pace {
                tokio::time::sleep(pace).await;
            }
        }
    }

    if !pending.is_empty() {
        output.add_metric_samples(SampleBatch::new(pending));
    }
    Ok(count)
}
