//! Variant Express: experiment selection and metrics from the command line.
//!
//! Wires configuration, logging and backends into an `ExperimentService`,
//! runs one command and prints its result as JSON.

use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use variant_core::config::AppConfig;
use variant_core::types::MetricsBatch;
use variant_core::{Outcome, RequestParts};
use variant_service::{ExperimentService, ServiceBuilder};
use variant_store::MemoryKv;

/// Every workspace crate logs at info unless `RUST_LOG` says otherwise.
const DEFAULT_LOG_FILTER: &str = "variant_express=info,variant_service=info,variant_store=info,\
variant_models=info,variant_selection=info,variant_core=info";

#[derive(Parser, Debug)]
#[command(name = "variant-express")]
#[command(about = "A/B experiment selection and metrics collection")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short)]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "VARIANT_EXPRESS__NODE_ID")]
    node_id: Option<String>,

    /// Directory of site JSON files (overrides config)
    #[arg(long, env = "VARIANT_EXPRESS__MODELS__DIRECTORY")]
    sites: Option<String>,

    /// Use in-memory metrics and session stores instead of Redis
    #[arg(long, default_value_t = false)]
    memory: bool,

    /// Print per-variant counters with site output
    #[arg(long, default_value_t = false)]
    debug_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a site with bandit probabilities applied
    Site {
        site: String,
        #[arg(long)]
        origin: Option<String>,
        #[arg(long)]
        session: Option<String>,
    },
    /// Select the variant to serve for a site
    Select {
        site: String,
        /// Request a specific variant by name
        #[arg(long)]
        variant: Option<String>,
        #[arg(long)]
        origin: Option<String>,
        #[arg(long)]
        session: Option<String>,
    },
    /// Ingest a metrics batch from a JSON file, or `-` for stdin
    Ingest {
        file: PathBuf,
        #[arg(long)]
        session: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(sites) = cli.sites {
        config.models.directory = sites;
    }
    if cli.memory {
        config.redis.enabled = false;
    }
    if cli.debug_metrics {
        config.metrics.debug = true;
    }

    info!(
        node_id = %config.node_id,
        redis = config.redis.enabled,
        sites = %config.models.directory,
        "Configuration loaded"
    );

    let mut builder = ServiceBuilder::new(config);
    if cli.memory {
        builder = builder.kv(Arc::new(MemoryKv::new()));
    }
    let service = builder.build()?;

    let status = service.init().await;
    if !status.all() {
        warn!(
            metrics = status.metrics,
            sessions = status.sessions,
            models = status.models,
            "Running with degraded backends"
        );
    }

    let result = run(&service, cli.command).await;
    service.shutdown().await;

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(service: &ExperimentService, command: Command) -> anyhow::Result<serde_json::Value> {
    match command {
        Command::Site {
            site,
            origin,
            session,
        } => {
            let request = service.validate(RequestParts {
                origin,
                session_id: session,
                site_name: Some(site),
            })?;
            let (response, degraded) = settle(service.get_site(&request).await)?;
            Ok(json!({
                "site": response.site,
                "headers": headers_json(&response.headers),
                "degraded": degraded,
            }))
        }
        Command::Select {
            site,
            variant,
            origin,
            session,
        } => {
            let request = service.validate(RequestParts {
                origin,
                session_id: session,
                site_name: Some(site),
            })?;
            let ((response, selection), degraded) =
                settle(service.serve(&request, variant.as_deref()).await)?;
            Ok(json!({
                "experiment": selection.experiment.id,
                "variant": selection.variant,
                "source": selection.source,
                "session": selection.session,
                "headers": headers_json(&response.headers),
                "degraded": degraded,
            }))
        }
        Command::Ingest { file, session } => {
            let raw = if file.as_os_str() == "-" {
                let mut raw = String::new();
                tokio::io::stdin().read_to_string(&mut raw).await?;
                raw
            } else {
                tokio::fs::read_to_string(&file).await?
            };
            let batch: MetricsBatch = serde_json::from_str(&raw)?;
            let request = service.validate(RequestParts {
                origin: None,
                session_id: session,
                site_name: Some(batch.site.clone()),
            })?;
            let report = service.ingest_metrics(&request, &batch).await?;
            Ok(json!({
                "sessionId": report.session_id,
                "accepted": report.accepted,
                "rejected": {
                    "missingTimestamp": report.missing_timestamp,
                    "outOfOrder": report.out_of_order,
                    "oversizedPayload": report.oversized_payload,
                },
                "applied": report.applied,
            }))
        }
    }
}

/// Splits an outcome into its value and the degradation reason, if any.
fn settle<T>(outcome: Outcome<T>) -> anyhow::Result<(T, Option<String>)> {
    match outcome {
        Outcome::Success(value) => Ok((value, None)),
        Outcome::Degraded { value, reason } => Ok((value, Some(reason.to_string()))),
        Outcome::Fatal(e) => Err(e.into()),
    }
}

fn headers_json(headers: &[(String, String)]) -> serde_json::Value {
    headers
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_covers_library_crates() {
        for target in [
            "variant_express",
            "variant_service",
            "variant_store",
            "variant_models",
            "variant_selection",
            "variant_core",
        ] {
            assert!(
                DEFAULT_LOG_FILTER.contains(&format!("{target}=info")),
                "{target} missing"
            );
        }
        assert!(tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_cli_parses_select() {
        let cli = Cli::try_parse_from(["variant-express", "--memory", "select", "shop", "--variant", "B"])
            .unwrap();
        assert!(cli.memory);
        assert!(matches!(cli.command, Command::Select { variant: Some(ref v), .. } if v == "B"));
    }
}
