use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use enquiry_aggregate::{Aggregator, AggregatorConfig};
use enquiry_sources::Source;
use enquiry_upstream::{HttpClientConfig, HttpUpstream};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "enquiry-cli")]
#[command(about = "Enquiry dashboard aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the dashboard API.
    Serve,
    /// Run one aggregation and print the dashboard payload.
    Fetch,
    /// Run the diagnostic probes and print the report.
    Diagnose,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("ENQUIRY_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn aggregator_from_env() -> Result<(Aggregator, Vec<Source>)> {
    let config = AggregatorConfig::from_env()?;
    let (sources, warnings) = config.build_sources()?;
    for warning in warnings {
        warn!(%warning, "source configuration");
    }
    let http = HttpUpstream::new(HttpClientConfig {
        timeout: config.request_timeout(),
        user_agent: Some("enquiry-cli/0.1".to_string()),
    })?;
    Ok((Aggregator::new(Arc::new(http), config.request_timeout()), sources))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => enquiry_web::serve_from_env().await?,
        Commands::Fetch => {
            let (aggregator, sources) = aggregator_from_env()?;
            let aggregation = aggregator.aggregate(&sources).await?;
            for warning in &aggregation.report.warnings {
                warn!(%warning, "aggregation warning");
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&aggregation.payload).context("encoding payload")?
            );
            eprintln!(
                "aggregation complete: method={} count={} reconstructed={}",
                aggregation.report.method, aggregation.report.count, aggregation.report.reconstructed
            );
        }
        Commands::Diagnose => {
            let (aggregator, sources) = aggregator_from_env()?;
            let report = aggregator.diagnose(&sources).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("encoding diagnostic report")?
            );
        }
    }

    Ok(())
}
