//! Command-line front-end for the analysis bridge.
//!
//! Usage:
//!   analysis-bridge feedback "성실한 직원입니다" --context '{"team":"ops"}'
//!   analysis-bridge coaching '{"employee_id": 7, "signals": []}'
//!   analysis-bridge fallback "가끔 늦은 편입니다"
//!   analysis-bridge health

use std::path::PathBuf;
use std::process::ExitCode;

use analysis_bridge::config::LogLevel;
use analysis_bridge::{AnalysisResponse, AnalysisService, BridgeConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[derive(Parser)]
#[command(name = "analysis-bridge")]
#[command(about = "Run the feedback classification and coaching pipelines", long_about = None)]
struct Cli {
    /// Config file (defaults to ANALYSIS_BRIDGE_CONFIG or analysis_bridge.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Degrade to keyword matching when classification fails
    #[arg(long, global = true)]
    with_fallback: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a feedback text into sentiment-tagged keywords
    Feedback {
        text: String,
        /// Free-form context forwarded to the pipeline
        #[arg(long)]
        context: Option<String>,
    },
    /// Generate coaching hypotheses and a card from a JSON context packet
    Coaching { packet: String },
    /// Offline keyword extraction without launching any process
    Fallback { text: String },
    /// Check that the pipeline host can run scripts
    Health,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Installed before loading so config warnings are not lost. Logs go to
    // stderr; stdout carries the JSON result.
    let bootstrap = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&LogLevel::default().0));
    let (logger, log_filter) = subscriber(bootstrap, std::io::stderr);
    logger.init();

    let config = match &cli.config {
        Some(path) => BridgeConfig::load_from(path),
        None => BridgeConfig::load(),
    }
    .context("Failed to load configuration")?;

    if let Err(e) = log_filter.reload(filter_for(&config.log_level.0)) {
        warn!("Could not apply configured log filter: {}", e);
    }

    info!(
        "Analysis bridge ready: executable={}, scripts_root={}",
        config.process.executable.display(),
        config.process.scripts_root.display()
    );

    let service = AnalysisService::new(config);

    let success = match cli.command {
        Commands::Feedback { text, context } => {
            let response = if cli.with_fallback {
                service
                    .process_feedback_or_fallback(&text, context.as_deref())
                    .await
            } else {
                service.process_feedback(&text, context.as_deref()).await
            };
            print_response(&response)?
        }
        Commands::Coaching { packet } => {
            let packet: serde_json::Value =
                serde_json::from_str(&packet).context("Coaching packet is not valid JSON")?;
            let response = service.generate_coaching(&packet).await;
            print_response(&response)?
        }
        Commands::Fallback { text } => {
            let cid = AnalysisService::correlation_id("fallback");
            let response = service.fallback_keyword_extraction(&text, &cid);
            print_response(&response)?
        }
        Commands::Health => {
            let healthy = service.is_healthy().await;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "healthy": healthy }))?
            );
            healthy
        }
    };

    service.shutdown().await;
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Plain-text subscriber whose filter can be swapped once config is known.
fn subscriber<W>(
    filter: EnvFilter,
    writer: W,
) -> (impl tracing::Subscriber + Send + Sync + 'static, FilterHandle)
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let (filter, handle) = reload::Layer::new(filter);
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false));
    (subscriber, handle)
}

/// Filter for `directive`, or the default level when it does not parse.
fn filter_for(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|e| {
        let fallback = LogLevel::default().0;
        warn!("Invalid log filter {:?} ({}), using {}", directive, e, fallback);
        EnvFilter::new(fallback)
    })
}

fn print_response(response: &AnalysisResponse) -> Result<bool> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(response.success)
}
