//! Strand Controller - workflow reconciliation daemon
//!
//! Runs the workflow controller against an in-memory cluster seeded from
//! YAML manifests:
//! - Watches workflows, pods and templates
//! - Drives each workflow through its operation cycles
//! - Archives finished workflows and garbage-collects expired records

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use strand_controller::{ControllerConfig, Daemon};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Strand Controller CLI
#[derive(Parser)]
#[command(name = "strand-controller")]
#[command(about = "Strand - workflow reconciliation controller", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "STRAND_CONFIG")]
    config: Option<String>,

    /// Namespace to manage (all namespaces when unset)
    #[arg(short, long, env = "STRAND_NAMESPACE")]
    namespace: Option<String>,

    /// Directory of YAML manifests to seed the cluster with
    #[arg(short, long, env = "STRAND_MANIFESTS")]
    manifests: Option<PathBuf>,

    /// Workflow worker count
    #[arg(short, long, env = "STRAND_WORKFLOW_WORKERS")]
    workers: Option<usize>,

    /// Log level
    #[arg(long, env = "STRAND_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "STRAND_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config =
        ControllerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // Override with CLI args
    if let Some(namespace) = cli.namespace {
        config.namespace = Some(namespace);
    }
    if let Some(manifests) = cli.manifests {
        config.manifests = Some(manifests);
    }
    if let Some(workers) = cli.workers {
        config.workers.workflow = workers;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.logging.json |= cli.json;
    config.validate()?;

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Print startup banner
    println!(
        r#"
  ___ _                  _
 / __| |_ _ _ __ _ _ _  __| |
 \__ \  _| '_/ _` | ' \/ _` |
 |___/\__|_| \__,_|_||_\__,_|

  Workflow Controller
  Version: {}
  Namespace: {}
  Archive: {}
"#,
        env!("CARGO_PKG_VERSION"),
        config.namespace.as_deref().unwrap_or("<all>"),
        if config.archive.enabled { "enabled" } else { "disabled" },
    );

    let daemon = Daemon::new(config).await?;
    daemon.run().await?;
    Ok(())
}
