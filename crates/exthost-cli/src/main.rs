//! Command-line interface for the extension host orchestrator.

mod manifest;
mod runner;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use exthost_core::config::{self, defaults};
use exthost_core::prelude::*;
use exthost_core::{ProcessHostFactory, RunningLocationClassifier};

use crate::manifest::{Manifest, ManifestScanner};

/// Idle time after which `run` considers activation settled.
const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// Exthost - Place, start and activate extensions across extension hosts.
#[derive(Parser, Debug)]
#[command(name = "exthost")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Print where every extension in a manifest would run.
    Classify {
        /// Manifest file (JSON).
        manifest: PathBuf,
        /// A remote extension host is available.
        #[arg(long)]
        remote: bool,
        /// A web worker extension host is available.
        #[arg(long)]
        web_worker: bool,
    },
    /// Start hosts for a manifest, fire activation events and print status.
    Run {
        /// Manifest file (JSON).
        manifest: PathBuf,
        /// Activation event to fire after registration.
        #[arg(short, long = "event")]
        events: Vec<String>,
        /// Start a remote extension host even if no remote extension is listed.
        #[arg(long)]
        remote: bool,
    },
    /// Serve the host protocol on stdin/stdout.
    HostRunner {
        /// Kind of host this process serves.
        #[arg(long, default_value = "local-process")]
        kind: ExtensionHostKind,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match args.command {
        Command::Classify {
            manifest,
            remote,
            web_worker,
        } => classify(&manifest, remote, web_worker),
        Command::Run {
            manifest,
            events,
            remote,
        } => run(&manifest, &events, remote).await,
        Command::HostRunner { kind } => {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            runner::serve(kind, stdin, tokio::io::stdout()).await
        }
    }
}

/// Logs go to stderr; stdout carries command output and the host protocol.
fn init_tracing(verbose: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let filter = if verbose {
            "exthost=debug,exthost_core=debug"
        } else {
            defaults::LOG_FILTER
        };
        tracing_subscriber::EnvFilter::new(filter).add_directive(tracing::Level::WARN.into())
    });

    if config::log_json() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

fn classify(path: &Path, remote: bool, web_worker: bool) -> Result<()> {
    let manifest = Manifest::load(path)?;
    let classifier = RunningLocationClassifier::new(remote, web_worker)
        .with_development_kind(config::development_extension_kind());

    for desc in &manifest.extensions {
        println!("{}: {}", desc.identifier, classifier.classify(desc));
    }
    Ok(())
}

async fn run(path: &Path, events: &[String], remote: bool) -> Result<()> {
    let manifest = Manifest::load(path)?;
    let program = std::env::current_exe().context("Failed to locate the exthost binary")?;
    let config = OrchestratorConfig::from_env()
        .with_remote_host(remote || manifest.has_remote())
        .with_host_command(HostCommand::new(program).arg("host-runner"));
    let factory = ProcessHostFactory::from_config(&config)
        .context("No host command configured")?;

    let orchestrator = ExtensionOrchestrator::builder(
        Arc::new(ManifestScanner::new(manifest)),
        Arc::new(factory),
    )
    .config(config)
    .build();
    let mut rx = orchestrator.subscribe();

    orchestrator.initialize().await?;
    for event in events {
        if let Err(e) = orchestrator
            .activate_by_event(event, ActivationKind::Normal)
            .await
        {
            tracing::warn!(event = %event, error = %e, "Activation event failed");
        }
    }

    // Host notifications arrive asynchronously; wait for them to settle.
    while let Ok(Some(_)) = tokio::time::timeout(QUIET_PERIOD, rx.recv()).await {}

    let status = orchestrator.get_extensions_status();
    println!("{}", serde_json::to_string_pretty(&status)?);

    orchestrator.stop_extension_hosts().await;
    Ok(())
}
