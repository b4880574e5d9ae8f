//! rune-deploy - Deployment graph orchestration
//!
//! This is the main CLI entry point for rune-deploy.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use rune_deploy::service::{Service, ServiceState};
use rune_deploy::topology::{TopologyBuilder, TopologyConfig, TopologyParser};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// rune-deploy - Deployment graph orchestration
#[derive(Parser)]
#[command(name = "rune-deploy")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Deploy and run graphs of connected Rust services", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy and start a topology, stream its output until Ctrl-C
    Up {
        /// Topology file
        file: Option<PathBuf>,
    },

    /// Validate a topology file
    Validate {
        /// Topology file
        file: Option<PathBuf>,
    },

    /// Show the hosts, services and connections of a topology
    Plan {
        /// Topology file
        file: Option<PathBuf>,
    },
}

fn load(file: Option<PathBuf>) -> Result<(PathBuf, TopologyConfig)> {
    let path = match file {
        Some(path) => path,
        None => {
            let working_dir = std::env::current_dir()?;
            TopologyParser::find_topology_file(&working_dir)
                .unwrap_or_else(|| working_dir.join("topology.yaml"))
        }
    };
    let config = TopologyParser::parse_file(&path)
        .with_context(|| format!("failed to load topology {}", path.display()))?;
    Ok((path, config))
}

fn stream_output(service: &Arc<Service>, scheduler: &rune_deploy::scheduler::Scheduler) {
    let name = service.display_id().to_string();
    if let Ok(mut stdout) = service.stdout() {
        let name = name.clone();
        scheduler.spawn_cancellable(async move {
            while let Some(line) = stdout.next_line().await {
                println!("[{}] {}", name, line);
            }
        });
    }
    if let Ok(mut stderr) = service.stderr() {
        scheduler.spawn_cancellable(async move {
            while let Some(line) = stderr.next_line().await {
                eprintln!("[{}] {}", name, line);
            }
        });
    }
}

async fn up(path: &Path, config: &TopologyConfig) -> Result<()> {
    let mut deployment = TopologyBuilder::new(config)
        .build()
        .with_context(|| format!("invalid topology {}", path.display()))?;

    deployment.deploy().await.context("deploy failed")?;
    let report = deployment.start().await.context("start failed")?;
    for (name, reason) in &report.failed {
        eprintln!("Service {} failed to launch: {}", name, reason);
    }

    let running: Vec<Arc<Service>> = deployment
        .services()
        .iter()
        .filter(|s| s.state() == ServiceState::Running)
        .cloned()
        .collect();
    for service in &running {
        stream_output(service, deployment.scheduler());
    }
    println!("Started {} services, press Ctrl-C to stop", report.launched.len());

    let all_exited = join_all(running.iter().map(|s| s.runtime().wait_terminal()));
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            println!("Stopping services...");
        }
        _ = all_exited => {
            println!("All services exited");
        }
    }

    deployment.shutdown().await.context("shutdown failed")?;
    for service in deployment.services() {
        println!("{:<20} {}", service.name(), service.state());
    }
    Ok(())
}

fn plan(config: &TopologyConfig) -> Result<()> {
    let deployment = TopologyBuilder::new(config).build()?;

    println!("Hosts:");
    for host in deployment.hosts() {
        println!("  {}", host);
    }
    println!("Services:");
    for service in deployment.services() {
        println!("  {}", service);
    }
    println!("Connections:");
    for link in deployment.plan()? {
        println!("  {}", link);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Service output is printed directly, keep it out of the log
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info,rune_deploy::launch::output=off")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Up { file } => {
            let (path, config) = load(file)?;
            up(&path, &config).await?;
        }

        Commands::Validate { file } => {
            let (path, config) = load(file)?;
            let warnings = TopologyParser::validate(&config)
                .with_context(|| format!("invalid topology {}", path.display()))?;
            for warning in &warnings {
                println!("Warning: {}", warning);
            }
            println!("{} is valid", path.display());
        }

        Commands::Plan { file } => {
            let (_, config) = load(file)?;
            plan(&config)?;
        }
    }

    Ok(())
}
