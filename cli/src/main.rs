//! HistomicsTK deploy CLI - Command-line interface for the stack reconciler
//!
//! Starts, stops, removes, builds and provisions the HistomicsTK containers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use tracing::debug;

use histomicstk_orchestrator::config::AppConfig;
use histomicstk_orchestrator::logging::init_logging;
use histomicstk_orchestrator::models::{
    DatabaseStorage, DependencyMode, StackStatus, StartOptions, StartReport, StopOptions,
};
use histomicstk_orchestrator::{DockerRuntime, Reconciler};

/// HistomicsTK deploy - run the HistomicsTK stack in Docker
#[derive(Parser, Debug)]
#[command(name = "histomicstk-deploy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Create, start and stop the HistomicsTK docker containers", long_about = None)]
struct Cli {
    /// What to do with the stack
    #[arg(value_enum)]
    command: Command,

    /// Host path for the assetstore
    #[arg(short, long, default_value = "~/.histomicstk/assetstore")]
    assetstore: PathBuf,

    /// Build the images before running the command
    #[arg(short, long)]
    build: bool,

    /// Host path for the database, or "docker" to keep it inside the container
    #[arg(short, long, default_value = "~/.histomicstk/db")]
    db: DatabaseStorage,

    /// Host path for logs
    #[arg(short, long, visible_alias = "log", default_value = "~/.histomicstk/logs")]
    logs: PathBuf,

    /// Database: "docker", "host", or an address
    #[arg(short, long, default_value = "docker")]
    mongo: DependencyMode,

    /// Provision the application even if its container already exists
    #[arg(long)]
    provision: bool,

    /// Host port for the web application
    #[arg(short, long, default_value_t = 8080, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Retry builds and provisioning until they succeed
    #[arg(short, long)]
    retry: bool,

    /// Message queue: "docker", "host", or an address
    #[arg(long, default_value = "docker")]
    rmq: DependencyMode,

    /// Report the stack status after running the command
    #[arg(short, long)]
    status: bool,

    /// Print the status report as JSON
    #[arg(long)]
    json: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    /// Create and start the containers
    Start,
    /// Stop, then start the containers
    Restart,
    /// Stop the containers
    Stop,
    /// Stop and remove the containers and the network
    #[value(alias = "remove")]
    Rm,
    /// Report images, containers and the network
    Status,
    /// Build the locally built images
    Build,
    /// Start the containers and provision the application
    Provision,
}

/// Steps to run, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Plan {
    build: bool,
    stop: Option<StopOptions>,
    start: bool,
    status: bool,
}

impl Cli {
    fn plan(&self) -> Plan {
        let stop = match self.command {
            Command::Stop | Command::Restart => Some(StopOptions { remove: false }),
            Command::Rm => Some(StopOptions { remove: true }),
            _ => None,
        };

        Plan {
            build: self.build || self.command == Command::Build,
            stop,
            start: matches!(
                self.command,
                Command::Start | Command::Restart | Command::Provision
            ),
            status: self.status || self.command == Command::Status,
        }
    }

    fn start_options(&self) -> StartOptions {
        StartOptions {
            port: self.port,
            rmq: self.rmq.clone(),
            mongo: self.mongo.clone(),
            db: self.db.clone(),
            logs: self.logs.clone(),
            assetstore: self.assetstore.clone(),
            provision: self.provision || self.command == Command::Provision,
            retry: self.retry,
        }
    }
}

fn print_start_report(report: &StartReport) {
    println!("{}", "=".repeat(60).bright_blue());
    if report.created.is_empty() {
        println!("{} {}", "Created:".bright_cyan(), "none".dimmed());
    } else {
        let created: Vec<&str> = report.created.iter().map(|k| k.as_str()).collect();
        println!("{} {}", "Created:".bright_cyan(), created.join(", "));
    }
    if report.started.is_empty() {
        println!("{} {}", "Started:".bright_cyan(), "none".dimmed());
    } else {
        let started: Vec<&str> = report.started.iter().map(|k| k.as_str()).collect();
        println!("{} {}", "Started:".bright_cyan(), started.join(", "));
    }
    if let Some(attempts) = report.provision_attempts {
        println!(
            "{} {} ({} {})",
            "Provisioned:".bright_cyan(),
            "✓".green(),
            attempts,
            if attempts == 1 { "attempt" } else { "attempts" }
        );
    }
    println!("{}", "=".repeat(60).bright_blue());
}

fn print_status(status: &StackStatus) {
    println!("{}", "HistomicsTK Stack Status".bright_cyan().bold());
    println!("{}", "=".repeat(60).bright_blue());
    println!(
        "{} {} {}",
        "Network:".cyan(),
        status.network,
        if status.network_present {
            "present".green()
        } else {
            "missing".yellow()
        }
    );

    for service in &status.services {
        let image = if service.image_present {
            service.image.green()
        } else {
            service.image.yellow()
        };
        let state = match &service.container {
            Some(container) if container.state.is_running() => container.state.as_str().green(),
            Some(container) => container.state.as_str().yellow(),
            None => "absent".dimmed(),
        };
        println!(
            "  {:<12} {:<40} {:<28} {}",
            service.service.as_str().bold(),
            image,
            service.container_name,
            state
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load().context("Failed to load configuration")?;
    let log_level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    init_logging(log_level)?;

    let plan = cli.plan();
    debug!(command = ?cli.command, plan = ?plan, "Running");

    let runtime = DockerRuntime::connect(config.stop_timeout_seconds)
        .context("Failed to connect to the Docker daemon")?;
    let docker_version = runtime
        .version()
        .await
        .context("Docker daemon is not reachable")?;
    debug!(docker_version = %docker_version, "Connected");

    let reconciler = Reconciler::new(
        Arc::new(runtime),
        config.services.clone(),
        config.reconciler_settings(),
    );

    if plan.build {
        let outcomes = reconciler.build(None, cli.retry).await?;
        for outcome in outcomes {
            println!(
                "{} {} (try {})",
                "✓ Built:".green(),
                outcome.service,
                outcome.attempts
            );
        }
    }

    if let Some(options) = plan.stop {
        reconciler.stop(&options).await?;
        let verb = if options.remove { "Removed" } else { "Stopped" };
        println!("{} {}", format!("✓ {}", verb).green(), "HistomicsTK stack");
    }

    if plan.start {
        let report = reconciler.start(&cli.start_options()).await?;
        print_start_report(&report);
    }

    if plan.status {
        let status = reconciler.status().await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            print_status(&status);
        }
    }

    Ok(())
}
