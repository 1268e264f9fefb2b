//! Logging module for the HistomicsTK deployer
//!
//! Structured logging with tracing. Human-readable output on a terminal, JSON
//! lines otherwise. Log records always go to stderr so that stdout carries only
//! streamed build and provisioning output.

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Workspace crates whose records pass the default filter
const TARGETS: [&str; 2] = ["histomicstk_orchestrator", "histomicstk_deploy"];

fn parse_level(log_level: &str) -> Level {
    match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Filter directives used when `RUST_LOG` is not set
fn default_directives(level: Level) -> String {
    TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialize the logging/tracing system
pub fn init_logging(log_level: &str) -> Result<()> {
    let level = parse_level(log_level);

    // Build filter from level or RUST_LOG env var
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    if atty::is(atty::Stream::Stderr) {
        let stderr_layer = fmt::layer()
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr);

        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init()?;
    } else {
        let json_layer = fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .with_writer(std::io::stderr);

        tracing_subscriber::registry()
            .with(filter)
            .with(json_layer)
            .try_init()?;
    }

    Ok(())
}

/// Check if a standard stream is a terminal
mod atty {
    pub enum Stream {
        Stderr,
    }

    pub fn is(stream: Stream) -> bool {
        #[cfg(unix)]
        {
            let fd = match stream {
                Stream::Stderr => libc::STDERR_FILENO,
            };
            unsafe { libc::isatty(fd) != 0 }
        }
        #[cfg(not(unix))]
        {
            let _ = stream;
            false
        }
    }
}
