//! Wayline -- route orchestration core for an inference gateway.
//!
//! This is the process entry point. It wires together:
//!   - Configuration loading
//!   - Database initialization
//!   - The startup ability-cache build (repair-and-retry, fatal on double
//!     failure)
//!   - The background loops: cache resync, option sync, health and balance
//!     probers, usage batch writer, bulk job reconciler
//!   - Graceful shutdown on SIGTERM / SIGINT with a final usage flush

use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::EnvFilter;

use wayline::Orchestrator;
use wayline::config::Config;
use wayline::connector::HttpConnector;
use wayline::db::Database;
use wayline::leadership::StaticLeadership;

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

struct CliArgs {
    config_path: PathBuf,
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut config_path = PathBuf::from("wayline.toml");

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    config_path = PathBuf::from(path);
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("wayline {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!("Run with --help for usage information.");
                std::process::exit(1);
            }
        }
    }

    CliArgs { config_path }
}

fn print_usage() {
    println!(
        "\
wayline {version} -- inference gateway orchestration core

USAGE:
    wayline [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file [default: wayline.toml]
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    RUST_LOG               Override log level (e.g. RUST_LOG=debug)
    WAYLINE_CONFIG         Alternative to --config flag
",
        version = env!("CARGO_PKG_VERSION")
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime")
        .block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // 1. Parse CLI arguments
    let cli = parse_args();

    // Allow WAYLINE_CONFIG env var as alternative to --config flag
    let config_path = std::env::var("WAYLINE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or(cli.config_path);

    // 2. Load configuration
    let config = Config::load(&config_path)?;

    // 3. Initialize tracing/logging
    init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting wayline"
    );
    if !config.env_overrides.is_empty() {
        tracing::info!(
            count = config.env_overrides.len(),
            "Settings pinned by environment variables"
        );
    }

    // 4. Open database
    let db = Database::open(&config.database.path)?;
    tracing::info!(path = %config.database.path.display(), "Database opened");

    // 5. Assemble the orchestrator
    let leadership = Arc::new(StaticLeadership::new(config.leadership.is_leader));
    let connector = Arc::new(HttpConnector::new());
    let orchestrator = Orchestrator::new(Arc::new(config), db, connector, leadership);

    // 6. Startup build: repair-and-retry, fatal if the retry also fails.
    //    Without a routing table the service cannot function.
    if let Err(e) = orchestrator.rebuild_once() {
        tracing::error!(error = %e, "Startup cache build failed, aborting");
        anyhow::bail!("startup cache build failed: {e}");
    }

    // 7. Spawn background loops
    let _handles = orchestrator.start();

    // 8. Wait for shutdown signal
    shutdown_signal().await;

    // 9. Final usage flush
    match orchestrator.stop() {
        Ok(flushed) => {
            tracing::info!(flushed, "Shutting down gracefully");
        }
        Err(e) => {
            tracing::error!(error = %e, "Final usage flush failed");
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tracing initialization
// ---------------------------------------------------------------------------

/// Set up the tracing subscriber based on configuration.
fn init_tracing(config: &Config) {
    // RUST_LOG env var takes precedence over config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.logging.level;
        // Set wayline crate to the configured level, dependencies to warn
        EnvFilter::new(format!("wayline={level},warn"))
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Wait for a shutdown signal (SIGTERM or SIGINT / Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C)");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
