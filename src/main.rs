// ABOUTME: CLI entry point for sslr
// ABOUTME: Loads the config, runs sync jobs and handles signals cleanly

use clap::Parser;
use sslr::Job;
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "sslr")]
#[command(about = "One-way incremental PostgreSQL table replication", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the JSON config file
    #[arg(long, default_value = "sslr.json")]
    cfg: String,
    /// Run continuously, pausing waitBetweenJobs seconds between runs
    #[arg(short = 'c', long)]
    continuous: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG has highest precedence, then the --log flag.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = match sslr::load_config(&cli.cfg) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {:#}", e);
            std::process::exit(1);
        }
    };

    let wait_between_jobs = std::time::Duration::from_secs(config.wait_between_jobs);

    let job = match Job::new(config) {
        Ok(job) => job,
        Err(e) => {
            tracing::error!("Failed to create job: {:#}", e);
            std::process::exit(2);
        }
    };

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    loop {
        // A signal mid-run drops the job future at its next await point;
        // any in-flight target transaction rolls back and no state is
        // advanced for the interrupted chunk.
        tokio::select! {
            result = job.run() => {
                if let Err(e) = result {
                    tracing::error!("Job failed: {:#}", e);
                    std::process::exit(3);
                }
                if !cli.continuous {
                    break;
                }
            }
            _ = sigint.recv() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Terminated, shutting down");
                break;
            }
        }

        // Continuous mode: pause between runs, still listening for signals.
        tokio::select! {
            _ = tokio::time::sleep(wait_between_jobs) => {}
            _ = sigint.recv() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Terminated, shutting down");
                break;
            }
        }
    }
}
