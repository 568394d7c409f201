//! Cluster Controller
//!
//! Bootstrap supervisor for the multi-cluster control plane controllers:
//! - API importer: tracks which resources each WorkloadCluster has imported
//! - API resource: negotiates one NegotiatedAPIResource per imported resource
//! - Syncer (optional): runs a syncer for each WorkloadCluster
//!
//! Startup is strictly ordered: credentials, clients, watch caches, cache
//! sync, then the controllers. One shutdown signal stops all of them.

mod backoff;
mod cache;
mod clients;
mod connection;
mod controller;
mod error;
mod lifecycle;
mod options;
mod reconcile_helpers;
mod reconciler;
mod shutdown;
mod supervisor;
mod test_utils;

use clap::Parser;
use controller::Controller;
use error::ControllerError;
use options::Options;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube's rustls client needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let options = match Options::try_parse() {
        Ok(options) => options,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(parse_exit_code(&e));
        }
    };

    ExitCode::from(exit_code(run(options).await))
}

async fn run(options: Options) -> Result<(), ControllerError> {
    info!("Starting Cluster Controller");

    let token = shutdown::signal_token()?;
    let controller = Controller::new(&options).await?;

    match controller.run(token).await? {
        Some(report) => info!(
            "Cluster Controller stopped ({} controllers launched, {} failed, {} panicked)",
            report.launched, report.failed, report.panicked
        ),
        None => info!("Cluster Controller stopped before caches synced"),
    }
    Ok(())
}

/// Help and version requests are not failures.
fn parse_exit_code(e: &clap::Error) -> u8 {
    u8::from(e.use_stderr())
}

/// Reports a fatal setup error and maps the outcome to the process status.
fn exit_code(result: Result<(), ControllerError>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            1
        }
    }
}
