type Result<T> = color_eyre::eyre::Result<T>;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lntest::cli::{Cli, Config, FailurePolicy};
use lntest::process_supervisor::ProcessSupervisor;
use lntest::scenario;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("lntest starting");

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    let mut supervisor = ProcessSupervisor::new();
    let outcome = scenario::run(&config, &mut supervisor).await;

    match &outcome {
        Ok(()) => info!("scenario complete"),
        Err(err) => {
            error!("scenario failed: {err:#}");
            if config.failure_policy == FailurePolicy::Suspend {
                warn!("suspending with services left running for inspection; Ctrl-C tears down");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }

    let terminated = supervisor.terminate_all();
    if terminated > 0 {
        info!("sent termination signal to {terminated} managed processes");
    }

    info!("lntest exiting");
    outcome
}
