use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use snapsync::cli::Cli;
use snapsync::{logging, BtrfsDriver, Config, RunState, SubvolumeDriver};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.json;

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("snapsync: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init(&config.log) {
        eprintln!("snapsync: {:#}", e);
        return ExitCode::FAILURE;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        mode = if config.server { "server" } else { "client" },
        "snapsync starting"
    );

    match run(config, json).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, json: bool) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted; finishing the current step and stopping");
                cancel.cancel();
            }
        });
    }

    let driver: Arc<dyn SubvolumeDriver> = Arc::new(BtrfsDriver::new());

    if config.server {
        snapsync::run_server(&config, driver, cancel)
            .await
            .context("server failed")?;
        return Ok(ExitCode::SUCCESS);
    }

    let report = snapsync::run_backup(&config, driver, cancel)
        .await
        .with_context(|| format!("backup of {} failed", config.subvolume.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("cannot serialize report")?
        );
    }

    Ok(match report.state {
        RunState::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}
