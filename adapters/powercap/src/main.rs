use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use runmeter::{adapter::AdapterServer, measurement::PowerKind};
use tokio_util::sync::CancellationToken;

mod powercap;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command line arguments.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// The address to listen on, for example `127.0.0.1:50600`.
    #[arg(long, default_value = "127.0.0.1:50600")]
    listen: String,

    /// Interval between two readings of the energy counters.
    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// Root of the powercap zones.
    #[arg(long, default_value = powercap::POWERCAP_RAPL_PATH)]
    root: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    log::info!("Starting runmeter powercap adapter v{VERSION}");
    let args = Args::parse();

    let zones = powercap::power_zones(&args.root)
        .with_context(|| format!("could not list the power zones in {:?}", args.root))?;
    let mut opened = powercap::open_all(&zones)?;
    let sources: Vec<String> = zones.iter().map(|z| z.source_id.clone()).collect();
    log::info!("Found {} power zones: {sources:?}", sources.len());

    let cancel_token = CancellationToken::new();
    let server = AdapterServer::bind(args.listen.as_str(), "powercap", sources, cancel_token.clone())
        .await
        .with_context(|| format!("could not listen on {}", args.listen))?;
    log::info!("Listening on {}", server.local_addr()?);
    let publisher = server.publisher();
    let server_task = tokio::spawn(server.accept_loop());

    let ctrl_c_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {e}");
            return;
        }
        log::info!("Ctrl+C received, stopping");
        ctrl_c_token.cancel();
    });

    let mut ticker = tokio::time::interval(args.interval);
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                for zone in &mut opened {
                    match zone.read_joules() {
                        Ok(joules) => {
                            publisher.publish_now(&zone.source_id, joules, PowerKind::Joules);
                        }
                        Err(e) => log::warn!("failed to read {}: {e:#}", zone.source_id),
                    }
                }
            }
        }
    }

    server_task.await.context("the server task panicked")??;
    log::info!("Powercap adapter has stopped.");
    Ok(())
}
