use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rtc_probe::cli::{Cli, Command};
use rtc_probe::config::ProbeConfig;
use rtc_probe::peer::Peer;
use rtc_probe::probe::{
    BandwidthTransfer, LatencyProbe, ProbeChannel, ReceiveMeter, StopSignal, TransferError,
    TransferReport,
};
use rtc_probe::telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ProbeConfig::from_args(&cli.connect, &cli.workload)?;
    init_tracing(&config.log_filter);

    info!(
        role = %config.label,
        signal_url = %config.signal_url,
        command = ?cli.command,
        retry_offer = config.retry_offer,
        ice_servers = config.ice_servers.len(),
        "starting rtc-probe"
    );

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, stopping");
                stop.stop();
            }
        });
    }

    let peer = tokio::select! {
        peer = Peer::connect(&config) => peer.context("failed to establish peer session")?,
        _ = stop.stopped() => return Ok(()),
    };
    let channels = peer.channels().clone();
    let probe_channel = ProbeChannel::spawn(peer.label(), Arc::clone(&channels.unordered));
    let meter = ReceiveMeter::spawn(peer.label(), Arc::clone(&channels.ordered));

    let outcome = match cli.command {
        Command::Listen => {
            stop.stopped().await;
            Ok(())
        }
        Command::Ping => {
            let report = LatencyProbe::new(probe_channel.clone(), config.probe_options())
                .run(&stop)
                .await;
            println!("{report}");
            Ok(())
        }
        Command::Bandwidth => run_transfer(&peer, &config, &stop).await.map(|report| {
            if let Some(report) = report {
                println!("{report}");
            }
        }),
        Command::All => {
            let probe = LatencyProbe::new(probe_channel.clone(), config.probe_options());
            let ping_stop = StopSignal::new();
            let ping = async {
                let report = probe.run(&ping_stop).await;
                println!("{report}");
            };
            // The transfer returns on Ctrl-C as well, so it alone ends the ping.
            let transfer = async {
                let result = run_transfer(&peer, &config, &stop).await;
                ping_stop.stop();
                result
            };
            let (_, result) = tokio::join!(ping, transfer);
            result.map(|report| {
                if let Some(report) = report {
                    println!("{report}");
                }
            })
        }
    };

    let received = meter.summary();
    info!(role = %peer.label(), messages = received.messages, bytes = received.bytes, "received on reliable channel");
    probe_channel.shutdown();
    if let Err(err) = peer.close().await {
        warn!(role = %peer.label(), error = %err, "peer close failed");
    }
    outcome.context("bandwidth transfer failed")
}

/// `None` when interrupted before completion.
async fn run_transfer(
    peer: &Peer,
    config: &ProbeConfig,
    stop: &StopSignal,
) -> Result<Option<TransferReport>, TransferError> {
    let transfer = BandwidthTransfer::start(
        peer.label(),
        Arc::clone(&peer.channels().ordered),
        config.transfer_bytes,
    )
    .await?;
    tokio::select! {
        result = transfer.run() => result.map(Some),
        _ = stop.stopped() => Ok(None),
    }
}
