#![forbid(unsafe_code)]

//! Roverlink bridge.
//!
//! Answers WebRTC offers for one session, relays the RTP video arriving on a
//! local UDP port to the peer, and drives a local command through the peer's
//! data channel. A fresh session is negotiated whenever the previous one ends.

mod command;
mod config;
mod negotiator;
mod process;
mod relay;
mod session;
mod signaling;
mod supervisor;
mod transport;

use std::future::Future;
use std::io;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Args, BridgeConfig};
use crate::process::CommandLauncher;
use crate::signaling::HttpExchange;
use crate::supervisor::Supervisor;

fn main() -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    roverlink_common::init_tracing_with_default(&format!(
        "{},webrtc=warn,webrtc_ice=warn,webrtc_mdns=warn,hyper=warn",
        args.log_level
    ));
    info!("Starting roverlink-server v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(BridgeConfig::from_args(args).context("invalid configuration")?);
    info!(
        "session '{}', command {}, RTP on {}, codec {}",
        config.session_id,
        config.command.program.display(),
        config.rtp_listen,
        config.codec
    );

    let signaling = Arc::new(
        HttpExchange::new(&config.signaling_url, config.offer_poll_interval)
            .context("failed to build signaling client")?,
    );
    let launcher = Arc::new(CommandLauncher::new(config.command.clone()));

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_interrupt(
        tokio::signal::ctrl_c(),
        shutdown.clone(),
    ));

    Supervisor::new(config, signaling, launcher)
        .run(shutdown)
        .await
        .context("bridge stopped")?;

    info!("roverlink-server stopped");
    Ok(())
}

/// Cancel `shutdown` once `interrupt` fires. If the handler could not be
/// installed the bridge keeps running and can only be stopped externally.
async fn cancel_on_interrupt<F>(interrupt: F, shutdown: CancellationToken)
where
    F: Future<Output = io::Result<()>>,
{
    match interrupt.await {
        Ok(()) => {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
        Err(e) => error!("failed to listen for interrupt, Ctrl-C is disabled: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interrupt_cancels_shutdown() {
        let shutdown = CancellationToken::new();
        cancel_on_interrupt(std::future::ready(Ok(())), shutdown.clone()).await;
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_interrupt_handler_keeps_running() {
        let shutdown = CancellationToken::new();
        let failed = std::future::ready(Err(io::Error::new(io::ErrorKind::Other, "no signal driver")));
        cancel_on_interrupt(failed, shutdown.clone()).await;
        assert!(!shutdown.is_cancelled());
    }
}
