//! One supervisor iteration: negotiate, relay, tear down.

use std::io;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::{channel_events, CommandBridge};
use crate::config::BridgeConfig;
use crate::negotiator::{self, NegotiationError};
use crate::process::ProcessLauncher;
use crate::relay::{self, RelayError, RtpRewriter};
use crate::signaling::Signaling;
use crate::transport::WebRtcTransport;

/// How a session ended when it ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Transport or command channel reached a terminal state.
    Closed,
    /// The offer did not carry the configured codec.
    NoCompatibleCodec,
    /// The supervisor's shutdown token fired.
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to bind RTP listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to fetch offer: {0}")]
    Offer(#[source] roverlink_common::Error),
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("transport setup failed: {0}")]
    Transport(#[from] webrtc::Error),
    #[error("relay failed: {0}")]
    Relay(#[from] RelayError),
}

impl SessionError {
    /// Errors that must stop the program instead of starting a new session.
    ///
    /// A bind failure means another process owns the RTP port, or a previous
    /// session leaked it; retrying cannot fix either.
    pub fn is_fatal_to_program(&self) -> bool {
        matches!(self, SessionError::Bind { .. })
    }
}

/// Resources owned by one negotiated session. The relay socket and the peer
/// connection are released together by [`Session::close`].
struct Session {
    transport: WebRtcTransport,
    socket: Option<UdpSocket>,
    cancel: CancellationToken,
}

impl Session {
    async fn close(&mut self) {
        self.cancel.cancel();
        self.socket.take();
        self.transport.close().await;
    }
}

/// Run one session to completion.
///
/// Every worker started here has exited, and the RTP port is released, by the
/// time this returns.
pub async fn run_session<S>(
    config: &BridgeConfig,
    signaling: &S,
    launcher: Arc<dyn ProcessLauncher>,
    shutdown: &CancellationToken,
) -> Result<SessionOutcome, SessionError>
where
    S: Signaling + ?Sized,
{
    let cancel = shutdown.child_token();

    let socket = relay::bind_rtp_listener(config.rtp_listen, config.rtp_recv_buffer).map_err(
        |source| SessionError::Bind {
            addr: config.rtp_listen,
            source,
        },
    )?;
    info!("RTP listener bound on {}", config.rtp_listen);

    info!("getting new offer...");
    let offer = tokio::select! {
        _ = cancel.cancelled() => return Ok(SessionOutcome::Shutdown),
        offer = signaling.get_offer(&config.session_id) => offer.map_err(SessionError::Offer)?,
    };

    let payload_type = match negotiator::select_codec(&offer.sdp, &config.codec) {
        Ok(pt) => pt,
        Err(NegotiationError::NoCompatibleCodec(codec)) => {
            warn!("offer has no {} codec, waiting for a new offer", codec);
            return Ok(SessionOutcome::NoCompatibleCodec);
        }
        Err(e) => return Err(e.into()),
    };
    info!("negotiated {} as payload type {}", config.codec, payload_type);

    let (events_tx, events_rx) = channel_events();
    let transport =
        WebRtcTransport::new(config, payload_type, cancel.clone(), events_tx).await?;
    let mut session = Session {
        transport,
        socket: Some(socket),
        cancel: cancel.clone(),
    };

    let bridge = CommandBridge::new(launcher, cancel.clone(), config.terminate_grace);
    let bridge_task = tokio::spawn(bridge.run(events_rx));

    let result = drive(&session, config, signaling, &offer, payload_type).await;

    session.close().await;
    if let Err(e) = bridge_task.await {
        warn!("command bridge task failed: {}", e);
    }

    match result {
        Ok(_) if shutdown.is_cancelled() => Ok(SessionOutcome::Shutdown),
        Ok(outcome) => Ok(outcome),
        Err(e) => Err(e),
    }
}

async fn drive<S>(
    session: &Session,
    config: &BridgeConfig,
    signaling: &S,
    offer: &roverlink_common::SessionDescription,
    payload_type: u8,
) -> Result<SessionOutcome, SessionError>
where
    S: Signaling + ?Sized,
{
    let cancel = &session.cancel;
    let transport = &session.transport;

    tokio::select! {
        _ = cancel.cancelled() => return Ok(SessionOutcome::Closed),
        negotiated = negotiator::negotiate(transport, signaling, &config.session_id, offer) => negotiated?,
    }

    if !negotiator::wait_connected(transport, config.connect_poll_interval, cancel).await {
        return Ok(SessionOutcome::Closed);
    }
    info!("transport connected, relaying RTP");

    let Some(socket) = session.socket.as_ref() else {
        return Ok(SessionOutcome::Closed);
    };
    let mut rewriter = RtpRewriter::new(payload_type);
    let stats = relay::run(socket, transport, &mut rewriter, cancel).await?;
    info!(
        "relay finished: {} packets ({} bytes) forwarded, {} dropped",
        stats.packets_forwarded, stats.bytes_forwarded, stats.packets_dropped
    );
    Ok(SessionOutcome::Closed)
}
