//! Local RTP listener and the forwarding loop into the negotiated track.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use webrtc::rtp::header::Header;
use webrtc::util::Unmarshal;

/// Largest datagram read from the local source (UDP MTU plus slack).
pub const MAX_RTP_PACKET_SIZE: usize = 1600;

const RTP_VERSION: u8 = 2;
const RTP_FIXED_HEADER_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("not an RTP packet: {0}")]
    Malformed(String),
    #[error("RTP receive failed: {0}")]
    Receive(#[source] io::Error),
    #[error("track write failed: {0}")]
    Write(String),
}

/// Outcome of a single write into the outbound track.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The track or its transport has been closed; relaying ends normally.
    #[error("sink closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Destination of rewritten packets.
#[async_trait]
pub trait RtpSink: Send + Sync {
    async fn write_rtp(&self, packet: &[u8]) -> Result<(), SinkError>;
}

/// Bind the local RTP listener with an enlarged receive buffer.
///
/// Address reuse stays off, so a port still held by a previous session is a
/// bind error.
pub fn bind_rtp_listener(addr: SocketAddr, recv_buffer: usize) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_recv_buffer_size(recv_buffer)?;
    match socket.recv_buffer_size() {
        Ok(actual) if actual < recv_buffer => {
            warn!(
                "RTP receive buffer capped at {} bytes (requested {})",
                actual, recv_buffer
            );
        }
        Ok(_) => {}
        Err(e) => debug!("failed to read back RTP receive buffer size: {}", e),
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Header fields of a packet after rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeaderInfo {
    pub ssrc: u32,
    pub payload_type: u8,
    pub sequence_number: u16,
}

/// Pins every forwarded packet to one stream identity and the negotiated
/// payload type. The payload itself is never touched.
///
/// The rewritten header is what an [`RtpSink`] receives. The webrtc-rs track
/// behind `WebRtcTransport` stamps its own binding SSRC and payload type on
/// the wire, so there the pinned SSRC is only seen by logs; the outbound stream
/// still keeps a single identity for the whole session.
#[derive(Debug)]
pub struct RtpRewriter {
    payload_type: u8,
    ssrc: Option<u32>,
}

impl RtpRewriter {
    pub fn new(payload_type: u8) -> Self {
        Self {
            payload_type: payload_type & 0x7f,
            ssrc: None,
        }
    }

    /// Stream identity learned from the first packet, if any arrived yet.
    pub fn ssrc(&self) -> Option<u32> {
        self.ssrc
    }

    /// Rewrite the header of `packet` in place.
    pub fn rewrite(&mut self, packet: &mut [u8]) -> Result<RtpHeaderInfo, RelayError> {
        if packet.len() < RTP_FIXED_HEADER_LEN {
            return Err(RelayError::Malformed(format!(
                "{} bytes is shorter than the fixed header",
                packet.len()
            )));
        }
        let header = Header::unmarshal(&mut &packet[..])
            .map_err(|e| RelayError::Malformed(e.to_string()))?;
        if header.version != RTP_VERSION {
            return Err(RelayError::Malformed(format!(
                "unsupported version {}",
                header.version
            )));
        }

        let ssrc = *self.ssrc.get_or_insert_with(|| {
            info!("outbound stream SSRC {} (from first packet)", header.ssrc);
            header.ssrc
        });

        // Marker bit shares the byte with the payload type.
        packet[1] = (packet[1] & 0x80) | self.payload_type;
        packet[8..12].copy_from_slice(&ssrc.to_be_bytes());

        Ok(RtpHeaderInfo {
            ssrc,
            payload_type: self.payload_type,
            sequence_number: header.sequence_number,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub packets_forwarded: u64,
    pub bytes_forwarded: u64,
    pub packets_dropped: u64,
}

/// Forward packets from `socket` into `sink` in arrival order until the sink
/// closes or `cancel` fires.
///
/// A closed sink or cancellation ends the loop cleanly. Any other receive or
/// write failure is returned and ends the session.
pub async fn run<K>(
    socket: &UdpSocket,
    sink: &K,
    rewriter: &mut RtpRewriter,
    cancel: &CancellationToken,
) -> Result<RelayStats, RelayError>
where
    K: RtpSink + ?Sized,
{
    let mut buf = vec![0u8; MAX_RTP_PACKET_SIZE];
    let mut stats = RelayStats::default();

    loop {
        let len = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("relay cancelled");
                return Ok(stats);
            }
            recv = socket.recv_from(&mut buf) => match recv {
                Ok((len, _)) => len,
                Err(e) => return Err(RelayError::Receive(e)),
            },
        };

        let packet = &mut buf[..len];
        let header = match rewriter.rewrite(packet) {
            Ok(header) => header,
            Err(e) => {
                stats.packets_dropped += 1;
                debug!("dropping inbound datagram: {}", e);
                continue;
            }
        };
        trace!(
            "forwarding seq {} ssrc {} pt {}",
            header.sequence_number,
            header.ssrc,
            header.payload_type
        );

        match sink.write_rtp(packet).await {
            Ok(()) => {
                stats.packets_forwarded += 1;
                stats.bytes_forwarded += len as u64;
            }
            Err(SinkError::Closed) => {
                info!("outbound track closed, relay finished");
                return Ok(stats);
            }
            Err(SinkError::Other(e)) => return Err(RelayError::Write(e)),
        }
    }
}
