//! Command-line surface and the immutable configuration built from it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use roverlink_common::helpers::split_args;
use roverlink_common::{is_valid_session_id, Error, Result};

pub const DEFAULT_RTP_PORT: u16 = 5004;
pub const DEFAULT_RTP_RECV_BUFFER: usize = 300 * 1024;
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun.webrtc.ecl.ntt.com:3478",
    "stun:stun.cloudflare.com:3478",
];

#[derive(Parser, Debug)]
#[command(name = "roverlink-server")]
#[command(about = "Relays a local RTP stream to a WebRTC peer and drives a process from its data channel")]
pub struct Args {
    /// Session ID shared with the remote peer through the signaling service
    #[arg(long, env = "ROVERLINK_SESSION", default_value = "test")]
    pub session: String,

    /// Executable spawned when the command channel opens
    #[arg(short = 'c', long = "command", env = "ROVERLINK_COMMAND", default_value = "../mibot")]
    pub command: PathBuf,

    /// Argument string passed to the executable (split on whitespace)
    #[arg(long = "arg", env = "ROVERLINK_COMMAND_ARGS", default_value = "", allow_hyphen_values = true)]
    pub command_args: String,

    /// Local UDP port the RTP source sends to
    #[arg(long, env = "ROVERLINK_RTP_PORT", default_value_t = DEFAULT_RTP_PORT)]
    pub rtp_port: u16,

    /// Local address the RTP listener binds to
    #[arg(long, env = "ROVERLINK_RTP_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub rtp_bind: IpAddr,

    /// Video codec name the local encoder produces (VP8, VP9, H264, ...)
    #[arg(long, env = "ROVERLINK_CODEC", default_value = "VP8")]
    pub codec: String,

    /// Base URL of the signaling exchange
    #[arg(long, env = "ROVERLINK_SIGNALING_URL", default_value = "http://127.0.0.1:8080")]
    pub signaling_url: String,

    /// STUN/TURN server URL (repeatable)
    #[arg(long = "stun", env = "ROVERLINK_STUN", value_delimiter = ',')]
    pub stun: Vec<String>,

    /// Receive buffer requested for the RTP listener, in bytes
    #[arg(long, default_value_t = DEFAULT_RTP_RECV_BUFFER)]
    pub rtp_recv_buffer: usize,

    /// Interval between checks for the connected transport state
    #[arg(long, default_value_t = 1_000)]
    pub connect_poll_ms: u64,

    /// Interval between polls for an offer that has not been posted yet
    #[arg(long, default_value_t = 1_000)]
    pub offer_poll_ms: u64,

    /// Optional pause before asking again after a rejected offer or a failed
    /// session (0 retries immediately)
    #[arg(long, env = "ROVERLINK_RETRY_DELAY_MS", default_value_t = 0)]
    pub retry_delay_ms: u64,

    /// Time the child process gets to exit after the termination signal
    #[arg(long, default_value_t = 3_000)]
    pub terminate_grace_ms: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Program and arguments of the controlled process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Validated runtime configuration. Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub session_id: String,
    pub command: CommandSpec,
    pub rtp_listen: SocketAddr,
    pub rtp_recv_buffer: usize,
    pub codec: String,
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    pub connect_poll_interval: Duration,
    pub offer_poll_interval: Duration,
    pub retry_delay: Duration,
    pub terminate_grace: Duration,
}

impl BridgeConfig {
    pub fn from_args(args: Args) -> Result<Self> {
        if !is_valid_session_id(&args.session) {
            return Err(Error::config(format!(
                "--session {:?} must be non-empty and contain only [A-Za-z0-9._-]",
                args.session
            )));
        }
        let codec = args.codec.trim();
        if codec.is_empty() || codec.contains('/') {
            return Err(Error::config("--codec must be a bare codec name such as VP8"));
        }
        if args.command.as_os_str().is_empty() {
            return Err(Error::config("--command must not be empty"));
        }
        if args.rtp_recv_buffer == 0 {
            return Err(Error::config("--rtp-recv-buffer must be at least 1"));
        }
        if args.connect_poll_ms == 0 || args.offer_poll_ms == 0 {
            return Err(Error::config("poll intervals must be at least 1ms"));
        }
        let signaling_url = args.signaling_url.trim_end_matches('/').to_string();
        let parsed = reqwest::Url::parse(&signaling_url)
            .map_err(|e| Error::config(format!("--signaling-url {signaling_url:?}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::config("--signaling-url must use http:// or https://"));
        }

        let ice_servers: Vec<String> = if args.stun.is_empty() {
            DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
        } else {
            args.stun
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };
        if ice_servers.is_empty() {
            return Err(Error::config("at least one --stun server is required"));
        }

        Ok(Self {
            session_id: args.session,
            command: CommandSpec {
                program: args.command,
                args: split_args(&args.command_args),
            },
            rtp_listen: SocketAddr::new(args.rtp_bind, args.rtp_port),
            rtp_recv_buffer: args.rtp_recv_buffer,
            codec: codec.to_string(),
            signaling_url,
            ice_servers,
            connect_poll_interval: Duration::from_millis(args.connect_poll_ms),
            offer_poll_interval: Duration::from_millis(args.offer_poll_ms),
            retry_delay: Duration::from_millis(args.retry_delay_ms),
            terminate_grace: Duration::from_millis(args.terminate_grace_ms),
        })
    }

    /// MIME type registered with the media engine for the configured codec.
    pub fn video_mime_type(&self) -> String {
        format!("video/{}", self.codec)
    }
}
