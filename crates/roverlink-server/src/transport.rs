//! webrtc-rs peer connection wired to the session's cancellation token and
//! the command channel event queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use roverlink_common::SessionDescription;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::command::{ChannelEvent, ChannelEventSender, ChannelKey};
use crate::config::BridgeConfig;
use crate::negotiator::{AnswerTransport, NegotiationError};
use crate::relay::{RtpSink, SinkError};

const VIDEO_CLOCK_RATE: u32 = 90_000;
const RTCP_BUFFER_SIZE: usize = 1500;

/// One negotiated peer connection and its outbound video track.
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticRTP>,
    gathering: Mutex<Option<mpsc::Receiver<()>>>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    /// Build the peer connection for one session.
    ///
    /// `payload_type` is the value the offer uses for the configured codec, so
    /// the answer keeps the peer's own mapping. Terminal connection states
    /// cancel `session`; data channel callbacks feed `channel_events`.
    pub async fn new(
        config: &BridgeConfig,
        payload_type: u8,
        session: CancellationToken,
        channel_events: ChannelEventSender,
    ) -> Result<Self, webrtc::Error> {
        let mime_type = config.video_mime_type();

        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: mime_type.clone(),
                    clock_rate: VIDEO_CLOCK_RATE,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                payload_type,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_network_types(vec![NetworkType::Udp4]);

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let mut rtc_config = RTCConfiguration::default();
        if !config.ice_servers.is_empty() {
            rtc_config.ice_servers = vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }];
        }
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type,
                ..Default::default()
            },
            "video".to_string(),
            "roverlink".to_string(),
        ));
        let rtp_sender =
            attach_track(&pc, Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>).await?;

        // Inbound RTCP has to be read for the interceptors (NACK, reports) to run.
        let rtcp_cancel = session.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; RTCP_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = rtcp_cancel.cancelled() => break,
                    read = rtp_sender.read(&mut rtcp_buf) => {
                        if read.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("RTCP reader finished");
        });

        let ice_cancel = session.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            info!("ICE Connection State has changed {}", state);
            if matches!(
                state,
                RTCIceConnectionState::Failed
                    | RTCIceConnectionState::Disconnected
                    | RTCIceConnectionState::Closed
            ) {
                ice_cancel.cancel();
            }
            Box::pin(async {})
        }));

        let peer_cancel = session.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!("Connection State has changed {}", state);
            if matches!(
                state,
                RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed
            ) {
                peer_cancel.cancel();
            }
            Box::pin(async {})
        }));

        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            info!("signaling State has changed {}", state);
            Box::pin(async {})
        }));

        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = channel_events.clone();
            Box::pin(async move {
                register_channel_events(dc, events);
            })
        }));

        Ok(Self {
            pc,
            track,
            gathering: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Close the peer connection. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            warn!("failed to close peer connection: {}", e);
        }
    }
}

/// Add `track` to `pc`. On failure `pc` is closed before the error is returned.
async fn attach_track(
    pc: &RTCPeerConnection,
    track: Arc<dyn TrackLocal + Send + Sync>,
) -> Result<Arc<RTCRtpSender>, webrtc::Error> {
    match pc.add_track(track).await {
        Ok(sender) => Ok(sender),
        Err(e) => {
            if let Err(close_err) = pc.close().await {
                warn!("failed to close peer connection after add_track error: {}", close_err);
            }
            Err(e)
        }
    }
}

/// Forward every callback of `dc` into the serialized event queue.
fn register_channel_events(dc: Arc<RTCDataChannel>, events: ChannelEventSender) {
    let key = ChannelKey {
        id: dc.id(),
        label: dc.label().to_string(),
    };
    debug!("data channel {} announced", key);

    let (tx, k) = (events.clone(), key.clone());
    dc.on_open(Box::new(move || {
        let _ = tx.send((k.clone(), ChannelEvent::Open));
        Box::pin(async {})
    }));

    let (tx, k) = (events.clone(), key.clone());
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = tx.send((k.clone(), ChannelEvent::Message(msg.data)));
        Box::pin(async {})
    }));

    let (tx, k) = (events.clone(), key.clone());
    dc.on_close(Box::new(move || {
        let _ = tx.send((k.clone(), ChannelEvent::Close));
        Box::pin(async {})
    }));

    dc.on_error(Box::new(move |err: webrtc::Error| {
        let _ = events.send((key.clone(), ChannelEvent::Error(err.to_string())));
        Box::pin(async {})
    }));
}

fn sink_error(e: webrtc::Error) -> SinkError {
    match e {
        webrtc::Error::ErrClosedPipe | webrtc::Error::ErrConnectionClosed => SinkError::Closed,
        e => SinkError::Other(e.to_string()),
    }
}

fn transport_err(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Transport(e.to_string())
}

#[async_trait]
impl AnswerTransport for WebRtcTransport {
    async fn apply_offer(&self, offer: &SessionDescription) -> Result<(), NegotiationError> {
        let offer = RTCSessionDescription::offer(offer.sdp.clone()).map_err(transport_err)?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(transport_err)
    }

    async fn commit_answer(&self) -> Result<(), NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(transport_err)?;
        // The promise has to exist before gathering starts.
        let gathering = self.pc.gathering_complete_promise().await;
        *self.gathering.lock().await = Some(gathering);
        self.pc
            .set_local_description(answer)
            .await
            .map_err(transport_err)
    }

    async fn gathering_complete(&self) -> Result<(), NegotiationError> {
        let mut gathering = self.gathering.lock().await.take().ok_or_else(|| {
            NegotiationError::Transport("answer not committed before gathering".into())
        })?;
        let _ = gathering.recv().await;
        Ok(())
    }

    async fn local_description(&self) -> Result<SessionDescription, NegotiationError> {
        let desc = self.pc.local_description().await.ok_or_else(|| {
            NegotiationError::Transport("no local description after commit".into())
        })?;
        if desc.sdp_type != RTCSdpType::Answer {
            return Err(NegotiationError::Transport(format!(
                "local description is {}, not an answer",
                desc.sdp_type
            )));
        }
        Ok(SessionDescription::answer(desc.sdp))
    }

    fn is_connected(&self) -> bool {
        self.pc.ice_connection_state() == RTCIceConnectionState::Connected
    }
}

#[async_trait]
impl RtpSink for WebRtcTransport {
    async fn write_rtp(&self, packet: &[u8]) -> Result<(), SinkError> {
        self.track.write(packet).await.map(|_| ()).map_err(sink_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::command::channel_events;
    use crate::negotiator::{select_codec, wait_connected};
    use crate::session::tests::test_config;

    fn local_config() -> BridgeConfig {
        let mut config = test_config("127.0.0.1:0".parse().unwrap());
        config.ice_servers.clear();
        config
    }

    async fn remote_peer() -> Arc<RTCPeerConnection> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let registry = register_default_interceptors(Registry::new(), &mut media_engine).unwrap();
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        )
    }

    /// A viewer-side offer: one video transceiver and a `control` data channel.
    async fn remote_offer(remote: &RTCPeerConnection) -> String {
        remote
            .add_transceiver_from_kind(RTPCodecType::Video, None)
            .await
            .unwrap();
        remote.create_data_channel("control", None).await.unwrap();
        let offer = remote.create_offer(None).await.unwrap();
        let mut gathered = remote.gathering_complete_promise().await;
        remote.set_local_description(offer).await.unwrap();
        let _ = gathered.recv().await;
        remote.local_description().await.unwrap().sdp
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_channel_open_is_queued_and_remote_close_cancels_session() {
        let remote = remote_peer().await;
        let offer_sdp = remote_offer(&remote).await;
        let payload_type = select_codec(&offer_sdp, "VP8").unwrap();

        let session = CancellationToken::new();
        let (events_tx, mut events_rx) = channel_events();
        let transport = WebRtcTransport::new(&local_config(), payload_type, session.clone(), events_tx)
            .await
            .unwrap();

        transport
            .apply_offer(&SessionDescription::offer(offer_sdp))
            .await
            .unwrap();
        transport.commit_answer().await.unwrap();
        transport.gathering_complete().await.unwrap();
        let answer = transport.local_description().await.unwrap();
        remote
            .set_remote_description(RTCSessionDescription::answer(answer.sdp).unwrap())
            .await
            .unwrap();

        let (key, event) = tokio::time::timeout(Duration::from_secs(20), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key.label, "control");
        assert!(matches!(event, ChannelEvent::Open));
        assert!(wait_connected(&transport, Duration::from_millis(20), &session).await);
        assert!(!session.is_cancelled());

        remote.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(30), session.cancelled())
            .await
            .unwrap();
        transport.close().await;
    }

    #[tokio::test]
    async fn test_attach_track_failure_leaves_connection_closed() {
        let pc = remote_peer().await;
        pc.close().await.unwrap();
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "roverlink".to_string(),
        ));

        let err = attach_track(&pc, track).await.unwrap_err();
        assert!(matches!(err, webrtc::Error::ErrConnectionClosed));
        assert_eq!(pc.connection_state(), RTCPeerConnectionState::Closed);
    }

    #[test]
    fn test_closed_track_ends_relay_cleanly() {
        assert!(matches!(sink_error(webrtc::Error::ErrClosedPipe), SinkError::Closed));
        assert!(matches!(
            sink_error(webrtc::Error::ErrConnectionClosed),
            SinkError::Closed
        ));
        assert!(matches!(
            sink_error(webrtc::Error::new("srtp failure".to_string())),
            SinkError::Other(_)
        ));
    }
}
