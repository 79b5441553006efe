//! Offer/answer negotiation with the remote peer.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use roverlink_common::SessionDescription;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webrtc::sdp::description::session::SessionDescription as ParsedSdp;

use crate::signaling::Signaling;

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("offer does not declare codec {0}")]
    NoCompatibleCodec(String),
    #[error("unparseable offer: {0}")]
    InvalidOffer(String),
    #[error("transport rejected negotiation step: {0}")]
    Transport(String),
    #[error(transparent)]
    Signaling(#[from] roverlink_common::Error),
}

/// The negotiation-facing side of a transport session.
///
/// `commit_answer` finalizes the local description and starts candidate
/// gathering; `gathering_complete` resolves once gathering has finished.
#[async_trait]
pub trait AnswerTransport: Send + Sync {
    async fn apply_offer(&self, offer: &SessionDescription) -> Result<(), NegotiationError>;
    async fn commit_answer(&self) -> Result<(), NegotiationError>;
    async fn gathering_complete(&self) -> Result<(), NegotiationError>;
    async fn local_description(&self) -> Result<SessionDescription, NegotiationError>;
    fn is_connected(&self) -> bool;
}

/// Find the payload type the offer uses for `codec`.
///
/// Only video sections are considered and the offer's own format order wins
/// when several payload types map to the same codec.
pub fn select_codec(offer_sdp: &str, codec: &str) -> Result<u8, NegotiationError> {
    let parsed = ParsedSdp::unmarshal(&mut Cursor::new(offer_sdp.as_bytes()))
        .map_err(|e| NegotiationError::InvalidOffer(e.to_string()))?;

    for media in parsed
        .media_descriptions
        .iter()
        .filter(|m| m.media_name.media.eq_ignore_ascii_case("video"))
    {
        let rtpmaps: Vec<(&str, &str)> = media
            .attributes
            .iter()
            .filter(|a| a.key == "rtpmap")
            .filter_map(|a| a.value.as_deref())
            .filter_map(parse_rtpmap)
            .collect();

        for format in &media.media_name.formats {
            let matched = rtpmaps
                .iter()
                .any(|(pt, name)| *pt == format.as_str() && name.eq_ignore_ascii_case(codec));
            if matched {
                if let Ok(pt) = format.parse::<u8>() {
                    if pt < 128 {
                        return Ok(pt);
                    }
                }
            }
        }
    }

    Err(NegotiationError::NoCompatibleCodec(codec.to_string()))
}

/// Split an `a=rtpmap` value (`96 VP8/90000`) into payload type and codec name.
fn parse_rtpmap(value: &str) -> Option<(&str, &str)> {
    let (pt, encoding) = value.trim().split_once(' ')?;
    let name = encoding.split('/').next()?;
    Some((pt, name.trim()))
}

/// Run the answerer side of the exchange.
///
/// The answer is published only after the local description is committed and
/// gathering has completed; an early answer would hand the peer an incomplete
/// candidate set.
pub async fn negotiate<T, S>(
    transport: &T,
    signaling: &S,
    session_id: &str,
    offer: &SessionDescription,
) -> Result<(), NegotiationError>
where
    T: AnswerTransport + ?Sized,
    S: Signaling + ?Sized,
{
    transport.apply_offer(offer).await?;

    info!("create answer");
    transport.commit_answer().await?;
    transport.gathering_complete().await?;
    debug!("candidate gathering complete");

    let answer = transport.local_description().await?;
    info!("send answer");
    signaling.publish_answer(session_id, &answer).await?;
    Ok(())
}

/// Poll until the transport reports a connected state.
///
/// Returns `false` if `cancel` fires first.
pub async fn wait_connected<T>(transport: &T, interval: Duration, cancel: &CancellationToken) -> bool
where
    T: AnswerTransport + ?Sized,
{
    loop {
        if transport.is_connected() {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
