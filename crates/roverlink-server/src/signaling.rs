//! Offer/answer exchange with the remote peer.
//!
//! The peer posts its offer under a session id; the bridge long-polls for it
//! and posts the answer back once negotiation has finished locally.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use roverlink_common::{Error, Result, SdpKind, SessionDescription};
use tracing::debug;

/// Signaling collaborator consumed by the negotiator.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Wait until the peer has posted an offer for `session_id`.
    ///
    /// May block for an arbitrary time; callers bound it with their own
    /// cancellation.
    async fn get_offer(&self, session_id: &str) -> Result<SessionDescription>;

    /// Hand the finished answer to the peer.
    async fn publish_answer(&self, session_id: &str, answer: &SessionDescription) -> Result<()>;
}

/// HTTP client for the session description exchange.
pub struct HttpExchange {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl HttpExchange {
    pub fn new(base_url: impl Into<String>, poll_interval: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("roverlink/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::signaling(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval,
        })
    }

    fn offer_url(&self, session_id: &str) -> String {
        format!("{}/sessions/{}/offer", self.base_url, session_id)
    }

    fn answer_url(&self, session_id: &str) -> String {
        format!("{}/sessions/{}/answer", self.base_url, session_id)
    }
}

#[async_trait]
impl Signaling for HttpExchange {
    async fn get_offer(&self, session_id: &str) -> Result<SessionDescription> {
        let url = self.offer_url(session_id);
        loop {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| Error::signaling(format!("GET {url}: {e}")))?;

            match resp.status() {
                StatusCode::OK => {
                    let desc = resp
                        .json::<SessionDescription>()
                        .await
                        .map_err(|e| Error::serialization(format!("offer body: {e}")))?;
                    return desc.expect_kind(SdpKind::Offer);
                }
                StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => {
                    debug!("no offer posted for session {} yet", session_id);
                    tokio::time::sleep(self.poll_interval).await;
                }
                status => {
                    return Err(Error::signaling(format!(
                        "GET {url} failed with status {status}"
                    )));
                }
            }
        }
    }

    async fn publish_answer(&self, session_id: &str, answer: &SessionDescription) -> Result<()> {
        let url = self.answer_url(session_id);
        let resp = self
            .client
            .post(&url)
            .json(answer)
            .send()
            .await
            .map_err(|e| Error::signaling(format!("POST {url}: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::signaling(format!(
                "POST {url} failed with status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, State};
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    #[derive(Default)]
    struct Exchange {
        offer_polls: AtomicUsize,
        ready_after: usize,
        answers: Mutex<Vec<(String, SessionDescription)>>,
    }

    async fn serve(exchange: Arc<Exchange>) -> String {
        async fn offer(
            State(ex): State<Arc<Exchange>>,
            Path(id): Path<String>,
        ) -> std::result::Result<Json<SessionDescription>, HttpStatus> {
            let polls = ex.offer_polls.fetch_add(1, Ordering::SeqCst) + 1;
            if id != "demo" || polls <= ex.ready_after {
                return Err(HttpStatus::NOT_FOUND);
            }
            Ok(Json(SessionDescription::offer("v=0\r\n")))
        }

        async fn answer(
            State(ex): State<Arc<Exchange>>,
            Path(id): Path<String>,
            Json(desc): Json<SessionDescription>,
        ) -> HttpStatus {
            ex.answers.lock().unwrap().push((id, desc));
            HttpStatus::CREATED
        }

        let app = Router::new()
            .route("/sessions/:id/offer", get(offer))
            .route("/sessions/:id/answer", post(answer))
            .with_state(exchange);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn test_get_offer_polls_until_posted() {
        let exchange = Arc::new(Exchange {
            ready_after: 2,
            ..Default::default()
        });
        let base = serve(exchange.clone()).await;
        let client = HttpExchange::new(base, Duration::from_millis(10)).unwrap();

        let offer = client.get_offer("demo").await.unwrap();
        assert_eq!(offer, SessionDescription::offer("v=0\r\n"));
        assert_eq!(exchange.offer_polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_publish_answer_posts_description() {
        let exchange = Arc::new(Exchange::default());
        let base = serve(exchange.clone()).await;
        let client = HttpExchange::new(base, Duration::from_millis(10)).unwrap();

        client
            .publish_answer("demo", &SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();
        let answers = exchange.answers.lock().unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].0, "demo");
        assert_eq!(answers[0].1.kind, SdpKind::Answer);
    }

    #[tokio::test]
    async fn test_unreachable_exchange_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpExchange::new(format!("http://{addr}"), Duration::from_millis(10)).unwrap();
        let err = client.get_offer("demo").await.unwrap_err();
        assert!(matches!(err, Error::Signaling(_)));
    }
}
