//! Restarts sessions until shutdown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::BridgeConfig;
use crate::process::ProcessLauncher;
use crate::session::{run_session, SessionError, SessionOutcome};
use crate::signaling::Signaling;

pub struct Supervisor<S: ?Sized> {
    config: Arc<BridgeConfig>,
    signaling: Arc<S>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl<S> Supervisor<S>
where
    S: Signaling + ?Sized,
{
    pub fn new(
        config: Arc<BridgeConfig>,
        signaling: Arc<S>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            config,
            signaling,
            launcher,
        }
    }

    /// Run sessions back to back. Each one starts only after the previous one
    /// has released its port and workers.
    ///
    /// Returns `Ok` once `shutdown` fires, or the first error that cannot be
    /// fixed by starting over.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SessionError> {
        let mut iteration: u64 = 0;
        while !shutdown.is_cancelled() {
            iteration += 1;
            let span = info_span!("session", iteration, id = %self.config.session_id);

            let result = run_session(
                &self.config,
                self.signaling.as_ref(),
                Arc::clone(&self.launcher),
                &shutdown,
            )
            .instrument(span)
            .await;

            let back_off = match result {
                Ok(SessionOutcome::Shutdown) => break,
                Ok(SessionOutcome::Closed) => {
                    info!("session {} closed", iteration);
                    false
                }
                Ok(SessionOutcome::NoCompatibleCodec) => true,
                Err(e) if e.is_fatal_to_program() => return Err(e),
                Err(e) => {
                    warn!("session {} failed: {}", iteration, e);
                    true
                }
            };
            if back_off && !self.config.retry_delay.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }
        }
        info!("supervisor stopped after {} sessions", iteration);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::command::tests::FakeLauncher;
    use crate::negotiator::tests::H264_ONLY_OFFER;
    use crate::session::tests::{test_config, StaticOffer};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sessions_restart_on_the_same_port() {
        let free = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = free.local_addr().unwrap();
        drop(free);

        let signaling = Arc::new(StaticOffer::new(H264_ONLY_OFFER));
        let launcher = Arc::new(FakeLauncher::new());
        let effects = launcher.effects.clone();
        let supervisor = Supervisor::new(
            Arc::new(test_config(addr)),
            Arc::clone(&signaling),
            launcher,
        );

        let shutdown = CancellationToken::new();
        let watcher = {
            let signaling = Arc::clone(&signaling);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                while signaling.requests.load(Ordering::SeqCst) < 3 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                shutdown.cancel();
            })
        };

        tokio::time::timeout(Duration::from_secs(5), supervisor.run(shutdown))
            .await
            .unwrap()
            .unwrap();
        watcher.await.unwrap();

        assert!(signaling.requests.load(Ordering::SeqCst) >= 3);
        assert_eq!(effects.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_default_config_retries_back_to_back() {
        use clap::Parser;

        use crate::config::Args;

        let free = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = free.local_addr().unwrap().port().to_string();
        drop(free);
        let args = Args::parse_from([
            "roverlink-server",
            "--rtp-bind",
            "127.0.0.1",
            "--rtp-port",
            port.as_str(),
        ]);
        let config = BridgeConfig::from_args(args).unwrap();
        assert!(config.retry_delay.is_zero());

        let signaling = Arc::new(StaticOffer::new(H264_ONLY_OFFER));
        let supervisor = Supervisor::new(
            Arc::new(config),
            Arc::clone(&signaling),
            Arc::new(FakeLauncher::new()),
        );

        let shutdown = CancellationToken::new();
        let watcher = {
            let signaling = Arc::clone(&signaling);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                while signaling.requests.load(Ordering::SeqCst) < 20 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                shutdown.cancel();
            })
        };

        let started = std::time::Instant::now();
        supervisor.run(shutdown).await.unwrap();
        watcher.await.unwrap();

        assert!(signaling.requests.load(Ordering::SeqCst) >= 20);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_bind_failure_stops_supervisor() {
        let holder = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let signaling = Arc::new(StaticOffer::new(H264_ONLY_OFFER));
        let supervisor = Supervisor::new(
            Arc::new(test_config(holder.local_addr().unwrap())),
            Arc::clone(&signaling),
            Arc::new(FakeLauncher::new()),
        );

        let err = supervisor.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::Bind { .. }));
        assert_eq!(signaling.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_runs_nothing() {
        let signaling = Arc::new(StaticOffer::new(H264_ONLY_OFFER));
        let supervisor = Supervisor::new(
            Arc::new(test_config("127.0.0.1:0".parse().unwrap())),
            Arc::clone(&signaling),
            Arc::new(FakeLauncher::new()),
        );
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        supervisor.run(shutdown).await.unwrap();
        assert_eq!(signaling.requests.load(Ordering::SeqCst), 0);
    }
}
