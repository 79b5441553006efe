//! Command channel handling.
//!
//! Every data channel the peer opens gets its own state machine:
//!
//! - IDLE: announced, not yet open
//! - OPEN: open, controlled process running, no message yet
//! - STREAMING: at least one message written to the process
//! - TERMINATED: closed or failed; pipe released, process signalled
//!
//! Transport callbacks only enqueue [`ChannelEvent`]s. A single
//! [`CommandBridge`] task drains the queue, so close and error for the same
//! channel can never race each other into a double teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::process::{ControlledProcess, ProcessLauncher};

/// Identifies one data channel instance within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub id: u16,
    pub label: String,
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}'-'{}'", self.label, self.id)
    }
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Close,
    Error(String),
}

pub type ChannelEventSender = mpsc::UnboundedSender<(ChannelKey, ChannelEvent)>;
pub type ChannelEventReceiver = mpsc::UnboundedReceiver<(ChannelKey, ChannelEvent)>;

pub fn channel_events() -> (ChannelEventSender, ChannelEventReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Open,
    Streaming,
    Terminated,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is already open")]
    AlreadyOpen(String),
    #[error("channel {0} received a message before opening")]
    NotOpen(String),
    #[error("channel {0} is terminated")]
    Terminated(String),
}

/// Why a channel reached TERMINATED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationCause {
    Closed,
    Failed(String),
    SpawnFailed(String),
    SessionCancelled,
}

/// State machine for one command channel instance.
pub struct CommandChannel {
    key: ChannelKey,
    state: ChannelState,
    process: Option<Box<dyn ControlledProcess>>,
    session: CancellationToken,
    terminate_grace: Duration,
}

impl CommandChannel {
    pub fn new(key: ChannelKey, session: CancellationToken, terminate_grace: Duration) -> Self {
        Self {
            key,
            state: ChannelState::Idle,
            process: None,
            session,
            terminate_grace,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Dispatch one event to the handler for its transition.
    pub async fn handle(
        &mut self,
        event: ChannelEvent,
        launcher: &dyn ProcessLauncher,
    ) -> Result<(), ChannelError> {
        match (self.state, event) {
            (ChannelState::Terminated, _) => Err(ChannelError::Terminated(self.key.to_string())),
            (ChannelState::Idle, ChannelEvent::Open) => {
                self.on_open(launcher).await;
                Ok(())
            }
            (_, ChannelEvent::Open) => Err(ChannelError::AlreadyOpen(self.key.to_string())),
            (ChannelState::Idle, ChannelEvent::Message(_)) => {
                Err(ChannelError::NotOpen(self.key.to_string()))
            }
            (_, ChannelEvent::Message(data)) => {
                self.on_message(data).await;
                Ok(())
            }
            (_, ChannelEvent::Close) => {
                self.terminate(TerminationCause::Closed).await;
                Ok(())
            }
            (_, ChannelEvent::Error(e)) => {
                self.terminate(TerminationCause::Failed(e)).await;
                Ok(())
            }
        }
    }

    /// IDLE -> OPEN
    async fn on_open(&mut self, launcher: &dyn ProcessLauncher) {
        info!("Data channel {} open", self.key);
        match launcher.launch() {
            Ok(process) => {
                self.process = Some(process);
                self.state = ChannelState::Open;
            }
            Err(e) => {
                error!("failed to run command: {}", e);
                self.terminate(TerminationCause::SpawnFailed(e.to_string()))
                    .await;
            }
        }
    }

    /// OPEN/STREAMING -> STREAMING
    async fn on_message(&mut self, data: Bytes) {
        self.state = ChannelState::Streaming;
        let Some(process) = self.process.as_mut() else {
            return;
        };
        if let Err(e) = process.write_input(&data).await {
            warn!("failed to write {} bytes to command input: {}", data.len(), e);
        }
    }

    /// * -> TERMINATED
    ///
    /// Releases the input pipe, signals the process and cancels the owning
    /// session before waiting for the process to exit. Runs at most once per
    /// channel.
    pub async fn terminate(&mut self, cause: TerminationCause) {
        if self.state == ChannelState::Terminated {
            return;
        }
        let was_idle = self.state == ChannelState::Idle;
        self.state = ChannelState::Terminated;

        match &cause {
            TerminationCause::Closed => info!("Data channel {} close", self.key),
            TerminationCause::Failed(e) => warn!("Data channel {} error: {}", self.key, e),
            TerminationCause::SpawnFailed(_) => {
                warn!("Data channel {} has no process, closing transport", self.key)
            }
            TerminationCause::SessionCancelled => {
                debug!("Data channel {} torn down with its session", self.key)
            }
        }
        if was_idle && matches!(cause, TerminationCause::Closed | TerminationCause::Failed(_)) {
            warn!("Data channel {} ended before it was opened", self.key);
        }

        let mut process = self.process.take();
        if let Some(process) = process.as_mut() {
            process.release_input().await;
            if let Err(e) = process.terminate() {
                warn!("failed to signal command process: {}", e);
            }
        }

        // The transport must not outlive the command path while the child exits.
        if cause != TerminationCause::SessionCancelled {
            self.session.cancel();
        }

        if let Some(mut process) = process {
            process.reap(self.terminate_grace).await;
        }
    }
}

/// Serialized consumer of all channel events for one session.
pub struct CommandBridge {
    launcher: Arc<dyn ProcessLauncher>,
    session: CancellationToken,
    terminate_grace: Duration,
    channels: HashMap<ChannelKey, CommandChannel>,
}

impl CommandBridge {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        session: CancellationToken,
        terminate_grace: Duration,
    ) -> Self {
        Self {
            launcher,
            session,
            terminate_grace,
            channels: HashMap::new(),
        }
    }

    /// Drain `events` until the session is cancelled or every sender is gone,
    /// then tear down every channel that is still live.
    pub async fn run(mut self, mut events: ChannelEventReceiver) {
        loop {
            tokio::select! {
                biased;
                _ = self.session.cancelled() => break,
                next = events.recv() => match next {
                    Some((key, event)) => self.dispatch(key, event).await,
                    None => break,
                },
            }
        }

        for channel in self.channels.values_mut() {
            channel.terminate(TerminationCause::SessionCancelled).await;
        }
    }

    async fn dispatch(&mut self, key: ChannelKey, event: ChannelEvent) {
        let channel = self.channels.entry(key.clone()).or_insert_with(|| {
            CommandChannel::new(key, self.session.clone(), self.terminate_grace)
        });
        if let Err(e) = channel.handle(event, self.launcher.as_ref()).await {
            warn!("rejected channel event: {}", e);
        }
        debug!("channel {} now {:?}", channel.key, channel.state());
    }
}
