//! The controlled child process and its input pipe.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

use crate::config::CommandSpec;

/// A running process driven through its standard input.
#[async_trait]
pub trait ControlledProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Write `data` verbatim to the input pipe.
    async fn write_input(&mut self, data: &[u8]) -> io::Result<()>;

    /// Close the input pipe. Returns `true` only for the call that actually
    /// released it.
    async fn release_input(&mut self) -> bool;

    /// Deliver the termination signal.
    fn terminate(&mut self) -> io::Result<()>;

    /// Wait for the process to exit, killing it once `grace` has elapsed.
    async fn reap(&mut self, grace: Duration);
}

/// Starts the controlled process when a command channel opens.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self) -> io::Result<Box<dyn ControlledProcess>>;
}

/// Launches `CommandSpec` with piped stdin and the host console for output.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    spec: CommandSpec,
}

impl CommandLauncher {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self) -> io::Result<Box<dyn ControlledProcess>> {
        let mut child = Command::new(&self.spec.program)
            .args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "child stdin not piped"))?;

        info!(
            "started {} (pid {:?})",
            self.spec.program.display(),
            child.id()
        );
        Ok(Box::new(ChildProcess {
            child,
            stdin: Some(stdin),
        }))
    }
}

pub struct ChildProcess {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl ControlledProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn write_input(&mut self, data: &[u8]) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "input pipe released"))?;
        stdin.write_all(data).await?;
        stdin.flush().await
    }

    async fn release_input(&mut self) -> bool {
        match self.stdin.take() {
            Some(mut stdin) => {
                if let Err(e) = stdin.shutdown().await {
                    debug!("input pipe shutdown: {}", e);
                }
                true
            }
            None => false,
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            // Already reaped.
            return Ok(());
        };
        send_sigterm(&mut self.child, pid)
    }

    async fn reap(&mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!("controlled process exited: {}", status),
            Ok(Err(e)) => warn!("failed to wait for controlled process: {}", e),
            Err(_) => {
                warn!(
                    "controlled process ignored termination for {:?}, killing",
                    grace
                );
                if let Err(e) = self.child.kill().await {
                    warn!("failed to kill controlled process: {}", e);
                }
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(_child: &mut Child, pid: u32) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child, _pid: u32) -> io::Result<()> {
    child.start_kill()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn shell(script: &str, extra: &[&str]) -> CommandLauncher {
        let mut args = vec!["-c".to_string(), script.to_string()];
        args.extend(extra.iter().map(|s| s.to_string()));
        CommandLauncher::new(CommandSpec {
            program: PathBuf::from("/bin/sh"),
            args,
        })
    }

    #[tokio::test]
    async fn test_child_receives_input_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("received");
        let launcher = shell("cat > \"$0\"", &[out.to_str().unwrap()]);

        let mut child = launcher.launch().unwrap();
        child.write_input(b"w\n").await.unwrap();
        child.write_input(b"a\n").await.unwrap();
        assert!(child.release_input().await);
        assert!(!child.release_input().await);
        child.reap(Duration::from_secs(5)).await;

        assert_eq!(std::fs::read(&out).unwrap(), b"w\na\n");
    }

    #[tokio::test]
    async fn test_terminate_stops_long_running_child() {
        let mut child = shell("sleep 30", &[]).launch().unwrap();
        assert!(child.id().is_some());
        child.terminate().unwrap();
        tokio::time::timeout(Duration::from_secs(5), child.reap(Duration::from_secs(2)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_write_after_release_fails() {
        let mut child = shell("cat > /dev/null", &[]).launch().unwrap();
        child.release_input().await;
        assert!(child.write_input(b"x").await.is_err());
        child.reap(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_missing_executable_fails_to_launch() {
        let launcher = CommandLauncher::new(CommandSpec {
            program: PathBuf::from("/nonexistent/roverlink-child"),
            args: vec![],
        });
        assert!(launcher.launch().is_err());
    }
}
