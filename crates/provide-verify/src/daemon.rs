//! Node process boundary.
//!
//! The node is started once with both output channels piped. A waiter task
//! owns the child and publishes its exit status on a watch channel, so the
//! supervisor and the shutdown path can observe the same exit without
//! racing for `Child::wait`.

use crate::error::{Result, VerifyError};
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// How to start the node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeCommand {
    /// Executable.
    pub program: PathBuf,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
}

impl NodeCommand {
    /// Command running `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable, replacing an earlier value of the same name.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.env.retain(|(k, _)| *k != key);
        self.env.push((key, value.into()));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Program and arguments as one string, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Exit status of the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeExit {
    /// Exit code, absent when killed by a signal.
    pub code: Option<i32>,
    /// Human-readable status.
    pub description: String,
}

impl NodeExit {
    fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            description: status.to_string(),
        }
    }

    /// The waiter went away without publishing a status.
    pub fn unobserved() -> Self {
        Self {
            code: None,
            description: "exit status not observed".to_string(),
        }
    }
}

impl fmt::Display for NodeExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

/// The node's two output channels.
#[derive(Debug)]
pub struct NodeStreams {
    /// Readiness channel.
    pub stdout: ChildStdout,
    /// Diagnostic channel.
    pub stderr: ChildStderr,
}

/// A running node process.
#[derive(Debug)]
pub struct NodeProcess {
    program: String,
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<NodeExit>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl NodeProcess {
    /// Start the node with piped output channels.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Spawn`] if the process cannot be started.
    pub fn spawn(command: &NodeCommand) -> Result<(Self, NodeStreams)> {
        let program = command.program.display().to_string();
        let spawn_error = |reason: String| VerifyError::Spawn {
            program: program.clone(),
            reason,
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_error("stderr was not captured".to_string()))?;
        let pid = child.id();
        info!("Started {} (pid {:?})", command.display(), pid);

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        debug!("Kill failed: {}", e);
                    }
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => NodeExit::from_status(status),
                Err(e) => NodeExit {
                    code: None,
                    description: format!("wait failed: {e}"),
                },
            };
            debug!("Node exited: {}", exit);
            let _ = exit_tx.send(Some(exit));
        });

        Ok((
            Self {
                program,
                pid,
                exit_rx,
                kill_tx: Some(kill_tx),
            },
            NodeStreams { stdout, stderr },
        ))
    }

    /// Receiver that turns `Some` once the process has exited.
    pub fn exit_receiver(&self) -> watch::Receiver<Option<NodeExit>> {
        self.exit_rx.clone()
    }

    /// Exit status, if the process has already exited.
    pub fn try_exit(&self) -> Option<NodeExit> {
        self.exit_rx.borrow().clone()
    }

    /// Stop the process: SIGTERM, then SIGKILL after `grace`.
    ///
    /// Safe to call repeatedly; later calls return the recorded exit.
    pub async fn shutdown(&mut self, grace: Duration) -> NodeExit {
        if let Some(exit) = self.try_exit() {
            self.kill_tx = None;
            return exit;
        }

        if self.terminate() {
            match tokio::time::timeout(grace, wait_exit(self.exit_rx.clone())).await {
                Ok(exit) => {
                    info!("{} stopped: {}", self.program, exit);
                    self.kill_tx = None;
                    return exit;
                }
                Err(_) => warn!(
                    "{} did not stop within {:?}, killing it",
                    self.program, grace
                ),
            }
        }

        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        let exit = wait_exit(self.exit_rx.clone()).await;
        info!("{} killed: {}", self.program, exit);
        exit
    }

    #[cfg(unix)]
    fn terminate(&self) -> bool {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return false;
        };
        #[allow(clippy::cast_possible_wrap)]
        let target = Pid::from_raw(pid as i32);
        match kill(target, Signal::SIGTERM) {
            Ok(()) => {
                debug!("Sent SIGTERM to pid {}", pid);
                true
            }
            Err(e) => {
                debug!("SIGTERM to pid {} failed: {}", pid, e);
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> bool {
        false
    }
}

/// Resolve once `rx` holds an exit, immediately if it already does.
pub(crate) async fn wait_exit(mut rx: watch::Receiver<Option<NodeExit>>) -> NodeExit {
    loop {
        if let Some(exit) = rx.borrow_and_update().clone() {
            return exit;
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone().unwrap_or_else(NodeExit::unobserved);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> NodeCommand {
        NodeCommand::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn test_command_builder() {
        let cmd = NodeCommand::new("ipfs")
            .args(["daemon", "--offline"])
            .env("GOLOG_LOG_LEVEL", "info")
            .env("GOLOG_LOG_LEVEL", "dht=debug");
        assert_eq!(cmd.display(), "ipfs daemon --offline");
        assert_eq!(
            cmd.env,
            vec![("GOLOG_LOG_LEVEL".to_string(), "dht=debug".to_string())]
        );
    }

    #[tokio::test]
    async fn test_exit_status_is_published() {
        let (node, mut streams) = NodeProcess::spawn(&sh("echo out; echo err >&2; exit 3")).unwrap();

        let mut out = String::new();
        streams.stdout.read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        streams.stderr.read_to_string(&mut err).await.unwrap();

        let exit = wait_exit(node.exit_receiver()).await;
        assert_eq!(exit.code, Some(3));
        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");
        assert_eq!(node.try_exit(), Some(exit));
    }

    #[tokio::test]
    async fn test_env_and_cwd_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = sh("echo \"$MARKER $(pwd)\"")
            .env("MARKER", "hello")
            .current_dir(dir.path());
        let (node, mut streams) = NodeProcess::spawn(&cmd).unwrap();

        let mut out = String::new();
        streams.stdout.read_to_string(&mut out).await.unwrap();
        wait_exit(node.exit_receiver()).await;

        assert!(out.starts_with("hello "));
        let reported = std::path::Path::new(out.trim_end().trim_start_matches("hello "));
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_shutdown_terminates_and_is_idempotent() {
        let (mut node, _streams) = NodeProcess::spawn(&sh("exec sleep 30")).unwrap();
        assert!(node.try_exit().is_none());

        let first = node.shutdown(Duration::from_secs(5)).await;
        assert_eq!(first.code, None);
        let second = node.shutdown(Duration::from_secs(5)).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_shutdown_escalates_to_kill() {
        let (mut node, _streams) =
            NodeProcess::spawn(&sh("trap '' TERM; while :; do sleep 1; done")).unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let exit = node.shutdown(Duration::from_millis(300)).await;
        assert_eq!(exit.code, None);
        assert!(node.try_exit().is_some());
    }

    #[tokio::test]
    async fn test_missing_program_is_a_spawn_error() {
        let err = NodeProcess::spawn(&NodeCommand::new("/nonexistent/provide-node")).unwrap_err();
        assert!(matches!(err, VerifyError::Spawn { .. }));
    }
}
