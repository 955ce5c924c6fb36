//! Subprocess channel - owns the child process and its stdio pipes.
//!
//! Flow:
//! 1. Spawn the child with stdin, stdout and stderr piped
//! 2. Forward stderr verbatim to our own stderr (never parsed)
//! 3. Hand stdout to the caller as a stream of decoded messages
//! 4. Monitor exit: log code/signal, mark the channel unavailable
//!
//! The child is never restarted. After it exits every `send` fails.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use serde_json::Value;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::framing::LineJsonCodec;
use crate::health::{ExitInfo, SubprocessStatus};
use crate::stats::RelayStats;

/// Decoded messages from the child's stdout.
pub type MessageStream = FramedRead<ChildStdout, LineJsonCodec>;

/// Destination for relayed requests.
///
/// This abstraction lets the relay service be tested without a real child
/// process.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Write one message. Fails if the process is gone or the pipe is broken.
    async fn send(&self, message: &Value) -> Result<(), ChannelError>;

    fn status(&self) -> SubprocessStatus;

    /// Stop the process and wait for it to exit.
    async fn terminate(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("subprocess exited ({0})")]
    Exited(ExitInfo),
    #[error("failed to write to subprocess: {0}")]
    Write(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{0} not captured")]
    MissingPipe(&'static str),
}

#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Added on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Time between SIGTERM and SIGKILL on terminate.
    pub shutdown_grace: Duration,
}

impl SubprocessConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// Run `command` through a login bash so PATH and profile setup apply.
    pub fn shell(command: &str) -> Self {
        Self::new("bash").with_args(["-lc".to_string(), format!("exec {command}")])
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Live child process: writable stdin plus exit observation.
pub struct SubprocessChannel {
    writer: tokio::sync::Mutex<FramedWrite<ChildStdin, LineJsonCodec>>,
    launched: SubprocessStatus,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    terminate_tx: StdMutex<Option<oneshot::Sender<Duration>>>,
    shutdown_grace: Duration,
}

impl SubprocessChannel {
    /// Launch the child. Returns the channel and its stdout message stream.
    ///
    /// Must run inside a tokio runtime.
    pub fn start(
        config: &SubprocessConfig,
        stats: Arc<RelayStats>,
    ) -> Result<(Self, MessageStream), SpawnError> {
        tracing::info!(program = %config.program, args = ?config.args, "Spawning subprocess");

        let mut child = Command::new(&config.program)
            .args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                program: config.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or(SpawnError::MissingPipe("stderr"))?;

        let pid = child.id();
        tracing::info!(?pid, "Subprocess started");

        tokio::spawn(async move {
            let mut host = tokio::io::stderr();
            if let Err(e) = tokio::io::copy(&mut stderr, &mut host).await {
                tracing::debug!(error = %e, "Stderr forwarding stopped");
            }
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        let (terminate_tx, terminate_rx) = oneshot::channel();
        tokio::spawn(monitor_exit(child, terminate_rx, exit_tx));

        let channel = Self {
            writer: tokio::sync::Mutex::new(FramedWrite::new(stdin, LineJsonCodec::new())),
            launched: SubprocessStatus::running(pid),
            exit_rx,
            terminate_tx: StdMutex::new(Some(terminate_tx)),
            shutdown_grace: config.shutdown_grace,
        };
        let messages = FramedRead::new(stdout, LineJsonCodec::with_stats(stats));

        Ok((channel, messages))
    }

    /// How the child exited, if it has.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit_rx.borrow().clone()
    }

    /// Wait until the child exits.
    pub async fn wait_exited(&self) -> Option<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone(),
            // monitor task is gone; report whatever it last recorded
            Err(_) => self.exit_info(),
        }
    }
}

#[async_trait]
impl MessageSink for SubprocessChannel {
    async fn send(&self, message: &Value) -> Result<(), ChannelError> {
        if let Some(exit) = self.exit_info() {
            return Err(ChannelError::Exited(exit));
        }
        let mut writer = self.writer.lock().await;
        writer.send(message).await?;
        Ok(())
    }

    fn status(&self) -> SubprocessStatus {
        match self.exit_info() {
            Some(exit) => self.launched.clone().exited(exit),
            None => self.launched.clone(),
        }
    }

    async fn terminate(&self) {
        let terminate_tx = match self.terminate_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = terminate_tx
            && tx.send(self.shutdown_grace).is_err()
        {
            tracing::debug!("Exit monitor already finished");
        }
        if let Some(exit) = self.wait_exited().await {
            tracing::info!(%exit, "Subprocess stopped");
        }
    }
}

async fn monitor_exit(
    mut child: Child,
    mut terminate_rx: oneshot::Receiver<Duration>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(grace) = &mut terminate_rx => stop_child(&mut child, grace).await,
    };

    let exit = match status {
        Ok(status) => ExitInfo::from_status(status),
        Err(e) => {
            tracing::error!(error = %e, "Failed to wait for subprocess");
            ExitInfo {
                code: None,
                signal: None,
            }
        }
    };

    if exit.success() {
        tracing::info!(code = ?exit.code, "Subprocess exited");
    } else {
        tracing::error!(
            code = ?exit.code,
            signal = exit.signal.as_deref().unwrap_or("none"),
            "Subprocess exited; new requests will fail until the bridge is restarted"
        );
    }
    exit_tx.send_replace(Some(exit));
}

/// SIGTERM, then SIGKILL if the child outlives `grace`.
async fn stop_child(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        tracing::debug!(pid, "Sending SIGTERM to subprocess");
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => return status,
                Err(_) => {
                    tracing::warn!(
                        grace_ms = grace.as_millis() as u64,
                        "Subprocess ignored SIGTERM, killing"
                    );
                }
            },
            Err(e) => tracing::warn!(error = %e, "Failed to send SIGTERM"),
        }
    }

    child.kill().await?;
    child.wait().await
}
