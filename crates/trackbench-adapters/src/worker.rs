//! Supervision of the external tool worker process.
//!
//! The supervisor owns the one worker process per harness run: it
//! spawns the configured command with piped stdio, detects readiness
//! from the output stream on a best-effort basis, surfaces stderr as
//! log output, and terminates the process on stop. Only the supervisor
//! starts or stops the worker; writing to its stdin is the RPC
//! channel's job.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::rpc::RpcChannel;

/// How the worker process is launched.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    /// Executable to spawn.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Working directory for the worker, if any.
    pub working_dir: Option<PathBuf>,
    /// Environment entries layered over the parent environment.
    pub env: HashMap<String, String>,
    /// Regex matched against stdout lines to detect readiness.
    pub ready_pattern: Option<String>,
    /// Grace period after which startup is assumed complete even
    /// without a readiness match.
    pub startup_grace: Duration,
}

impl WorkerCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            ready_pattern: None,
            startup_grace: Duration::from_secs(3),
        }
    }
}

/// Errors fatal to worker startup.
///
/// Only spawn-level problems are fatal; anything the worker prints or
/// does after it is running surfaces through the RPC layer instead.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker is already running")]
    AlreadyRunning,

    #[error("invalid readiness pattern: {0}")]
    ReadyPattern(#[from] regex::Error),

    #[error("worker spawned without a {0} pipe")]
    MissingPipe(&'static str),
}

/// Owns and supervises the worker process.
pub struct WorkerSupervisor {
    config: WorkerCommand,
    child: Option<Child>,
    channel: Option<RpcChannel>,
}

impl WorkerSupervisor {
    pub fn new(config: WorkerCommand) -> Self {
        Self {
            config,
            child: None,
            channel: None,
        }
    }

    /// Launches the worker and waits for readiness.
    ///
    /// Resolves when a readiness marker appears on the worker's stdout
    /// or when the startup grace period elapses, whichever comes first.
    /// Readiness detection is best-effort: the worker's startup
    /// protocol is not fully observable, so callers must treat
    /// post-start failures as possible even after this returns Ok.
    /// Fails only if the process cannot be spawned at all.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        if self.child.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let ready_regex = self
            .config
            .ready_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            command.env(key, value);
        }

        debug!(
            command = %self.config.command,
            args = ?self.config.args,
            cwd = ?self.config.working_dir,
            "Spawning worker process"
        );

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            command: self.config.command.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(SupervisorError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SupervisorError::MissingPipe("stderr"))?;

        // Surface stderr without ever treating it as fatal; worker
        // frameworks routinely log startup chatter there.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "worker", "{line}");
            }
        });

        let (ready_tx, mut ready_rx) = watch::channel(false);
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(target: "worker", "{line}");
                if let Some(re) = &ready_regex
                    && !*ready_tx.borrow()
                    && re.is_match(&line)
                {
                    let _ = ready_tx.send(true);
                }
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        });

        self.channel = Some(RpcChannel::new(stdin, line_rx));
        self.child = Some(child);

        if self.config.ready_pattern.is_some() {
            match tokio::time::timeout(self.config.startup_grace, ready_rx.wait_for(|r| *r)).await
            {
                Ok(Ok(_)) => info!("Worker ready"),
                Ok(Err(_)) => debug!("Worker output closed before a readiness marker"),
                Err(_) => debug!(
                    grace_ms = self.config.startup_grace.as_millis() as u64,
                    "No readiness marker before grace period; continuing"
                ),
            }
        } else {
            tokio::time::sleep(self.config.startup_grace).await;
        }

        Ok(())
    }

    /// Hands out the RPC channel over the worker's stdio.
    ///
    /// Available exactly once per start; the channel owns the write end
    /// of the worker's stdin from then on.
    pub fn take_channel(&mut self) -> Option<RpcChannel> {
        self.channel.take()
    }

    /// True while a started worker has not been stopped.
    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Terminates the worker if one is running; a no-op otherwise.
    ///
    /// Idempotent, and safe to call from the interrupt path as well as
    /// normal cleanup. Sends SIGTERM first and escalates to a hard kill
    /// if the worker does not exit promptly.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        self.channel = None;

        terminate(&child);
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "Worker exited"),
            Ok(Err(e)) => warn!("Failed to reap worker: {e}"),
            Err(_) => {
                warn!("Worker ignored SIGTERM, killing");
                let _ = child.kill().await;
            }
        }
    }
}

/// Sends SIGTERM to the worker process.
#[cfg(unix)]
fn terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid::from_raw(pid as i32);
        debug!(%pid, "Sending SIGTERM to worker");
        let _ = kill(pid, Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(child: &Child) {
    // No SIGTERM off Unix; the follow-up kill in stop() handles it.
    let _ = child;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_worker() -> WorkerCommand {
        // A stand-in worker: announces readiness, then echoes a fixed
        // response for every line it reads.
        let script = r#"
            echo "worker ready"
            while IFS= read -r line; do
                id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
                printf '{"id":%s,"result":{"ok":true}}\n' "$id"
            done
        "#;
        let mut config = WorkerCommand::new("sh");
        config.args = vec!["-c".to_string(), script.to_string()];
        config.ready_pattern = Some("worker ready".to_string());
        config.startup_grace = Duration::from_secs(5);
        config
    }

    #[tokio::test]
    async fn test_start_detects_readiness_and_serves_calls() {
        let mut supervisor = WorkerSupervisor::new(echo_worker());
        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());

        let channel = supervisor.take_channel().unwrap();
        let result = channel
            .call("list_tracks", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["ok"], true);

        supervisor.stop().await;
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_start_resolves_without_marker_after_grace() {
        let mut config = WorkerCommand::new("sh");
        config.args = vec!["-c".to_string(), "sleep 30".to_string()];
        config.ready_pattern = Some("never printed".to_string());
        config.startup_grace = Duration::from_millis(100);

        let mut supervisor = WorkerSupervisor::new(config);
        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_fatal() {
        let mut supervisor =
            WorkerSupervisor::new(WorkerCommand::new("definitely-not-an-executable"));
        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut supervisor = WorkerSupervisor::new(echo_worker());
        supervisor.start().await.unwrap();
        supervisor.stop().await;
        supervisor.stop().await;
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let mut supervisor = WorkerSupervisor::new(echo_worker());
        supervisor.start().await.unwrap();
        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::AlreadyRunning)
        ));
        supervisor.stop().await;
    }
}
