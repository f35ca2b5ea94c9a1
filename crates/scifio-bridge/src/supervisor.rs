//! Worker process lifecycle: spawn, handshake, liveness, stop.
//!
//! The worker's stdin/stdout carry the protocol; stderr is drained into
//! tracing so a chatty JVM can never fill the pipe and stall.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;

use crate::channel::LineChannel;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::CommandProtocol;
use crate::version::VersionInfo;

/// Protocol over a live worker's pipes.
pub type WorkerProtocol = CommandProtocol<ChildStdout, ChildStdin>;

/// Stderr lines kept for launch diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// How long `stop` waits for stderr forwarding to drain after exit.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// A worker that completed its handshake.
pub struct WorkerReady {
    pub supervisor: ProcessSupervisor,
    pub protocol: WorkerProtocol,
    pub version: Option<String>,
}

pub struct ProcessSupervisor {
    child: Child,
    pid: Option<u32>,
    stop_grace: Duration,
    stopped: bool,
    exit_status: Option<ExitStatus>,
    stderr_tail: StderrTail,
    stderr_task: Option<JoinHandle<()>>,
}

impl ProcessSupervisor {
    /// Spawn the worker and wait for its `ready` line.
    ///
    /// On any failure the worker is stopped before the error is returned.
    pub async fn start(config: &BridgeConfig) -> Result<WorkerReady> {
        let program = config.launch.program.display().to_string();
        tracing::info!(program = %program, args = ?config.launch.args, "Spawning worker");

        let mut child = config
            .launch
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::ProcessLaunch(format!("{program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::ProcessLaunch("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::ProcessLaunch("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::ProcessLaunch("stderr not captured".to_string()))?;

        let stderr_tail: StderrTail =
            Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = tokio::spawn(forward_stderr(stderr, Arc::clone(&stderr_tail)));

        let mut supervisor = Self {
            pid: child.id(),
            child,
            stop_grace: config.stop_grace,
            stopped: false,
            exit_status: None,
            stderr_tail,
            stderr_task: Some(stderr_task),
        };

        let mut protocol = CommandProtocol::new(
            LineChannel::new(stdout, stdin),
            config.error_marker.clone(),
            config.read_timeout,
        );

        tracing::debug!(pid = ?supervisor.pid, "Waiting for worker handshake");
        match protocol.handshake(config.handshake_timeout).await {
            Ok(version) => {
                tracing::info!(
                    pid = ?supervisor.pid,
                    versions = %VersionInfo::from_handshake(version.clone()),
                    "Worker ready"
                );
                Ok(WorkerReady {
                    supervisor,
                    protocol,
                    version,
                })
            }
            Err(e) => {
                drop(protocol);
                supervisor.stop().await;
                let e = match e {
                    BridgeError::ProcessLaunch(message) => {
                        BridgeError::ProcessLaunch(supervisor.with_stderr_tail(message))
                    }
                    other => other,
                };
                tracing::error!(error = %e, "Worker failed to start");
                Err(e)
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Non-blocking liveness check; records the exit status if the worker
    /// has gone.
    pub fn is_alive(&mut self) -> bool {
        if self.stopped || self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::warn!(pid = ?self.pid, %status, "Worker exited unexpectedly");
                self.exit_status = Some(status);
                false
            }
            Err(e) => {
                tracing::warn!(pid = ?self.pid, error = %e, "Failed to poll worker status");
                false
            }
        }
    }

    /// Terminate and reap the worker.
    ///
    /// Sends SIGTERM (Unix), waits up to the grace period, then kills.
    /// Calling it again returns the recorded status without touching the
    /// process.
    pub async fn stop(&mut self) -> Option<ExitStatus> {
        if self.stopped {
            return self.exit_status;
        }
        self.stopped = true;

        if self.exit_status.is_none() {
            self.exit_status = match self.child.try_wait() {
                Ok(Some(status)) => Some(status),
                _ => self.terminate().await,
            };
        }
        tracing::info!(pid = ?self.pid, status = ?self.exit_status, "Worker stopped");

        if let Some(task) = self.stderr_task.take()
            && tokio::time::timeout(STDERR_DRAIN, task).await.is_err()
        {
            tracing::debug!("Worker stderr still open after exit");
        }
        self.exit_status
    }

    async fn terminate(&mut self) -> Option<ExitStatus> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.child.id() {
                tracing::debug!(pid, "Sending SIGTERM to worker");
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    tracing::debug!(pid, error = %e, "SIGTERM failed");
                }
                let waited = tokio::time::timeout(self.stop_grace, self.child.wait()).await;
                if let Ok(Ok(status)) = waited {
                    return Some(status);
                }
                tracing::warn!(pid, grace = ?self.stop_grace, "Worker ignored SIGTERM, killing");
            }
        }

        if let Err(e) = self.child.kill().await {
            tracing::warn!(pid = ?self.pid, error = %e, "Failed to kill worker");
        }
        self.child.try_wait().ok().flatten()
    }

    /// Recent stderr lines, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        match self.stderr_tail.lock() {
            Ok(tail) => tail.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn with_stderr_tail(&self, message: String) -> String {
        let tail = self.stderr_tail();
        if tail.is_empty() {
            message
        } else {
            format!("{message}; worker stderr:\n{}", tail.join("\n"))
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if !self.stopped {
            tracing::warn!(pid = ?self.pid, "Worker dropped without stop, killing");
        }
    }
}

async fn forward_stderr(stderr: ChildStderr, tail: StderrTail) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                tracing::info!(target: "scifio::worker", "{}", line);
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Worker stderr read failed");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::LaunchSpec;

    fn shell(script: &str) -> BridgeConfig {
        BridgeConfig::new(LaunchSpec::new("/bin/sh").with_arg("-c").with_arg(script))
            .with_handshake_timeout(Duration::from_secs(10))
            .with_stop_grace(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn handshake_returns_worker_version() {
        let config = shell("echo 'JVM warming up'; echo 'ready 9.9'; exec cat >/dev/null");
        let WorkerReady {
            mut supervisor,
            protocol,
            version,
        } = ProcessSupervisor::start(&config).await.unwrap();

        assert_eq!(version.as_deref(), Some("9.9"));
        assert!(supervisor.pid().is_some());
        assert!(supervisor.is_alive());

        drop(protocol);
        let first = supervisor.stop().await;
        assert!(first.is_some());
        assert!(!supervisor.is_alive());
        assert_eq!(supervisor.stop().await, first);
    }

    #[tokio::test]
    async fn exit_before_ready_reports_stderr() {
        let config = shell("echo 'Error: Could not find or load main class' >&2; exit 1");
        let err = ProcessSupervisor::start(&config).await.err().unwrap();
        match err {
            BridgeError::ProcessLaunch(message) => {
                assert!(message.contains("Could not find or load main class"), "{message}")
            }
            other => panic!("expected launch failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_launch_failure() {
        let config = BridgeConfig::new(LaunchSpec::new("/nonexistent/scifio-worker"));
        let err = ProcessSupervisor::start(&config).await.err().unwrap();
        assert!(matches!(err, BridgeError::ProcessLaunch(_)));
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let config = shell("exec sleep 30").with_handshake_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = ProcessSupervisor::start(&config).await.err().unwrap();
        assert!(matches!(err, BridgeError::HandshakeTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn notices_worker_exit() {
        let config = shell("echo ready; exit 3");
        let WorkerReady { mut supervisor, .. } = ProcessSupervisor::start(&config).await.unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while supervisor.is_alive() {
            assert!(std::time::Instant::now() < deadline, "worker never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(supervisor.exit_status().and_then(|s| s.code()), Some(3));
        assert_eq!(supervisor.stop().await.and_then(|s| s.code()), Some(3));
    }

    #[tokio::test]
    async fn stderr_tail_is_bounded() {
        let config = shell(
            "i=0; while [ $i -lt 50 ]; do echo line$i >&2; i=$((i+1)); done; echo ready; exec cat >/dev/null",
        );
        let WorkerReady {
            mut supervisor,
            protocol,
            ..
        } = ProcessSupervisor::start(&config).await.unwrap();
        drop(protocol);
        supervisor.stop().await;

        let tail = supervisor.stderr_tail();
        assert_eq!(tail.len(), STDERR_TAIL_LINES);
        assert_eq!(tail.last().map(String::as_str), Some("line49"));
    }
}
