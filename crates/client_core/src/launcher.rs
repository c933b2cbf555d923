//! Spawning of worker executables behind a trait seam.

use std::{path::PathBuf, process::Stdio, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::ProcessKind;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    process::{Child, Command},
};
use tracing::{debug, warn};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub kind: ProcessKind,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Output substring that marks the worker as ready. `None` means ready once spawned.
    pub ready_marker: Option<String>,
    /// Longest wait for `ready_marker` before the worker is assumed ready.
    pub settle_delay: Duration,
}

impl LaunchSpec {
    pub fn new(kind: ProcessKind, program: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            ready_marker: None,
            settle_delay: Duration::ZERO,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn ready_marker(mut self, marker: impl Into<String>, settle_delay: Duration) -> Self {
        self.ready_marker = Some(marker.into());
        self.settle_delay = settle_delay;
        self
    }
}

pub struct LaunchedWorker {
    pub pid: Option<u32>,
    pub stdin: Option<BoxedWriter>,
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
    pub exit: Box<dyn WorkerExit>,
}

#[async_trait]
pub trait WorkerExit: Send {
    /// Resolves when the process has exited, with its exit code when it has one.
    async fn wait(&mut self) -> Option<i32>;
    /// Requests termination. Completion is still observed through `wait`.
    async fn kill(&mut self);
}

pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker>;
}

/// Launches real OS processes with piped stdio.
pub struct TokioWorkerLauncher;

impl WorkerLauncher for TokioWorkerLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", spec.program.display()))?;
        let pid = child.id();
        debug!(kind = %spec.kind, ?pid, program = %spec.program.display(), "worker spawned");

        let stdin = child
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as BoxedWriter);
        let stdout = child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as BoxedReader);
        let stderr = child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as BoxedReader);

        Ok(LaunchedWorker {
            pid,
            stdin,
            stdout,
            stderr,
            exit: Box::new(ChildExit {
                kind: spec.kind,
                child,
            }),
        })
    }
}

struct ChildExit {
    kind: ProcessKind,
    child: Child,
}

#[async_trait]
impl WorkerExit for ChildExit {
    async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(err) => {
                warn!(kind = %self.kind, %err, "failed to wait for worker exit");
                None
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(err) = self.child.start_kill() {
            warn!(kind = %self.kind, %err, "failed to signal worker");
        }
    }
}
