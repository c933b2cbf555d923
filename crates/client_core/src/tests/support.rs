//! In-memory worker processes for driving the supervisor and bridge in tests.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::domain::ProcessKind;
use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::mpsc,
};

use crate::launcher::{LaunchSpec, LaunchedWorker, WorkerExit, WorkerLauncher};

const PIPE_CAPACITY: usize = 256 * 1024;

/// Test-side ends of one fake worker's pipes.
pub struct FakeWorker {
    pub kind: ProcessKind,
    pub spec: LaunchSpec,
    pub stdin: DuplexStream,
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
    exit_tx: mpsc::UnboundedSender<Option<i32>>,
}

impl FakeWorker {
    pub async fn say(&mut self, text: &str) {
        self.stdout
            .write_all(text.as_bytes())
            .await
            .expect("write fake stdout");
    }

    pub async fn complain(&mut self, text: &str) {
        self.stderr
            .write_all(text.as_bytes())
            .await
            .expect("write fake stderr");
    }

    pub async fn read_input(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.stdin
            .read_exact(&mut buf)
            .await
            .expect("read fake stdin");
        buf
    }

    pub fn exit(&self, code: Option<i32>) {
        let _ = self.exit_tx.send(code);
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.spec
            .env
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Default)]
pub struct FakeLauncher {
    workers: Mutex<Vec<FakeWorker>>,
    spawned: AtomicUsize,
    kills: Arc<AtomicUsize>,
    failing: Mutex<Vec<ProcessKind>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_kind(&self, kind: ProcessKind) {
        self.failing.lock().expect("failing lock").push(kind);
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Takes the oldest not-yet-taken worker of `kind`.
    pub fn take(&self, kind: ProcessKind) -> FakeWorker {
        let mut workers = self.workers.lock().expect("workers lock");
        let index = workers
            .iter()
            .position(|worker| worker.kind == kind)
            .unwrap_or_else(|| panic!("no {kind} worker was launched"));
        workers.remove(index)
    }
}

impl WorkerLauncher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker> {
        if self
            .failing
            .lock()
            .expect("failing lock")
            .contains(&spec.kind)
        {
            return Err(anyhow!("{} not found", spec.program.display()));
        }

        let (worker_stdin, test_stdin) = duplex(PIPE_CAPACITY);
        let (worker_stdout, test_stdout) = duplex(PIPE_CAPACITY);
        let (worker_stderr, test_stderr) = duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let pid = self.spawned.fetch_add(1, Ordering::SeqCst) as u32 + 1000;
        self.workers.lock().expect("workers lock").push(FakeWorker {
            kind: spec.kind,
            spec: spec.clone(),
            stdin: test_stdin,
            stdout: test_stdout,
            stderr: test_stderr,
            exit_tx: exit_tx.clone(),
        });

        Ok(LaunchedWorker {
            pid: Some(pid),
            stdin: Some(Box::new(worker_stdin)),
            stdout: Some(Box::new(worker_stdout)),
            stderr: Some(Box::new(worker_stderr)),
            exit: Box::new(FakeExit {
                exit_tx,
                exit_rx,
                kills: Arc::clone(&self.kills),
            }),
        })
    }
}

struct FakeExit {
    exit_tx: mpsc::UnboundedSender<Option<i32>>,
    exit_rx: mpsc::UnboundedReceiver<Option<i32>>,
    kills: Arc<AtomicUsize>,
}

#[async_trait]
impl WorkerExit for FakeExit {
    async fn wait(&mut self) -> Option<i32> {
        self.exit_rx.recv().await.flatten()
    }

    async fn kill(&mut self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        let _ = self.exit_tx.send(None);
    }
}
