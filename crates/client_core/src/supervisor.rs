//! Lifecycle of the room server and room client worker processes.
//!
//! The supervisor is driven from a single dispatch context. Background tasks
//! (stream readers, exit watchers, timers) never touch its state; they post
//! [`SupervisorEvent`]s that the owner feeds back through
//! [`Supervisor::handle_event`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    domain::{HandleId, ProcessHandle, ProcessKind, ProcessState},
    protocol::{OutboundCommand, ReadyVia},
};
use thiserror::Error;
use tokio::{
    io::AsyncReadExt,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    encoder,
    framing::FrameReassembler,
    launcher::{BoxedReader, LaunchSpec, WorkerExit, WorkerLauncher},
    writer::{PendingWrite, StdinWriter, WriteError},
};

const READ_CHUNK_BYTES: usize = 64 * 1024;
/// How long an exit watcher waits for stream readers to drain before reporting the exit.
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {kind} worker '{program}': {reason}")]
    SpawnFailed {
        kind: ProcessKind,
        program: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug)]
pub enum SupervisorEvent {
    Output {
        kind: ProcessKind,
        id: HandleId,
        stream: StreamKind,
        chunk: Vec<u8>,
    },
    StreamClosed {
        kind: ProcessKind,
        id: HandleId,
        stream: StreamKind,
    },
    Exited {
        kind: ProcessKind,
        id: HandleId,
        code: Option<i32>,
    },
    SettleElapsed {
        kind: ProcessKind,
        id: HandleId,
    },
    GraceElapsed {
        kind: ProcessKind,
        id: HandleId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorNotice {
    Ready {
        kind: ProcessKind,
        via: ReadyVia,
    },
    Record {
        kind: ProcessKind,
        stream: StreamKind,
        record: String,
    },
    Stopped {
        kind: ProcessKind,
        forced: bool,
        exit_code: Option<i32>,
    },
    Crashed {
        kind: ProcessKind,
        exit_code: Option<i32>,
    },
}

struct ManagedProcess {
    handle: ProcessHandle,
    writer: Option<StdinWriter>,
    kill_tx: Option<oneshot::Sender<()>>,
    ready_marker: Option<String>,
    stdout_frames: FrameReassembler,
    stderr_frames: FrameReassembler,
}

impl ManagedProcess {
    fn frames(&mut self, stream: StreamKind) -> &mut FrameReassembler {
        match stream {
            StreamKind::Stdout => &mut self.stdout_frames,
            StreamKind::Stderr => &mut self.stderr_frames,
        }
    }

    /// Sends the one termination request this instance will ever get.
    fn request_kill(&mut self) -> bool {
        match self.kill_tx.take() {
            Some(kill_tx) => {
                let _ = kill_tx.send(());
                true
            }
            None => false,
        }
    }
}

pub struct Supervisor {
    launcher: Arc<dyn WorkerLauncher>,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    processes: HashMap<HandleId, ManagedProcess>,
    current: HashMap<ProcessKind, HandleId>,
    next_id: u64,
    grace_period: Duration,
}

impl Supervisor {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        grace_period: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                launcher,
                events_tx,
                processes: HashMap::new(),
                current: HashMap::new(),
                next_id: 1,
                grace_period,
            },
            events_rx,
        )
    }

    /// Starts a worker of `spec.kind`, or returns the live handle if one is
    /// already Starting or Running.
    pub fn start(&mut self, spec: &LaunchSpec) -> Result<ProcessHandle, SupervisorError> {
        let kind = spec.kind;
        if let Some(existing) = self.current_process(kind) {
            if existing.handle.state.is_active() {
                debug!(%kind, id = existing.handle.id.0, "worker already active; reusing handle");
                return Ok(existing.handle.clone());
            }
            // A stopping instance keeps being tracked until it exits, but no
            // longer occupies the slot.
            debug!(%kind, id = existing.handle.id.0, "replacing stopping worker");
            self.current.remove(&kind);
        }

        let launched = self
            .launcher
            .launch(spec)
            .map_err(|err| SupervisorError::SpawnFailed {
                kind,
                program: spec.program.display().to_string(),
                reason: format!("{err:#}"),
            })?;

        let id = HandleId(self.next_id);
        self.next_id += 1;

        let state = if spec.ready_marker.is_some() {
            ProcessState::Starting
        } else {
            ProcessState::Running
        };
        let handle = ProcessHandle {
            id,
            kind,
            state,
            pid: launched.pid,
            started_at: Utc::now(),
        };

        let writer = launched
            .stdin
            .map(|stdin| StdinWriter::spawn(kind, stdin).0);

        let mut readers = Vec::new();
        if let Some(stdout) = launched.stdout {
            readers.push(spawn_reader(
                kind,
                id,
                StreamKind::Stdout,
                stdout,
                self.events_tx.clone(),
            ));
        }
        if let Some(stderr) = launched.stderr {
            readers.push(spawn_reader(
                kind,
                id,
                StreamKind::Stderr,
                stderr,
                self.events_tx.clone(),
            ));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        spawn_exit_watcher(
            kind,
            id,
            launched.exit,
            kill_rx,
            readers,
            self.events_tx.clone(),
        );

        if spec.ready_marker.is_some() {
            let events_tx = self.events_tx.clone();
            let settle_delay = spec.settle_delay;
            tokio::spawn(async move {
                tokio::time::sleep(settle_delay).await;
                let _ = events_tx.send(SupervisorEvent::SettleElapsed { kind, id });
            });
        }

        info!(%kind, id = id.0, pid = ?handle.pid, ?state, "worker started");
        self.processes.insert(
            id,
            ManagedProcess {
                handle: handle.clone(),
                writer,
                kill_tx: Some(kill_tx),
                ready_marker: spec.ready_marker.clone(),
                stdout_frames: FrameReassembler::new(),
                stderr_frames: FrameReassembler::new(),
            },
        );
        self.current.insert(kind, id);
        Ok(handle)
    }

    /// Graceful: write `/exit`, then kill if still alive after the grace
    /// period. Forced: kill now. No-op when nothing of `kind` is running.
    pub fn stop(&mut self, kind: ProcessKind, graceful: bool) {
        let grace_period = self.grace_period;
        let events_tx = self.events_tx.clone();
        let Some(process) = self.current_process_mut(kind) else {
            debug!(%kind, "stop requested with no worker running");
            return;
        };
        let id = process.handle.id;

        match (process.handle.state, graceful) {
            (ProcessState::StoppingForced, _) | (ProcessState::StoppingGraceful, true) => {
                debug!(%kind, id = id.0, "worker already stopping");
            }
            (_, true) => {
                process.handle.state = ProcessState::StoppingGraceful;
                match (&process.writer, encoder::encode(&OutboundCommand::Exit)) {
                    (Some(writer), Ok(bytes)) => {
                        if let Err(err) = writer.submit(bytes) {
                            warn!(%kind, id = id.0, %err, "could not deliver exit command");
                        }
                    }
                    (None, _) => warn!(%kind, id = id.0, "worker has no input pipe for exit command"),
                    (_, Err(err)) => warn!(%kind, %err, "failed to encode exit command"),
                }
                info!(%kind, id = id.0, grace_ms = grace_period.as_millis() as u64, "graceful stop requested");
                tokio::spawn(async move {
                    tokio::time::sleep(grace_period).await;
                    let _ = events_tx.send(SupervisorEvent::GraceElapsed { kind, id });
                });
            }
            (_, false) => {
                process.handle.state = ProcessState::StoppingForced;
                process.request_kill();
                info!(%kind, id = id.0, "forced stop requested");
            }
        }
    }

    /// App-quit path: best-effort `/exit` to every worker, then kill them all.
    pub fn shutdown(&mut self) {
        for process in self.processes.values_mut() {
            if let (Some(writer), Ok(bytes)) = (
                &process.writer,
                encoder::encode(&OutboundCommand::Exit),
            ) {
                let _ = writer.submit(bytes);
            }
            process.handle.state = ProcessState::StoppingForced;
            process.request_kill();
        }
        self.current.clear();
    }

    pub fn write(&self, kind: ProcessKind, bytes: Vec<u8>) -> Result<PendingWrite, WriteError> {
        let writer = self
            .current_process(kind)
            .filter(|process| process.handle.state.is_active())
            .and_then(|process| process.writer.as_ref())
            .ok_or(WriteError::WriteAfterExit { kind })?;
        writer.submit(bytes)
    }

    pub fn is_running(&self, kind: ProcessKind) -> bool {
        self.state(kind) == ProcessState::Running
    }

    pub fn state(&self, kind: ProcessKind) -> ProcessState {
        self.current_process(kind)
            .map(|process| process.handle.state)
            .unwrap_or(ProcessState::NotStarted)
    }

    pub fn handle(&self, kind: ProcessKind) -> Option<ProcessHandle> {
        self.current_process(kind)
            .map(|process| process.handle.clone())
    }

    /// True once no worker instance, current or retiring, is tracked.
    pub fn is_idle(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn handle_event(&mut self, event: SupervisorEvent) -> Vec<SupervisorNotice> {
        match event {
            SupervisorEvent::Output {
                kind,
                id,
                stream,
                chunk,
            } => self.on_output(kind, id, stream, &chunk),
            SupervisorEvent::StreamClosed { kind, id, stream } => {
                if let Some(process) = self.processes.get_mut(&id) {
                    if let Some(partial) = process.frames(stream).take_partial() {
                        warn!(
                            %kind,
                            id = id.0,
                            ?stream,
                            bytes = partial.len(),
                            "discarding unterminated record at end of stream"
                        );
                    }
                }
                Vec::new()
            }
            SupervisorEvent::SettleElapsed { kind, id } => {
                match self.processes.get_mut(&id) {
                    Some(process) if process.handle.state == ProcessState::Starting => {
                        process.handle.state = ProcessState::Running;
                        warn!(
                            %kind,
                            id = id.0,
                            "no readiness line within settle delay; assuming worker is ready"
                        );
                        vec![SupervisorNotice::Ready {
                            kind,
                            via: ReadyVia::SettleDelay,
                        }]
                    }
                    _ => Vec::new(),
                }
            }
            SupervisorEvent::GraceElapsed { kind, id } => {
                if let Some(process) = self.processes.get_mut(&id) {
                    if process.handle.state == ProcessState::StoppingGraceful {
                        warn!(%kind, id = id.0, "worker did not exit within grace period; killing");
                        process.handle.state = ProcessState::StoppingForced;
                        process.request_kill();
                    }
                }
                Vec::new()
            }
            SupervisorEvent::Exited { kind, id, code } => self.on_exit(kind, id, code),
        }
    }

    fn on_output(
        &mut self,
        kind: ProcessKind,
        id: HandleId,
        stream: StreamKind,
        chunk: &[u8],
    ) -> Vec<SupervisorNotice> {
        let is_current = self.current.get(&kind) == Some(&id);
        let Some(process) = self.processes.get_mut(&id) else {
            trace!(%kind, id = id.0, "output from untracked worker dropped");
            return Vec::new();
        };

        let records: Vec<String> = process.frames(stream).feed(chunk).collect();
        // Retiring instances belong to a finished session; their lines are
        // logged and never surface as records.
        if !is_current || !process.handle.state.is_active() {
            for record in records {
                debug!(%kind, id = id.0, ?stream, %record, "output from retiring worker");
            }
            return Vec::new();
        }
        let mut notices = Vec::with_capacity(records.len());
        for record in records {
            let marker_seen = process.handle.state == ProcessState::Starting
                && process
                    .ready_marker
                    .as_deref()
                    .is_some_and(|marker| record.contains(marker));
            if marker_seen {
                process.handle.state = ProcessState::Running;
                info!(%kind, id = id.0, "worker reported ready");
                notices.push(SupervisorNotice::Ready {
                    kind,
                    via: ReadyVia::Marker,
                });
            }
            notices.push(SupervisorNotice::Record {
                kind,
                stream,
                record,
            });
        }
        notices
    }

    fn on_exit(
        &mut self,
        kind: ProcessKind,
        id: HandleId,
        exit_code: Option<i32>,
    ) -> Vec<SupervisorNotice> {
        let Some(mut process) = self.processes.remove(&id) else {
            trace!(%kind, id = id.0, "exit from untracked worker ignored");
            return Vec::new();
        };
        if self.current.get(&kind) == Some(&id) {
            self.current.remove(&kind);
        }

        let previous = process.handle.state;
        if previous.is_stopping() {
            process.handle.state = ProcessState::Stopped;
            let forced = previous == ProcessState::StoppingForced;
            info!(%kind, id = id.0, ?exit_code, forced, "worker stopped");
            vec![SupervisorNotice::Stopped {
                kind,
                forced,
                exit_code,
            }]
        } else {
            process.handle.state = ProcessState::Crashed;
            warn!(%kind, id = id.0, ?exit_code, ?previous, "worker exited unexpectedly");
            vec![SupervisorNotice::Crashed { kind, exit_code }]
        }
    }

    fn current_process(&self, kind: ProcessKind) -> Option<&ManagedProcess> {
        self.current
            .get(&kind)
            .and_then(|id| self.processes.get(id))
    }

    fn current_process_mut(&mut self, kind: ProcessKind) -> Option<&mut ManagedProcess> {
        let id = *self.current.get(&kind)?;
        self.processes.get_mut(&id)
    }
}

fn spawn_reader(
    kind: ProcessKind,
    id: HandleId,
    stream: StreamKind,
    mut reader: BoxedReader,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let event = SupervisorEvent::Output {
                        kind,
                        id,
                        stream,
                        chunk: buf[..n].to_vec(),
                    };
                    if events_tx.send(event).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(%kind, id = id.0, ?stream, %err, "worker stream read failed");
                    break;
                }
            }
        }
        let _ = events_tx.send(SupervisorEvent::StreamClosed { kind, id, stream });
    })
}

enum WatchOutcome {
    Exited(Option<i32>),
    KillRequested,
}

fn spawn_exit_watcher(
    kind: ProcessKind,
    id: HandleId,
    mut exit: Box<dyn WorkerExit>,
    kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
) {
    tokio::spawn(async move {
        // A dropped kill sender also counts as a kill request.
        let outcome = tokio::select! {
            code = exit.wait() => WatchOutcome::Exited(code),
            _ = kill_rx => WatchOutcome::KillRequested,
        };
        let code = match outcome {
            WatchOutcome::Exited(code) => code,
            WatchOutcome::KillRequested => {
                exit.kill().await;
                exit.wait().await
            }
        };

        // Output must reach the dispatch queue before the exit does.
        for reader in readers {
            if tokio::time::timeout(STREAM_DRAIN_TIMEOUT, reader)
                .await
                .is_err()
            {
                debug!(%kind, id = id.0, "worker stream still open after exit");
            }
        }
        let _ = events_tx.send(SupervisorEvent::Exited { kind, id, code });
    });
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
