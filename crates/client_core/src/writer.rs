//! Asynchronous, backpressure-reporting writes to a worker's stdin.

use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use shared::domain::ProcessKind;
use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// Queued bytes above which a write reports [`WriteStatus::Draining`].
pub const HIGH_WATER_MARK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Accepted,
    Draining,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("{kind} worker input is closed")]
    WriteAfterExit { kind: ProcessKind },
    #[error("failed writing to {kind} worker input: {message}")]
    Io { kind: ProcessKind, message: String },
}

/// A write handed to the writer task. `status` is known immediately; the
/// flush result arrives later through [`PendingWrite::flushed`].
#[derive(Debug)]
pub struct PendingWrite {
    pub status: WriteStatus,
    pub bytes: usize,
    kind: ProcessKind,
    done: oneshot::Receiver<Result<(), WriteError>>,
}

impl PendingWrite {
    pub async fn flushed(self) -> Result<(), WriteError> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(WriteError::WriteAfterExit { kind: self.kind }),
        }
    }
}

struct WriteRequest {
    bytes: Vec<u8>,
    done: oneshot::Sender<Result<(), WriteError>>,
}

#[derive(Clone)]
pub struct StdinWriter {
    kind: ProcessKind,
    tx: mpsc::UnboundedSender<WriteRequest>,
    queued: Arc<AtomicUsize>,
}

impl StdinWriter {
    pub fn spawn<W>(kind: ProcessKind, sink: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(run_writer(kind, sink, rx, Arc::clone(&queued)));
        (Self { kind, tx, queued }, task)
    }

    pub fn submit(&self, bytes: Vec<u8>) -> Result<PendingWrite, WriteError> {
        let len = bytes.len();
        let (done_tx, done_rx) = oneshot::channel();
        let queued = self.queued.fetch_add(len, Ordering::SeqCst) + len;
        if self
            .tx
            .send(WriteRequest {
                bytes,
                done: done_tx,
            })
            .is_err()
        {
            self.queued.fetch_sub(len, Ordering::SeqCst);
            return Err(WriteError::WriteAfterExit { kind: self.kind });
        }

        let status = if queued > HIGH_WATER_MARK {
            WriteStatus::Draining
        } else {
            WriteStatus::Accepted
        };
        Ok(PendingWrite {
            status,
            bytes: len,
            kind: self.kind,
            done: done_rx,
        })
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run_writer<W>(
    kind: ProcessKind,
    mut sink: W,
    mut rx: mpsc::UnboundedReceiver<WriteRequest>,
    queued: Arc<AtomicUsize>,
) where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(request) = rx.recv().await {
        let len = request.bytes.len();
        let result = write_all_flushed(&mut sink, &request.bytes).await;
        queued.fetch_sub(len, Ordering::SeqCst);

        match result {
            Ok(()) => {
                debug!(%kind, bytes = len, "worker input flushed");
                let _ = request.done.send(Ok(()));
            }
            Err(err) => {
                let mapped = map_io_error(kind, &err);
                warn!(%kind, %err, "worker input write failed; closing writer");
                let _ = request.done.send(Err(mapped));
                break;
            }
        }
    }
    // Dropping `rx` fails every queued request and every later submit.
}

async fn write_all_flushed<W>(sink: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    sink.write_all(bytes).await?;
    sink.flush().await
}

fn map_io_error(kind: ProcessKind, err: &io::Error) -> WriteError {
    match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::WriteZero => {
            WriteError::WriteAfterExit { kind }
        }
        _ => WriteError::Io {
            kind,
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
#[path = "tests/writer_tests.rs"]
mod tests;
