//! Dispatch loop joining UI actions, worker supervision and the inbound
//! record pipeline (reassembler, classifier, roster).
//!
//! Every piece of core state is owned by [`Bridge`] and only touched from
//! [`Bridge::run`]; other tasks talk to it through queues.

use std::{net::Ipv4Addr, sync::Arc};

use shared::{
    domain::{ProcessKind, RosterEntry, VoiceToggle},
    error::{BridgeFailure, ErrorCode},
    protocol::{OutboundCommand, ReadyVia, UiEvent},
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    avatar::AvatarCache,
    classifier::{classify, ClassifyContext},
    config::BridgeConfig,
    encoder,
    launcher::WorkerLauncher,
    net,
    roster::RosterState,
    supervisor::{StreamKind, Supervisor, SupervisorEvent, SupervisorNotice},
    writer::{WriteError, WriteStatus},
};

const COMMAND_QUEUE_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub enum BridgeCommand {
    /// Host a room: start the local server, then the client once it is ready.
    CreateRoom {
        username: String,
        endpoint: String,
    },
    /// Join a room; a local endpoint gets a local server if none is running.
    JoinRoom {
        username: String,
        endpoint: String,
    },
    SendText(String),
    SendImage(Vec<u8>),
    SetVoice(bool),
    SetAvatar(String),
    ClearAvatar,
    Logout,
    Roster(oneshot::Sender<Vec<RosterEntry>>),
    LocalIp(oneshot::Sender<Ipv4Addr>),
    Shutdown(oneshot::Sender<()>),
}

impl BridgeCommand {
    pub fn name(&self) -> &'static str {
        match self {
            BridgeCommand::CreateRoom { .. } => "create_room",
            BridgeCommand::JoinRoom { .. } => "join_room",
            BridgeCommand::SendText(_) => "send_text",
            BridgeCommand::SendImage(_) => "send_image",
            BridgeCommand::SetVoice(_) => "set_voice",
            BridgeCommand::SetAvatar(_) => "set_avatar",
            BridgeCommand::ClearAvatar => "clear_avatar",
            BridgeCommand::Logout => "logout",
            BridgeCommand::Roster(_) => "roster",
            BridgeCommand::LocalIp(_) => "local_ip",
            BridgeCommand::Shutdown(_) => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("bridge command queue is full; retry")]
    QueueFull,
    #[error("bridge dispatch loop has stopped")]
    Disconnected,
}

#[derive(Clone)]
pub struct BridgeHandle {
    cmd_tx: mpsc::Sender<BridgeCommand>,
    events: broadcast::Sender<UiEvent>,
}

impl BridgeHandle {
    pub fn subscribe_events(&self) -> broadcast::Receiver<UiEvent> {
        self.events.subscribe()
    }

    /// Non-blocking enqueue for callers on a UI thread.
    pub fn dispatch(&self, cmd: BridgeCommand) -> Result<(), DispatchError> {
        let name = cmd.name();
        match self.cmd_tx.try_send(cmd) {
            Ok(()) => {
                debug!(command = name, "queued ui->bridge command");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(DispatchError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Disconnected),
        }
    }

    pub async fn send(&self, cmd: BridgeCommand) -> Result<(), DispatchError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| DispatchError::Disconnected)
    }

    pub async fn roster(&self) -> Result<Vec<RosterEntry>, DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(BridgeCommand::Roster(reply_tx)).await?;
        reply_rx.await.map_err(|_| DispatchError::Disconnected)
    }

    pub async fn local_ip(&self) -> Result<Ipv4Addr, DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(BridgeCommand::LocalIp(reply_tx)).await?;
        reply_rx.await.map_err(|_| DispatchError::Disconnected)
    }

    /// Stops every worker and waits for the dispatch loop to finish.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(BridgeCommand::Shutdown(reply_tx)).await?;
        reply_rx.await.map_err(|_| DispatchError::Disconnected)
    }
}

enum Internal {
    TextFlushed(Result<(), WriteError>),
    ImageFlushed(Result<(), WriteError>),
}

struct PendingClient {
    username: String,
    endpoint: String,
}

pub struct Bridge {
    config: BridgeConfig,
    supervisor: Supervisor,
    supervisor_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
    cmd_rx: mpsc::Receiver<BridgeCommand>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events: broadcast::Sender<UiEvent>,
    avatars: Arc<dyn AvatarCache>,
    roster: RosterState,
    username: Option<String>,
    pending_client: Option<PendingClient>,
    accepting: bool,
    shutdown_replies: Vec<oneshot::Sender<()>>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        launcher: Arc<dyn WorkerLauncher>,
        avatars: Arc<dyn AvatarCache>,
    ) -> (Self, BridgeHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (supervisor, supervisor_rx) = Supervisor::new(launcher, config.grace_period);

        let bridge = Self {
            config,
            supervisor,
            supervisor_rx,
            cmd_rx,
            internal_tx,
            internal_rx,
            events: events.clone(),
            roster: RosterState::new(Arc::clone(&avatars)),
            avatars,
            username: None,
            pending_client: None,
            accepting: true,
            shutdown_replies: Vec::new(),
        };
        (bridge, BridgeHandle { cmd_tx, events })
    }

    /// Builds a bridge and runs its dispatch loop on a new task.
    pub fn spawn(
        config: BridgeConfig,
        launcher: Arc<dyn WorkerLauncher>,
        avatars: Arc<dyn AvatarCache>,
    ) -> BridgeHandle {
        let (bridge, handle) = Self::new(config, launcher, avatars);
        tokio::spawn(bridge.run());
        handle
    }

    pub async fn run(mut self) {
        info!("bridge dispatch loop started");
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv(), if self.accepting => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        debug!("all bridge handles dropped");
                        self.begin_shutdown();
                    }
                },
                Some(event) = self.supervisor_rx.recv() => {
                    for notice in self.supervisor.handle_event(event) {
                        self.handle_notice(notice);
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
            }

            if !self.accepting && self.supervisor.is_idle() {
                break;
            }
        }

        for reply in self.shutdown_replies.drain(..) {
            let _ = reply.send(());
        }
        info!("bridge dispatch loop finished");
    }

    fn handle_command(&mut self, cmd: BridgeCommand) {
        debug!(command = cmd.name(), "bridge command");
        match cmd {
            BridgeCommand::CreateRoom { username, endpoint } => {
                self.open_session(username, endpoint.clone(), endpoint, true);
            }
            BridgeCommand::JoinRoom { username, endpoint } => {
                if net::is_local_endpoint(&endpoint, net::local_ipv4()) {
                    debug!(%endpoint, "endpoint is local; connecting through loopback");
                    self.open_session(username, endpoint, net::loopback_endpoint(), true);
                } else {
                    self.open_session(username, endpoint.clone(), endpoint, false);
                }
            }
            BridgeCommand::SendText(text) => self.send_text(text),
            BridgeCommand::SendImage(payload) => self.send_image(payload),
            BridgeCommand::SetVoice(on) => self.set_voice(on),
            BridgeCommand::SetAvatar(avatar) => self.set_avatar(Some(avatar)),
            BridgeCommand::ClearAvatar => self.set_avatar(None),
            BridgeCommand::Logout => self.logout(),
            BridgeCommand::Roster(reply) => {
                let _ = reply.send(self.roster.snapshot());
            }
            BridgeCommand::LocalIp(reply) => {
                let _ = reply.send(net::local_ipv4());
            }
            BridgeCommand::Shutdown(reply) => {
                self.shutdown_replies.push(reply);
                self.begin_shutdown();
            }
        }
    }

    fn open_session(
        &mut self,
        username: String,
        endpoint: String,
        client_endpoint: String,
        with_server: bool,
    ) {
        if self.supervisor.state(ProcessKind::Client).is_active() {
            info!(%username, "client already running; reusing session");
            self.emit(UiEvent::Info("room client already running".to_string()));
            if let Some(current) = self.username.clone() {
                self.emit(UiEvent::SessionStarted { username: current });
            }
            return;
        }

        info!(%username, %endpoint, with_server, "opening room session");
        if !with_server {
            self.start_client(username, client_endpoint);
            return;
        }

        if let Err(err) = self.supervisor.start(&self.config.server_spec()) {
            warn!(%err, "room server failed to start");
            self.emit(UiEvent::StartFailed {
                kind: ProcessKind::Server,
                failure: BridgeFailure::new(ErrorCode::SpawnFailed, err.to_string()),
            });
            return;
        }

        if self.supervisor.is_running(ProcessKind::Server) {
            self.start_client(username, client_endpoint);
        } else {
            debug!("waiting for room server readiness before starting client");
            self.pending_client = Some(PendingClient {
                username,
                endpoint: client_endpoint,
            });
        }
    }

    fn start_client(&mut self, username: String, endpoint: String) {
        let spec = self.config.client_spec(&endpoint, &username);
        match self.supervisor.start(&spec) {
            Ok(handle) => {
                info!(%username, %endpoint, pid = ?handle.pid, "room client started");
                self.roster.clear();
                self.username = Some(username.clone());
                self.emit(UiEvent::ProcessReady {
                    kind: ProcessKind::Client,
                    via: ReadyVia::Spawned,
                });
                self.emit(UiEvent::SessionStarted { username });
            }
            Err(err) => {
                warn!(%err, "room client failed to start");
                self.emit(UiEvent::StartFailed {
                    kind: ProcessKind::Client,
                    failure: BridgeFailure::new(ErrorCode::SpawnFailed, err.to_string()),
                });
            }
        }
    }

    fn send_text(&mut self, text: String) {
        let cmd = OutboundCommand::SendText(text);
        let bytes = match encoder::encode(&cmd) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(command = cmd.name(), %err, "chat message rejected");
                self.emit(UiEvent::SendFailed(err.into()));
                return;
            }
        };
        match self.supervisor.write(ProcessKind::Client, bytes) {
            Ok(pending) => {
                if pending.status == WriteStatus::Draining {
                    warn!(bytes = pending.bytes, "client input is draining");
                }
                let internal_tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let _ = internal_tx.send(Internal::TextFlushed(pending.flushed().await));
                });
            }
            Err(err) => warn!(%err, "chat message dropped"),
        }
    }

    fn send_image(&mut self, payload: Vec<u8>) {
        let cmd = OutboundCommand::image(payload);
        let bytes = match encoder::encode(&cmd) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(command = cmd.name(), %err, "image rejected");
                self.emit(UiEvent::SendFailed(err.into()));
                return;
            }
        };
        debug!(bytes = bytes.len(), "sending image to client");
        match self.supervisor.write(ProcessKind::Client, bytes) {
            Ok(pending) => {
                if pending.status == WriteStatus::Draining {
                    warn!(bytes = pending.bytes, "client input buffer is full; image still queued");
                }
                let internal_tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let _ = internal_tx.send(Internal::ImageFlushed(pending.flushed().await));
                });
            }
            Err(err) => {
                warn!(%err, "image dropped");
                self.emit(UiEvent::SendFailed(BridgeFailure::new(
                    ErrorCode::WriteAfterExit,
                    "room client is not running",
                )));
            }
        }
    }

    fn set_voice(&mut self, on: bool) {
        let cmd = OutboundCommand::VoiceToggle(VoiceToggle::from(on));
        let written = encoder::encode(&cmd)
            .map_err(|err| err.to_string())
            .and_then(|bytes| {
                self.supervisor
                    .write(ProcessKind::Client, bytes)
                    .map_err(|err| err.to_string())
            });
        match written {
            Ok(_) => self.emit(UiEvent::VoiceStateChanged(on)),
            Err(err) => warn!(command = cmd.name(), on, %err, "voice command dropped"),
        }
    }

    fn set_avatar(&mut self, avatar: Option<String>) {
        let Some(username) = self.username.clone() else {
            warn!("avatar change without an active session ignored");
            return;
        };
        let stored = match &avatar {
            Some(avatar) => self.avatars.store(&username, avatar),
            None => self.avatars.remove(&username),
        };
        if let Err(err) = stored {
            warn!(%username, "failed to update avatar cache: {err:#}");
        }
        if self.roster.set_avatar(&username, avatar) {
            self.emit(UiEvent::RosterUpdated(self.roster.snapshot()));
        }
    }

    fn logout(&mut self) {
        info!("logout requested");
        self.supervisor.stop(ProcessKind::Client, true);
        self.supervisor.stop(ProcessKind::Server, false);
        self.end_session();
        self.emit(UiEvent::LoggedOut);
    }

    fn begin_shutdown(&mut self) {
        if self.accepting {
            info!("bridge shutting down");
        }
        self.accepting = false;
        self.supervisor.shutdown();
        self.pending_client = None;
    }

    fn end_session(&mut self) {
        self.pending_client = None;
        self.username = None;
        if !self.roster.is_empty() {
            self.roster.clear();
            self.emit(UiEvent::RosterUpdated(Vec::new()));
        }
    }

    fn handle_notice(&mut self, notice: SupervisorNotice) {
        match notice {
            SupervisorNotice::Record {
                kind: ProcessKind::Client,
                stream: StreamKind::Stdout,
                record,
            } => self.on_client_record(&record),
            SupervisorNotice::Record {
                kind,
                stream: StreamKind::Stdout,
                record,
            } => info!(%kind, "{record}"),
            SupervisorNotice::Record {
                kind,
                stream: StreamKind::Stderr,
                record,
            } => warn!(%kind, "stderr: {record}"),
            SupervisorNotice::Ready { kind, via } => {
                self.emit(UiEvent::ProcessReady { kind, via });
                if kind == ProcessKind::Server {
                    if let Some(pending) = self.pending_client.take() {
                        self.start_client(pending.username, pending.endpoint);
                    }
                }
            }
            SupervisorNotice::Crashed { kind, exit_code } => {
                self.emit(UiEvent::ProcessCrashed { kind, exit_code });
                match kind {
                    ProcessKind::Client => self.end_session(),
                    ProcessKind::Server => {
                        if self.pending_client.take().is_some() {
                            self.emit(UiEvent::StartFailed {
                                kind: ProcessKind::Client,
                                failure: BridgeFailure::new(
                                    ErrorCode::Crashed,
                                    "room server exited before it was ready",
                                ),
                            });
                        }
                    }
                }
            }
            SupervisorNotice::Stopped {
                kind,
                forced,
                exit_code,
            } => {
                debug!(%kind, forced, ?exit_code, "worker stop completed");
                self.emit(UiEvent::ProcessStopped { kind, forced });
            }
        }
    }

    fn on_client_record(&mut self, record: &str) {
        if record.trim().is_empty() {
            return;
        }
        let ctx = ClassifyContext {
            current_username: self.username.as_deref(),
        };
        let event = classify(record, &ctx);
        if event.is_diagnostic() {
            debug!(record, "client diagnostic");
            return;
        }

        let change = self.roster.apply(&event);
        debug!(event = event.name(), "client record classified");
        self.emit(UiEvent::Protocol(event));
        if change.is_change() {
            self.emit(UiEvent::RosterUpdated(self.roster.snapshot()));
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::TextFlushed(Ok(())) => {}
            Internal::TextFlushed(Err(err)) => warn!(%err, "chat message was not delivered"),
            Internal::ImageFlushed(Ok(())) => {
                debug!("image flushed to client");
                self.emit(UiEvent::ImageSent);
            }
            Internal::ImageFlushed(Err(err)) => {
                warn!(%err, "image was not delivered");
                let code = match err {
                    WriteError::WriteAfterExit { .. } => ErrorCode::WriteAfterExit,
                    WriteError::Io { .. } => ErrorCode::WriteFailed,
                };
                self.emit(UiEvent::SendFailed(BridgeFailure::new(code, err.to_string())));
            }
        }
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/bridge_tests.rs"]
mod tests;
