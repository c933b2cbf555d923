mod config;
mod input;
mod media;

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{
    AvatarCache, Bridge, BridgeCommand, BridgeHandle, DirectoryAvatarCache, MemoryAvatarCache,
    TokioWorkerLauncher,
};
use input::{parse_input, Input};
use shared::{
    domain::RosterEntry,
    protocol::{ProtocolEvent, UiEvent},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "airchat", about = "Terminal shell for AirChat rooms")]
struct Args {
    /// Settings file; defaults to ./airchat.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    username: String,
    /// Room address; a local address also starts a local room server.
    #[arg(long, default_value = "127.0.0.1")]
    endpoint: String,
    /// Host a new room instead of joining one.
    #[arg(long)]
    create: bool,
    /// Print UI events as JSON lines.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let settings = config::load_settings(args.config.as_deref());
    let bridge_config = settings.to_bridge_config();
    info!(
        server = %bridge_config.server_program.display(),
        client = %bridge_config.client_program.display(),
        "worker binaries resolved"
    );

    let avatars: Arc<dyn AvatarCache> = match settings.avatar_dir() {
        Some(dir) => {
            let cache = DirectoryAvatarCache::new(dir);
            info!(dir = %cache.dir().display(), "avatars cached on disk");
            Arc::new(cache)
        }
        None => {
            warn!("no data directory; avatars are kept in memory only");
            Arc::new(MemoryAvatarCache::new())
        }
    };
    let handle = Bridge::spawn(bridge_config, Arc::new(TokioWorkerLauncher), avatars);
    let printer = tokio::spawn(print_events(handle.subscribe_events(), args.json));

    let open = if args.create {
        BridgeCommand::CreateRoom {
            username: args.username.clone(),
            endpoint: args.endpoint.clone(),
        }
    } else {
        BridgeCommand::JoinRoom {
            username: args.username.clone(),
            endpoint: args.endpoint.clone(),
        }
    };
    handle.send(open).await?;
    println!("{}", input::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if run_line(&handle, &line).await? == Flow::Quit {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    handle.shutdown().await?;
    printer.abort();
    Ok(())
}

async fn run_line(handle: &BridgeHandle, line: &str) -> Result<Flow> {
    match parse_input(line) {
        Input::Empty => {}
        Input::Chat(text) => handle.send(BridgeCommand::SendText(text)).await?,
        Input::Voice(on) => handle.send(BridgeCommand::SetVoice(on)).await?,
        Input::Image(path) => {
            match tokio::task::spawn_blocking(move || media::prepare_image_file(&path)).await? {
                Ok(data_url) => {
                    handle
                        .send(BridgeCommand::SendImage(data_url.into_bytes()))
                        .await?
                }
                Err(err) => warn!("image not sent: {err:#}"),
            }
        }
        Input::Avatar(Some(path)) => {
            match tokio::task::spawn_blocking(move || media::avatar_data_url(&path)).await? {
                Ok(data_url) => handle.send(BridgeCommand::SetAvatar(data_url)).await?,
                Err(err) => warn!("avatar not changed: {err:#}"),
            }
        }
        Input::Avatar(None) => handle.send(BridgeCommand::ClearAvatar).await?,
        Input::Who => println!("{}", describe_roster(&handle.roster().await?)),
        Input::Ip => println!("local address: {}", handle.local_ip().await?),
        Input::Logout => handle.send(BridgeCommand::Logout).await?,
        Input::Quit => return Ok(Flow::Quit),
        Input::Unknown(command) => println!("unknown command {command}; {}", input::HELP),
    }
    Ok(Flow::Continue)
}

async fn print_events(mut events: broadcast::Receiver<UiEvent>, json: bool) {
    loop {
        match events.recv().await {
            Ok(event) if json => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!(%err, "failed to serialize ui event"),
            },
            Ok(event) => {
                if let Some(line) = describe_event(&event) {
                    println!("{line}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "terminal fell behind; events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn describe_event(event: &UiEvent) -> Option<String> {
    let line = match event {
        UiEvent::Protocol(ProtocolEvent::ChatText { text, .. }) => text.clone(),
        UiEvent::Protocol(ProtocolEvent::Image {
            sender_is_self,
            payload,
        }) => {
            let from = if *sender_is_self { "you" } else { "peer" };
            format!("[image from {from}, {} bytes]", payload.len())
        }
        UiEvent::Protocol(ProtocolEvent::RosterJoin { username }) => {
            format!("* {username} joined the room")
        }
        UiEvent::Protocol(ProtocolEvent::VoiceJoin { username }) => {
            format!("* {username} joined voice")
        }
        UiEvent::Protocol(ProtocolEvent::VoiceLeave { username }) => {
            format!("* {username} left voice")
        }
        UiEvent::Protocol(ProtocolEvent::Diagnostic { .. }) => return None,
        UiEvent::RosterUpdated(entries) => describe_roster(entries),
        UiEvent::SessionStarted { username } => format!("connected as {username}"),
        UiEvent::ProcessReady { .. } => return None,
        UiEvent::VoiceStateChanged(true) => "voice on".to_string(),
        UiEvent::VoiceStateChanged(false) => "voice off".to_string(),
        UiEvent::ImageSent => "image sent".to_string(),
        UiEvent::SendFailed(failure) => format!("send failed: {}", failure.message),
        UiEvent::StartFailed { kind, failure } => {
            format!("could not start {kind}: {}", failure.message)
        }
        UiEvent::ProcessCrashed { kind, exit_code } => match exit_code {
            Some(code) => format!("{kind} exited unexpectedly (code {code}); reconnect to retry"),
            None => format!("{kind} exited unexpectedly; reconnect to retry"),
        },
        UiEvent::ProcessStopped { .. } => return None,
        UiEvent::LoggedOut => "logged out".to_string(),
        UiEvent::Info(message) => message.clone(),
    };
    Some(line)
}

fn describe_roster(entries: &[RosterEntry]) -> String {
    if entries.is_empty() {
        return "room: nobody yet".to_string();
    }
    let names: Vec<String> = entries
        .iter()
        .map(|entry| {
            if entry.in_voice {
                format!("{} (voice)", entry.username)
            } else {
                entry.username.clone()
            }
        })
        .collect();
    format!("room: {}", names.join(", "))
}
