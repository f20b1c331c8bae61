mod commands;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use tandem_core::{bootstrap::load_config, logging, models::PeerId};
use tandem_rtc::{CallEvent, RtcEngine, Session, SessionEvent, WebSocketSignaling};

use commands::{Command, HELP};

#[derive(Parser, Debug)]
#[command(author, version, about = "Two-party WebRTC call client", long_about = None)]
struct Args {
    /// Config file (YAML/TOML/JSON)
    #[arg(short, long, env = "TANDEM_CONFIG_PATH")]
    config: Option<String>,

    /// Signaling server URL (ws:// or wss://)
    #[arg(short, long)]
    url: Option<String>,

    /// Room to join
    #[arg(short, long)]
    room: Option<String>,

    /// Connection id to announce instead of a generated one
    #[arg(long)]
    peer_id: Option<String>,

    /// Display name used in chat
    #[arg(short, long)]
    name: Option<String>,

    /// Do not open camera and microphone until a remote offer arrives
    #[arg(long)]
    no_media: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration, then apply command line overrides
    let mut config = load_config(args.config.as_deref())?;
    if let Some(url) = args.url {
        config.signaling.url = url;
    }
    if let Some(room) = args.room {
        config.signaling.room_id = room;
    }
    if let Some(peer_id) = args.peer_id {
        config.signaling.peer_id = Some(peer_id);
    }
    if let Some(name) = args.name {
        config.signaling.display_name = name;
    }
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Tandem client starting...");

    // 3. Build the media engine and signaling channel
    let engine = Arc::new(RtcEngine::new(&config.webrtc).await?);
    let signaling = Arc::new(WebSocketSignaling::new(&config.signaling));

    // 4. Join the room
    let session = Session::initialize(&config, engine, signaling).await?;
    let mut events = session
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("session events already taken"))?;
    println!(
        "joined room {} as {} (type /help for commands)",
        session.room_id(),
        session.local_id()
    );

    if !args.no_media {
        session.start().await?;
    }

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    // 5. Read commands until /quit, EOF or Ctrl+C
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving room");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match commands::parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(e) = run_command(&session, command).await {
                            warn!(error = %e, "Command failed");
                            println!("error: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(message) => println!("{message}"),
                }
            }
        }
    }

    session.disconnect().await;
    printer.abort();
    info!("Tandem client stopped");
    Ok(())
}

async fn run_command(session: &Session, command: Command) -> Result<()> {
    match command {
        Command::Chat(text) => {
            let path = session.send_chat(&text).await?;
            info!(path = ?path, "Chat sent");
        }
        Command::ToggleAudio => {
            let enabled = session.toggle_audio().await?;
            println!("microphone {}", if enabled { "on" } else { "off" });
        }
        Command::ToggleVideo => {
            let enabled = session.toggle_video().await?;
            println!("camera {}", if enabled { "on" } else { "off" });
        }
        Command::Negotiate => session.negotiate()?,
        Command::Restart => session.restart_media().await?,
        Command::SwitchDevice { kind, device } => {
            let track = session.switch_capture_device(kind, &device).await?;
            println!("{kind} now from {device} ({})", track.id);
        }
        Command::Call(peer) => session.call_user(&peer)?,
        Command::Accept(peer) => session.accept_call(&peer)?,
        Command::Reject(peer) => session.reject_call(&peer)?,
        Command::End(peer) => session.end_call(&peer)?,
        Command::Roster => print_roster(session.local_id(), &session.roster()),
        Command::Stats => println!("{}", serde_json::to_string_pretty(&session.stats())?),
        Command::History => {
            for message in session.chat_history() {
                println!("[{}] {}", message.sender, message.body);
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

fn print_roster(local_id: &PeerId, roster: &[PeerId]) {
    for peer in roster {
        let marker = if peer == local_id { " (you)" } else { "" };
        println!("  {peer}{marker}");
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::LocalMediaReady(media) => {
            println!("local media ready: audio {} video {}", media.audio.id, media.video.id);
        }
        SessionEvent::RemoteMediaReady { kind, track_id } => {
            println!("remote {kind} track {track_id}");
        }
        SessionEvent::ConnectionStateChanged(state) => println!("media connection {state}"),
        SessionEvent::LifecycleChanged(state) => println!("session {state}"),
        SessionEvent::ChatReceived(message) => println!("[{}] {}", message.sender, message.body),
        SessionEvent::RosterChanged(roster) => {
            println!("participants: {}", roster.len());
        }
        SessionEvent::Call(call) => match call {
            CallEvent::Incoming { caller } => println!(
                "incoming call from {} ({}), /accept {} or /reject {}",
                caller.user_id, caller.socket_id, caller.socket_id, caller.socket_id
            ),
            CallEvent::Accepted { by } => println!("{by} accepted the call"),
            CallEvent::Rejected { by } => println!("{by} rejected the call"),
            CallEvent::Ended { by } => println!("{by} ended the call"),
            CallEvent::UserLeft { peer } => println!("{peer} left"),
        },
        SessionEvent::SignalingLost { reason } => {
            error!(reason = %reason, "Signaling connection lost");
            println!("signaling connection lost: {reason}");
        }
    }
}
