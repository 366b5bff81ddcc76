//! lanpad: edit one text document together with everyone on the LAN.
//!
//! A terminal front-end over `lanpad-collab`: stdin lines are commands or
//! the new document text, remote changes are printed as they arrive.

mod command;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use lanpad_collab::{
    ChannelCollaborator, CollabError, ConflictResolution, Framing, JoinDecision, PeerRecord,
    SessionConfig, SessionEvent, SessionHandle, SessionState, SessionStatus, StaticInterface,
    DEFAULT_PORT,
};
use log::info;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::command::{Command, HELP};

#[derive(Parser, Debug)]
#[command(name = "lanpad")]
#[command(about = "Serverless collaborative text editing over a local network")]
struct Cli {
    /// Name shown to other peers
    #[arg(short, long, default_value = "anonymous")]
    name: String,

    /// UDP port to bind
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// UDP port broadcasts go to (defaults to --port)
    #[arg(long)]
    broadcast_port: Option<u16>,

    /// Address advertised to peers
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    local: IpAddr,

    /// Broadcast address of the local network
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::BROADCAST))]
    broadcast: IpAddr,

    /// Use JSON datagrams instead of bincode
    #[arg(long)]
    text_framing: bool,

    /// Host the document right away
    #[arg(long)]
    share: bool,

    /// Join invitations without asking; otherwise they are only listed
    #[arg(long)]
    auto_join: bool,

    /// Stay solo instead of joining when text was typed before the invite
    #[arg(long)]
    keep_local: bool,
}

impl Cli {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            display_name: self.name.clone(),
            port: self.port,
            broadcast_port: self.broadcast_port.unwrap_or(self.port),
            framing: if self.text_framing {
                Framing::Text
            } else {
                Framing::Binary
            },
            ..SessionConfig::default()
        }
    }

    fn conflict_policy(&self) -> ConflictResolution {
        if self.keep_local {
            ConflictResolution::Cancel
        } else {
            ConflictResolution::Discard
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let join_policy = if cli.auto_join {
        JoinDecision::Accept
    } else {
        JoinDecision::Decline
    };
    let (collaborator, mut events) =
        ChannelCollaborator::new(join_policy, cli.conflict_policy(), 256);
    let unsaved = collaborator.unsaved_flag();
    let interface = StaticInterface::new(cli.local, cli.broadcast);
    let session =
        SessionHandle::start(cli.session_config(), &interface, Box::new(collaborator)).await?;
    info!("lanpad '{}' ready on {}", cli.name, session.local_addr());
    println!("{HELP}");

    if cli.share {
        session.share().await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let command = Command::parse(&line);
                if marks_unsaved(session.state().await, &command) {
                    unsaved.store(true, Ordering::SeqCst);
                }
                if !run_command(&session, command).await {
                    break;
                }
            }
            Some(event) = events.recv() => {
                if clears_unsaved(&event) {
                    unsaved.store(false, Ordering::SeqCst);
                }
                print_event(event);
            }
        }
    }

    session.shutdown().await?;
    Ok(())
}

/// Execute one command. Returns `false` when the user asked to quit.
async fn run_command(session: &SessionHandle, command: Command) -> bool {
    match command {
        Command::Share => report(session.share().await),
        Command::Leave => session.disconnect().await,
        Command::Show => println!("{}", session.text().await),
        Command::Peers => print_peers(&session.peers().await),
        Command::Help => println!("{HELP}"),
        Command::Quit => return false,
        Command::Replace(text) => report(session.replace_text(&text).await),
    }
    true
}

/// Text typed while solo exists nowhere else until a session is shared.
fn marks_unsaved(state: SessionState, command: &Command) -> bool {
    state == SessionState::Solo && matches!(command, Command::Replace(_))
}

/// Once the text is part of a session it is replicated.
fn clears_unsaved(event: &SessionEvent) -> bool {
    matches!(
        event,
        SessionEvent::Status(SessionStatus::StateChanged(state)) if state.is_shared()
    )
}

/// Refused actions are reported, not fatal.
fn report(result: Result<(), CollabError>) {
    if let Err(e) = result {
        eprintln!("! {e}");
    }
}

fn print_event(event: SessionEvent) {
    match event {
        SessionEvent::DocumentChanged(text) => println!("[doc] {text}"),
        SessionEvent::PeersChanged(peers) => print_peers(&peers),
        SessionEvent::JoinRequested { host, decision } => match decision {
            JoinDecision::Accept => println!("[invite] joining '{}' at {}", host.name, host.address),
            JoinDecision::Decline => println!(
                "[invite] '{}' at {} is sharing (restart with --auto-join to join)",
                host.name, host.address
            ),
        },
        SessionEvent::ConflictResolved(resolution) => {
            println!("[join] local text handled with {resolution:?}")
        }
        SessionEvent::Status(status) => println!("[status] {status:?}"),
    }
}

fn print_peers(peers: &[PeerRecord]) {
    if peers.is_empty() {
        println!("[peers] none");
        return;
    }
    for peer in peers {
        println!("[peers] {} at {} ({:?})", peer.display_name, peer.address, peer.state);
    }
}
