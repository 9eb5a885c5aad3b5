use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{
    config::{load_config, load_config_from},
    ChannelScope, ClientConfig, PresenceSnapshot, Session, SessionEvent,
};
use shared::domain::DeviceId;
use storage::{KeyValueStore, MemoryStore, Storage};
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines, Stdin},
    sync::broadcast::error::RecvError,
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal client for the realtime chat server")]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    /// TOML file read instead of ./client.toml.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Keep the device id in memory only.
    #[arg(long)]
    ephemeral: bool,
}

enum Next {
    Restart,
    Quit,
}

const HELP: &str = "commands: /open <peer>, /msg <peer> <text>, /close <peer>, /who, /reset, /quit; anything else goes to the public channel";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    };
    if let Some(server_url) = args.server_url {
        config.server_url = server_url;
    }
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }

    let store: Arc<dyn KeyValueStore> = if args.ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(Storage::new(&config.database_url).await?)
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match run_session(&config, Arc::clone(&store), &mut lines).await? {
            Next::Restart => info!("restarting session with a fresh device id"),
            Next::Quit => break,
        }
    }
    Ok(())
}

async fn run_session(
    config: &ClientConfig,
    store: Arc<dyn KeyValueStore>,
    lines: &mut Lines<BufReader<Stdin>>,
) -> Result<Next> {
    let session = Session::start(config.clone(), store).await?;
    println!("You are {}", session.device_id());
    println!("{HELP}");
    let printer = spawn_printer(&session);

    let next = loop {
        let Some(line) = lines.next_line().await? else {
            break Next::Quit;
        };
        match handle_line(&session, line.trim()).await {
            Ok(Some(next)) => break next,
            Ok(None) => {}
            Err(err) => println!("! {err}"),
        }
    };

    if let Next::Quit = next {
        session.shutdown().await;
    }
    printer.abort();
    Ok(next)
}

async fn handle_line(session: &Session, line: &str) -> Result<Option<Next>> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "/quit" => return Ok(Some(Next::Quit)),
        "/reset" => {
            session.reset_identity().await?;
            return Ok(Some(Next::Restart));
        }
        "/who" => print_presence(&session.refresh_presence().await),
        "/open" => {
            session.open_private(&peer_arg(rest)?).await?;
        }
        "/close" => session.close_private(&peer_arg(rest)?).await,
        "/msg" => {
            let (peer, text) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
            session.send_private(&peer_arg(peer)?, text).await?;
        }
        "/help" => println!("{HELP}"),
        _ if command.starts_with('/') => println!("! unknown command {command}"),
        _ => session.send_broadcast(line).await?,
    }
    Ok(None)
}

fn peer_arg(raw: &str) -> Result<DeviceId> {
    let raw = raw.trim();
    anyhow::ensure!(!raw.is_empty(), "missing peer device id");
    Ok(DeviceId::from(raw))
}

fn print_presence(snapshot: &PresenceSnapshot) {
    if snapshot.is_empty() {
        println!("(nobody online)");
        return;
    }
    for entry in snapshot.entries() {
        let marker = if entry.is_self { " (you)" } else { "" };
        println!("  {}{marker}", entry.device_id);
    }
}

fn spawn_printer(session: &Session) -> JoinHandle<()> {
    let mut events = session.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => render(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn render(event: &SessionEvent) {
    match event {
        SessionEvent::Appended { scope, entry } => {
            let channel = match scope {
                ChannelScope::Broadcast => "public".to_string(),
                ChannelScope::Private(peer) => format!("private {peer}"),
            };
            println!(
                "[{}] [{channel}] {}: {}",
                entry.at.format("%H:%M:%S"),
                entry.author.label(),
                entry.text
            );
        }
        SessionEvent::ConversationOpened(peer) => println!("-- private chat with {peer} opened"),
        SessionEvent::ConversationClosed(peer) => println!("-- private chat with {peer} closed"),
        SessionEvent::PresenceUpdated(snapshot) => {
            let peers: Vec<String> = snapshot.peers().map(ToString::to_string).collect();
            debug!(online = %peers.join(", "), "presence updated");
        }
        SessionEvent::BroadcastStateChanged(_) | SessionEvent::PrivateStateChanged { .. } => {}
    }
}
