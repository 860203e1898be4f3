use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{
    load_settings, ChatClient, ChatConnectionManager, EntryDecision, RoomEvent, TokenKind,
};
use shared::{
    domain::{MemberUid, RoomId},
    protocol::{Message, MessageBody},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    /// Room to join when the server does not send us back to a previous one.
    #[arg(long)]
    room: Option<String>,
    #[arg(long)]
    access_token: Option<String>,
    #[arg(long)]
    refresh_token: Option<String>,
    /// Keep the tokens on disk across restarts.
    #[arg(long)]
    remember: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_filter.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let client = ChatClient::from_settings(settings);
    match (args.access_token, args.refresh_token) {
        (Some(access), Some(refresh)) => {
            client
                .login_with_tokens(&access, &refresh, args.remember)
                .await?
        }
        (None, None) => {}
        _ => bail!("--access-token and --refresh-token must be given together"),
    }
    let Some(claims) = client.credentials().claims(TokenKind::Access).await else {
        bail!("no stored session; sign in with --access-token and --refresh-token");
    };
    println!("Signed in as {} ({:?})", claims.subject_name, claims.role);

    let room_id = match client.entry_guard().check().await? {
        EntryDecision::RedirectTo(room_id) => {
            println!("Returning to room {room_id}");
            room_id
        }
        EntryDecision::Allow => RoomId::new(args.room.context("--room is required")?),
    };

    let manager = client.connection_manager();
    let printer = tokio::spawn(print_events(manager.subscribe_events()));
    manager.connect(room_id).await?;
    println!("Commands: /more, /pic <path>, /kick <uid>, /who, /quit");

    let result = run_prompt(&manager).await;
    manager.disconnect().await;
    printer.abort();
    result
}

async fn run_prompt(manager: &ChatConnectionManager) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            return Ok(());
        };

        let outcome = match line.trim_end() {
            "/quit" => return Ok(()),
            "/more" => manager.fetch_next_page().await.map(|count| {
                println!("Loaded {count} older messages");
            }),
            "/who" => {
                let snapshot = manager.snapshot().await;
                println!("{} online", snapshot.online_count);
                for member in snapshot.members {
                    let status = if member.is_online { "online" } else { "away" };
                    println!("  {} [{}] {status}", member.username, member.uid);
                }
                Ok(())
            }
            command if command.starts_with("/pic ") => {
                manager
                    .send_picture_file(Path::new(command["/pic ".len()..].trim()), None)
                    .await
            }
            command if command.starts_with("/kick ") => {
                manager
                    .remove_member(&MemberUid::new(command["/kick ".len()..].trim()))
                    .await
            }
            text => manager.send_message(text).await,
        };
        if let Err(err) = outcome {
            eprintln!("! {err}");
        }
    }
}

async fn print_events(mut events: broadcast::Receiver<RoomEvent>) {
    loop {
        match events.recv().await {
            Ok(RoomEvent::StateChanged { state, generation }) => {
                println!("-- {state:?} (generation {generation})");
            }
            Ok(RoomEvent::MessageAppended { message, .. }) => print_message(&message),
            Ok(RoomEvent::HistoryPrepended {
                count, exhausted, ..
            }) => {
                let tail = if exhausted { "; no older messages" } else { "" };
                println!("-- {count} history messages{tail}");
            }
            Ok(RoomEvent::RosterUpdated { online_count, .. }) => {
                println!("-- {online_count} online");
            }
            Ok(RoomEvent::View(_)) => {}
            Ok(RoomEvent::Error(error)) => eprintln!("! {error}"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn print_message(message: &Message) {
    let time = message.timestamp.format("%H:%M");
    match &message.body {
        MessageBody::Text(text) => println!("[{time}] {}: {text}", message.author),
        MessageBody::Image(reference) => {
            println!("[{time}] {} sent a picture: {reference}", message.author)
        }
    }
}
