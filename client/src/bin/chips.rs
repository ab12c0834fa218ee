//! Command line front end for a chipledger gateway.
//!
//! Usage:
//!   chips [--config chips.yaml] [--url URL] <COMMAND>
//!
//! Identity (participant id, display name and active room) persists in a
//! local state file, so consecutive invocations act as the same participant.

use anyhow::{anyhow, Context};
use chipledger_client::{
    config::Config, identity::FileStore, Client, ErrorKind, RoomView, Tracker, TransferMode,
};
use chipledger_types::ledger::ParticipantId;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Track poker chips in a shared room")]
struct Args {
    /// YAML config file (missing file uses defaults)
    #[arg(short, long, default_value = "chips.yaml")]
    config: String,

    /// Gateway URL
    #[arg(short, long)]
    url: Option<String>,

    /// Local state file
    #[arg(long)]
    state: Option<String>,

    /// Transfer mode (atomic or sequential)
    #[arg(long, value_parser = parse_mode)]
    mode: Option<TransferMode>,

    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the local identity
    Whoami,
    /// Set the display name used when joining rooms
    Name { name: String },
    /// Create a new room and join it
    Create,
    /// Join an existing room by code
    Join { code: String },
    /// Leave the active room
    Leave,
    /// Change the display name everywhere
    Rename { name: String },
    /// Send chips to another member (by name or participant id)
    Transfer { to: String, amount: i64 },
    /// Print the active room
    Show,
    /// Follow the active room until interrupted
    Watch,
}

fn parse_mode(raw: &str) -> Result<TransferMode, String> {
    match raw {
        "atomic" => Ok(TransferMode::Atomic),
        "sequential" => Ok(TransferMode::Sequential),
        other => Err(format!("unknown transfer mode: {other}")),
    }
}

type ChipTracker = Tracker<Client, FileStore>;

/// Convert a failed action into the message the tracker recorded for it.
fn report<T>(tracker: &ChipTracker, result: chipledger_client::Result<T>) -> anyhow::Result<T> {
    result.map_err(|e| match tracker.error() {
        Some(message) => anyhow!("{message}"),
        None => anyhow!(e),
    })
}

/// Rejoin the room left active by a previous invocation.
async fn resume(tracker: &mut ChipTracker) -> anyhow::Result<()> {
    match tracker.resume().await {
        Ok(Some(room)) => debug!(%room, "resumed"),
        Ok(None) => {}
        Err(e) if e.kind() == ErrorKind::RoomNotFound => {
            info!("previous room no longer exists");
        }
        Err(e) => return report(tracker, Err(e)),
    }
    Ok(())
}

fn print_view(view: &RoomView, me: ParticipantId) {
    let Some(room) = &view.room_id else {
        println!("not in a room");
        return;
    };
    println!("room {room} ({} chips on the table)", view.total_chips());
    for member in &view.members {
        let marker = if member.participant_id() == me { "*" } else { " " };
        println!(
            "{marker} {:<32} {:>8}",
            member.display_name(),
            member.chips()
        );
    }

    if view.transfers.is_empty() {
        return;
    }
    let names: HashMap<ParticipantId, &str> = view
        .members
        .iter()
        .map(|m| (m.participant_id(), m.display_name()))
        .collect();
    let name = |id: &ParticipantId| names.get(id).copied().unwrap_or("Unknown");
    println!("transfers:");
    for record in &view.transfers {
        println!(
            "  {} -> {}: {}",
            name(&record.from_player),
            name(&record.to_player),
            record.amount
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args
    let args = Args::parse();

    // Load config, flags override the file
    let mut config = Config::load(&args.config)?;
    if let Some(url) = args.url {
        config.gateway_url = url;
    }
    if let Some(state) = args.state {
        config.state_path = state;
    }
    if let Some(mode) = args.mode {
        config.transfer_mode = mode;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    let config = config.validate().context("invalid configuration")?;

    // Create logger (stdout is reserved for command output)
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_writer(std::io::stderr)
        .init();

    let client = Client::new(config.gateway_url.as_str())
        .context("failed to create gateway client")?
        .with_retry_policy(config.retry_policy)
        .with_feed_capacity(config.channel_capacity);
    let store = FileStore::new(&config.state_path);
    let mut tracker = Tracker::new(client, store, config.transfer_mode);
    if tracker.identity().is_degraded() {
        info!(path = %config.state_path.display(), "identity will not survive this run");
    }

    match args.command {
        Command::Whoami => {
            let identity = tracker.identity();
            println!("participant {}", tracker.participant_id());
            println!(
                "name        {}",
                identity.display_name().as_deref().unwrap_or("-")
            );
            println!(
                "room        {}",
                identity.active_room().as_deref().unwrap_or("-")
            );
        }
        Command::Name { name } => {
            let result = tracker.set_name(&name);
            report(&tracker, result)?;
            println!("name set");
        }
        Command::Create => {
            resume(&mut tracker).await?;
            let result = tracker.create_room().await;
            let code = report(&tracker, result)?;
            println!("created room {code}");
        }
        Command::Join { code } => {
            resume(&mut tracker).await?;
            let result = tracker.join_room(&code).await;
            report(&tracker, result)?;
            print_view(&tracker.view(), tracker.participant_id());
        }
        Command::Leave => {
            resume(&mut tracker).await?;
            let result = tracker.leave_room().await;
            report(&tracker, result)?;
            println!("left room");
        }
        Command::Rename { name } => {
            resume(&mut tracker).await?;
            let result = tracker.rename(&name).await;
            report(&tracker, result)?;
            println!("renamed to {name}");
        }
        Command::Transfer { to, amount } => {
            resume(&mut tracker).await?;
            let view = tracker.view();
            let target = view
                .find(&to)
                .map(|m| m.participant_id())
                .ok_or_else(|| anyhow!("no member matching {to}"))?;
            let result = tracker.transfer(target, amount).await;
            let receipt = report(&tracker, result)?;
            println!(
                "sent {amount}, balance now {}",
                receipt.sender_chips
            );
        }
        Command::Show => {
            resume(&mut tracker).await?;
            print_view(&tracker.view(), tracker.participant_id());
        }
        Command::Watch => {
            resume(&mut tracker).await?;
            let me = tracker.participant_id();
            let mut updates = tracker.watch();
            print_view(&updates.borrow_and_update(), me);
            loop {
                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let view = updates.borrow_and_update().clone();
                        println!();
                        print_view(&view, me);
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    Ok(())
}
