//! Interactive chat client for the echo server.
//!
//! Connects over BLE, sends each stdin line as a message and prints every
//! packet that comes back.

mod ble_client;

use std::time::Duration;

use ble_chat_transport::config::timing;
use ble_chat_transport::protocol::Encoding;
use ble_chat_transport::{LinkConfig, LinkEvent};
use clap::Parser;
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{error::TryRecvError, unbounded_channel};

use ble_client::Session;

/// Poll interval for link events between stdin lines
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "chat-client")]
#[command(about = "Interactive BLE chat client")]
struct Args {
    /// Advertised name of the server
    #[arg(short, long, default_value = "EchoServer")]
    name: String,

    /// BLE scan timeout in seconds
    #[arg(long, default_value = "10")]
    scan_timeout: u64,

    /// Bytes per packet
    #[arg(short, long, default_value = "20")]
    chunk_size: usize,

    /// Accept UTF-8 text instead of ASCII
    #[arg(long)]
    utf8: bool,

    /// Write the CCCD after a settling delay instead of waiting for the local enable
    #[arg(long)]
    settle_delay: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let encoding = if args.utf8 { Encoding::Utf8 } else { Encoding::Ascii };
    let mut config = LinkConfig::default()
        .with_chunk_size(args.chunk_size)
        .with_encoding(encoding);
    if args.settle_delay {
        config = config.with_settle_delay(timing::SUBSCRIBE_SETTLE_MS);
    }

    println!("Scanning for \"{}\"...", args.name);
    let mut session = Session::connect_by_name(&args.name, Duration::from_secs(args.scan_timeout), config).await?;
    println!("{} {}", "Connected to".green(), session.peer());
    println!("Type a message and press enter, Ctrl-D to quit.");

    // Engine calls must not be cancelled halfway, so stdin is read on its own task
    let (line_tx, mut line_rx) = unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    'chat: loop {
        loop {
            match line_rx.try_recv() {
                Ok(line) if line.is_empty() => {}
                Ok(line) => {
                    if let Err(error) = session.send_text(&line).await {
                        println!("{} {}", "!".red().bold(), error);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'chat,
            }
        }

        if let Some(event) = session.poll(POLL_INTERVAL).await {
            if !show(&event, encoding) {
                break;
            }
        }
    }

    if let Err(error) = session.close().await {
        log::warn!("close: {}", error);
    }
    Ok(())
}

/// Print an event, returning false once the link is gone.
fn show(event: &LinkEvent, encoding: Encoding) -> bool {
    match event {
        LinkEvent::PacketReceived(packet) => match packet.text(encoding) {
            Ok(text) => println!("{} {}", "<".cyan().bold(), text.cyan()),
            Err(_) => println!("{} {:02X?}", "<".yellow().bold(), packet.payload()),
        },
        LinkEvent::SendFailed(reason) => println!("{} send failed: {}", "!".red().bold(), reason),
        LinkEvent::SubscriptionChanged { enabled } => println!("notifications {}", if *enabled { "on" } else { "off" }),
        LinkEvent::Disconnected(peer) => {
            println!("{} {}", "Disconnected from".red(), peer);
            return false;
        }
        other => log::debug!("{:?}", other),
    }
    true
}
