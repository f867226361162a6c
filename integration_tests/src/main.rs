//! Integration tests for the echo server firmware.
//!
//! Run after flashing the firmware. Scans for the server over BLE and runs
//! the echo checks against it.

mod ble_client;
mod tests;

use std::time::Duration;

use ble_chat_transport::LinkConfig;
use clap::Parser;
use colored::Colorize;

use ble_client::Session;
use tests::{print_results, run_all_tests};

#[derive(Parser)]
#[command(name = "integration-tests")]
#[command(about = "Integration tests for the BLE echo server")]
struct Args {
    /// Advertised name of the echo server
    #[arg(short, long, default_value = "EchoServer")]
    name: String,

    /// Scan timeout in seconds
    #[arg(short, long, default_value = "10")]
    scan_timeout: u64,

    /// Bytes per packet
    #[arg(short, long, default_value = "20")]
    chunk_size: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    println!("{}", "BLE Echo Integration Tests".bold());
    println!("Device: {}", args.name);
    println!("Chunk size: {}", args.chunk_size);
    println!();

    println!("Scanning for '{}'...", args.name);
    let config = LinkConfig::default().with_chunk_size(args.chunk_size);
    let mut session =
        Session::connect_by_name(&args.name, Duration::from_secs(args.scan_timeout), config).await?;
    println!("{} {}", "Connected to".green(), session.peer());

    println!("\nRunning tests...\n");

    let results = run_all_tests(&mut session).await;
    print_results(&results);

    if let Err(error) = session.close().await {
        log::warn!("close: {}", error);
    }

    // Exit with error code if any tests failed
    let failed = results.iter().filter(|r| !r.passed).count();
    if failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}
