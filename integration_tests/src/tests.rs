//! Integration test cases.

use std::time::Duration;

use ble_chat_transport::link::BootstrapState;
use ble_chat_transport::protocol::Packet;
use ble_chat_transport::LinkEvent;
use colored::Colorize;

use crate::ble_client::Session;

/// How long to keep listening for echoes after a send
const ECHO_WAIT: Duration = Duration::from_secs(2);

/// Test result.
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub message: Option<String>,
}

impl TestResult {
    fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: Some(message.to_string()),
        }
    }
}

/// Print the test name before it runs.
fn start_test(name: &str) {
    print!("  {} ... ", name);
    std::io::Write::flush(&mut std::io::stdout()).ok();
}

/// Print the outcome as it happens.
fn finish_test(name: &str, mut result: TestResult) -> TestResult {
    result.name = name.to_string();

    if result.passed {
        println!("{}", "PASS".green().bold());
    } else {
        println!("{}", "FAIL".red().bold());
        if let Some(msg) = &result.message {
            println!("    {}", msg.red());
        }
    }

    result
}

macro_rules! run_test {
    ($results:ident, $name:expr, $test:expr) => {{
        start_test($name);
        let result = $test.await;
        $results.push(finish_test($name, result));
    }};
}

/// Run all tests and return results.
pub async fn run_all_tests(session: &mut Session) -> Vec<TestResult> {
    let mut results = Vec::new();

    run_test!(results, "Link is ready after bootstrap", test_ready(session));
    run_test!(results, "Short message echoes in one packet", test_single_packet_echo(session));
    run_test!(results, "Long message is split and echoed", test_multi_packet_echo(session));
    run_test!(results, "Read returns the last echoed value", test_read_value(session));
    run_test!(results, "Unsubscribing stops echo notifications", test_unsubscribe(session));
    run_test!(results, "Reconnect reaches ready again", test_reconnect(session));
    run_test!(results, "Echo works after reconnect", test_single_packet_echo(session));

    results
}

/// Print test results summary.
pub fn print_results(results: &[TestResult]) {
    println!("\n{}", "=".repeat(60));
    println!("{}", "Test Results".bold());
    println!("{}", "=".repeat(60));

    let mut passed = 0;
    let mut failed = 0;

    for result in results {
        if result.passed {
            println!("  {} {}", "[PASS]".green().bold(), result.name);
            passed += 1;
        } else {
            println!("  {} {}", "[FAIL]".red().bold(), result.name);
            if let Some(msg) = &result.message {
                println!("         {}", msg.red());
            }
            failed += 1;
        }
    }

    println!("{}", "-".repeat(60));
    println!(
        "  Total: {} passed, {} failed",
        passed.to_string().green(),
        if failed > 0 {
            failed.to_string().red()
        } else {
            failed.to_string().normal()
        }
    );
    println!("{}", "=".repeat(60));
}

/// Collect received packets until none arrives for `quiet`.
async fn collect_packets(session: &mut Session, quiet: Duration) -> Vec<Packet> {
    let mut packets = Vec::new();
    while let Ok(packet) = session.next_packet(quiet).await {
        packets.push(packet);
    }
    packets
}

/// Send `text` and return everything echoed back.
async fn send_and_collect(session: &mut Session, text: &str) -> Result<Vec<Packet>, String> {
    session.discard_pending();
    session.send_text(text).await.map_err(|e| e.to_string())?;
    Ok(collect_packets(session, ECHO_WAIT).await)
}

// --- Individual Tests ---

async fn test_ready(session: &mut Session) -> TestResult {
    let client = session.client();
    if client.state() != BootstrapState::Ready {
        return TestResult::fail("test", &format!("Expected Ready, got {:?}", client.state()));
    }

    match client.link() {
        Some(link) if link.subscription().is_enabled() => TestResult::pass("test"),
        Some(_) => TestResult::fail("test", "Notifications not enabled"),
        None => TestResult::fail("test", "No link"),
    }
}

async fn test_single_packet_echo(session: &mut Session) -> TestResult {
    let packets = match send_and_collect(session, "hi").await {
        Ok(p) => p,
        Err(e) => return TestResult::fail("test", &e),
    };

    let chunk_size = session.client().config().chunk_size;
    match packets.iter().find(|p| p.payload() == b"hi") {
        Some(packet) if packet.len() == chunk_size => TestResult::pass("test"),
        Some(packet) => TestResult::fail(
            "test",
            &format!("Expected {} byte packet, got {}", chunk_size, packet.len()),
        ),
        None => TestResult::fail("test", &format!("No echo of 'hi' in {} packets", packets.len())),
    }
}

async fn test_multi_packet_echo(session: &mut Session) -> TestResult {
    let chunk_size = session.client().config().chunk_size;
    let message: String = (0..45u8).map(|i| char::from(b'a' + i % 26)).collect();
    let expected_tail = &message.as_bytes()[(message.len() - 1) / chunk_size * chunk_size..];

    let packets = match send_and_collect(session, &message).await {
        Ok(p) => p,
        Err(e) => return TestResult::fail("test", &e),
    };

    // Reads can overtake the next write, so only the last value is certain
    match packets.last() {
        Some(last) if last.payload() == expected_tail => TestResult::pass("test"),
        Some(last) => TestResult::fail(
            "test",
            &format!("Last echo {:?}, expected {:?}", last.payload(), expected_tail),
        ),
        None => TestResult::fail("test", "No echo received"),
    }
}

async fn test_read_value(session: &mut Session) -> TestResult {
    if let Err(e) = send_and_collect(session, "ping").await {
        return TestResult::fail("test", &e);
    }

    if let Err(e) = session.client_mut().read_value().await {
        return TestResult::fail("test", &format!("read_value failed: {}", e));
    }

    match session.next_packet(ECHO_WAIT).await {
        Ok(packet) if packet.payload() == b"ping" => TestResult::pass("test"),
        Ok(packet) => TestResult::fail("test", &format!("Read {:?}, expected \"ping\"", packet.payload())),
        Err(e) => TestResult::fail("test", &e.to_string()),
    }
}

async fn test_unsubscribe(session: &mut Session) -> TestResult {
    session.discard_pending();
    if let Err(e) = session.client_mut().set_notifications(false).await {
        return TestResult::fail("test", &format!("set_notifications failed: {}", e));
    }
    if let Err(e) = wait_for_subscription(session, false).await {
        return TestResult::fail("test", &e);
    }

    let result = match send_and_collect(session, "quiet").await {
        Ok(packets) if packets.is_empty() => TestResult::pass("test"),
        Ok(packets) => TestResult::fail("test", &format!("Received {} packets while unsubscribed", packets.len())),
        Err(e) => TestResult::fail("test", &e),
    };

    // Restore notifications for the following tests
    if session.client_mut().set_notifications(true).await.is_ok() {
        if let Err(e) = wait_for_subscription(session, true).await {
            log::warn!("resubscribe: {}", e);
        }
    }

    result
}

async fn wait_for_subscription(session: &mut Session, enabled: bool) -> Result<(), String> {
    match session
        .wait_for(ECHO_WAIT, |e| matches!(e, LinkEvent::SubscriptionChanged { .. }))
        .await
    {
        Ok(LinkEvent::SubscriptionChanged { enabled: now }) if now == enabled => Ok(()),
        Ok(other) => Err(format!("Unexpected event {:?}", other)),
        Err(e) => Err(e.to_string()),
    }
}

async fn test_reconnect(session: &mut Session) -> TestResult {
    if let Err(e) = session.close().await {
        return TestResult::fail("test", &e.to_string());
    }
    if session.client().state() != BootstrapState::Idle {
        return TestResult::fail("test", &format!("Expected Idle, got {:?}", session.client().state()));
    }

    if let Err(e) = session.open().await {
        return TestResult::fail("test", &e.to_string());
    }

    test_ready(session).await
}
