//! echo-client: command-line front end
//!
//! Connects to an echo server, echoes each payload given on the command line
//! (or each line of stdin), prints one line per result and exits non-zero if
//! any echo failed.

use echo_client::config::Config;
use echo_client::transport::TcpTransport;
use echo_client::{EchoClient, EchoOutcome, TracingReporter};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        endpoint = %config.endpoint,
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        count = config.count,
        "Starting echo-client"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let failures = runtime.block_on(run(config))?;

    if failures > 0 {
        warn!(failures, "Some echoes failed");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(config: Config) -> Result<usize, Box<dyn std::error::Error>> {
    let transport = Arc::new(TcpTransport::new(config.transport_options()));
    let (client, session) = EchoClient::spawn(transport, Arc::new(TracingReporter));

    client
        .connect(config.endpoint.host(), Some(i64::from(config.endpoint.port())))
        .await?;

    let mut failures = 0;
    if config.payloads.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if line.is_empty() {
                continue;
            }
            failures += echo_repeatedly(&client, &line, config.count).await?;
        }
    } else {
        for payload in &config.payloads {
            failures += echo_repeatedly(&client, payload, config.count).await?;
        }
    }

    client.disconnect().await?;
    drop(client);
    session.await?;
    Ok(failures)
}

/// Echo `payload` `count` times, printing each result. Returns the failures.
async fn echo_repeatedly(
    client: &EchoClient,
    payload: &str,
    count: usize,
) -> Result<usize, Box<dyn std::error::Error>> {
    let mut failures = 0;
    for _ in 0..count {
        match client.echo(payload.to_string()).await? {
            EchoOutcome::Echoed => println!("OK {} bytes", payload.len()),
            EchoOutcome::Failed(e) => {
                println!("FAILED {}: {}", client.status(), e);
                failures += 1;
            }
            EchoOutcome::Aborted => {
                println!("ABORTED");
                failures += 1;
            }
            EchoOutcome::NotStarted => {
                println!("SKIPPED {}", client.status());
                failures += 1;
            }
        }
    }
    Ok(failures)
}
