mod simulate;

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use mtbridge_pubsub::{BridgeConfig, BridgeError, Handle, Manager, Message};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::{fmt, EnvFilter};

use crate::simulate::TickSimulator;

#[derive(Parser)]
#[command(name = "mtbridge")]
#[command(about = "Publish, subscribe to and simulate terminal market-data feeds")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Bridge config file (TOML)
    #[arg(short, long, env = "MTBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a message, optionally several times
    Publish {
        /// Bind address
        #[arg(short, long, default_value = "tcp://*:5556")]
        address: String,

        /// Message topic (e.g. "tick.EURUSD")
        #[arg(short, long)]
        topic: String,

        /// Message payload
        #[arg(short, long)]
        message: String,

        /// Number of sends
        #[arg(long, default_value = "1")]
        count: u64,

        /// Delay between sends
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },

    /// Connect to a publisher and print what arrives
    Subscribe {
        /// Publisher address
        #[arg(short, long, default_value = "tcp://localhost:5556")]
        address: String,

        /// Topic prefix to subscribe to (repeatable)
        #[arg(short, long)]
        topic: Vec<String>,

        /// Receive timeout per wait
        #[arg(long, default_value = "1000")]
        timeout_ms: u64,

        /// Stop after this many messages
        #[arg(long)]
        max: Option<usize>,

        /// Print one JSON object per message
        #[arg(long)]
        json: bool,
    },

    /// Publish random-walk ticks for a set of symbols
    Simulate {
        /// Bind address
        #[arg(short, long, default_value = "tcp://*:5556")]
        address: String,

        /// Symbols to quote
        #[arg(short, long, value_delimiter = ',', default_value = "EURUSD,GBPUSD,USDJPY")]
        symbols: Vec<String>,

        /// Delay between rounds of ticks
        #[arg(long, default_value = "500")]
        interval_ms: u64,

        /// Stop after this many rounds
        #[arg(long)]
        count: Option<u64>,

        /// Seed for a reproducible walk
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print the bridge version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Commands::Version = cli.command {
        println!("mtbridge {}", mtbridge_pubsub::version());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    let manager = Arc::new(Manager::new(config));
    manager.init()?;

    let result = match cli.command {
        Commands::Publish {
            address,
            topic,
            message,
            count,
            interval_ms,
        } => run_publish(&manager, &address, &topic, &message, count, interval_ms).await,
        Commands::Subscribe {
            address,
            topic,
            timeout_ms,
            max,
            json,
        } => run_subscribe(Arc::clone(&manager), &address, topic, timeout_ms, max, json).await,
        Commands::Simulate {
            address,
            symbols,
            interval_ms,
            count,
            seed,
        } => run_simulate(&manager, &address, &symbols, interval_ms, count, seed).await,
        Commands::Version => Ok(()),
    };

    manager.terminate();
    result
}

async fn run_publish(
    manager: &Manager,
    address: &str,
    topic: &str,
    message: &str,
    count: u64,
    interval_ms: u64,
) -> Result<()> {
    let handle = manager.create_publisher(address)?;
    tracing::info!(%address, %handle, "Publishing");

    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    for n in 1..=count {
        interval.tick().await;
        let report = manager.send(handle, topic.as_bytes(), message.as_bytes())?;
        tracing::info!(
            n,
            peers = report.peers,
            delivered = report.delivered,
            evicted = report.evicted,
            "Sent"
        );
    }

    Ok(())
}

async fn run_subscribe(
    manager: Arc<Manager>,
    address: &str,
    topics: Vec<String>,
    timeout_ms: u64,
    max: Option<usize>,
    json: bool,
) -> Result<()> {
    let handle = manager.create_subscriber(address)?;
    for topic in &topics {
        manager.subscribe(handle, topic.as_bytes())?;
    }
    let subscribed: Vec<String> = manager
        .subscriptions(handle)?
        .iter()
        .map(|t| String::from_utf8_lossy(t).into_owned())
        .collect();
    tracing::info!(%address, %handle, topics = ?subscribed, "Subscribed");

    let stop = Arc::new(AtomicBool::new(false));
    let mut worker = {
        let manager = Arc::clone(&manager);
        let stop = Arc::clone(&stop);
        let timeout = Duration::from_millis(timeout_ms);
        tokio::task::spawn_blocking(move || receive_loop(&manager, handle, timeout, max, json, &stop))
    };

    let received = tokio::select! {
        done = &mut worker => done??,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, closing subscriber");
            stop.store(true, Ordering::SeqCst);
            // Closing wakes the blocked receive.
            let _ = manager.close(handle);
            worker.await??
        }
    };

    tracing::info!(received, "Subscriber finished");
    Ok(())
}

fn receive_loop(
    manager: &Manager,
    handle: Handle,
    timeout: Duration,
    max: Option<usize>,
    json: bool,
    stop: &AtomicBool,
) -> Result<usize> {
    let mut received = 0;
    while !stop.load(Ordering::SeqCst) && max.map_or(true, |max| received < max) {
        match manager.receive(handle, timeout) {
            Ok(msg) => {
                received += 1;
                print_message(&msg, json)?;
            }
            Err(BridgeError::Timeout) => continue,
            // Interrupted: the handle was closed under us.
            Err(_) if stop.load(Ordering::SeqCst) => break,
            Err(e) => return Err(e).context("Receive failed"),
        }
    }
    Ok(received)
}

fn print_message(msg: &Message, json: bool) -> Result<()> {
    if json {
        let line = serde_json::json!({
            "topic": msg.topic_str(),
            "payload": msg.payload_str(),
            "received_at": Utc::now(),
        });
        println!("{}", serde_json::to_string(&line)?);
    } else {
        println!("{} {}", msg.topic_str(), msg.payload_str());
    }
    Ok(())
}

async fn run_simulate(
    manager: &Manager,
    address: &str,
    symbols: &[String],
    interval_ms: u64,
    count: Option<u64>,
    seed: Option<u64>,
) -> Result<()> {
    if symbols.is_empty() {
        anyhow::bail!("No symbols to simulate");
    }

    let handle = manager.create_publisher(address)?;
    let rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
    let mut simulator = TickSimulator::new(symbols, rng);
    tracing::info!(%address, %handle, symbols = ?symbols, "Simulating ticks");

    let interval = Duration::from_millis(interval_ms.max(1));
    let rounds = publish_ticks(
        manager,
        handle,
        &mut simulator,
        interval,
        count,
        tokio::signal::ctrl_c(),
    )
    .await?;

    tracing::info!(rounds, "Simulation finished");
    Ok(())
}

/// Publish one round of ticks per interval until `count` rounds are done or
/// `shutdown` resolves. Returns the rounds published.
async fn publish_ticks<R, S>(
    manager: &Manager,
    handle: Handle,
    simulator: &mut TickSimulator<R>,
    period: Duration,
    count: Option<u64>,
    shutdown: S,
) -> Result<u64>
where
    R: rand::Rng,
    S: Future,
{
    // One future for the whole run, so a signal during sends is not lost.
    tokio::pin!(shutdown);
    let mut interval = tokio::time::interval(period);
    let mut rounds = 0u64;
    loop {
        if count.is_some_and(|count| rounds >= count) {
            break;
        }
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Interrupted");
                break;
            }
            _ = interval.tick() => {}
        }

        let mut delivered = 0;
        for tick in simulator.step(Utc::now()) {
            let payload = serde_json::to_vec(&tick)?;
            delivered += manager.send(handle, tick.topic().as_bytes(), &payload)?.delivered;
        }
        rounds += 1;
        tracing::debug!(round = rounds, delivered, "Published ticks");
    }
    Ok(rounds)
}
