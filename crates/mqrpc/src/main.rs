// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mqrpc benchmark CLI
//!
//! Runs an echo service and its clients over the in-process broker and
//! reports call latencies.
//!
//! # Usage
//!
//! ```bash
//! # 1000 request/reply calls from 4 clients
//! mqrpc-bench echo --calls 1000 --clients 4
//!
//! # Calls over one duplex session
//! mqrpc-bench duplex --calls 500
//!
//! # Using a configuration file
//! mqrpc-bench --config mqrpc.toml echo
//!
//! # Generate / check a configuration file
//! mqrpc-bench gen-config --output mqrpc.toml
//! mqrpc-bench validate --file mqrpc.toml
//! ```

use clap::{Parser, Subcommand};
use mqrpc::{
    Address, BrokerRef, ConfigError, DuplexChannel, FaultRecord, HostStatsSnapshot, IncomingCall,
    MemoryBroker, RequestChannel, RpcError, ServiceHost, TransportConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// mqrpc transport benchmark
#[derive(Parser, Debug)]
#[command(name = "mqrpc-bench")]
#[command(about = "mqrpc transport benchmark - request/reply and duplex sessions over an in-process broker")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Request/reply round trips against an echo service
    Echo {
        /// Total number of two-way calls
        #[arg(short = 'n', long, default_value = "1000")]
        calls: usize,

        /// Payload size in bytes
        #[arg(short, long, default_value = "64")]
        payload_size: usize,

        /// Concurrent client channels
        #[arg(long, default_value = "1")]
        clients: usize,
    },

    /// Two-way and one-way calls over a single duplex session
    Duplex {
        /// Number of two-way calls (the same number of one-way calls follows)
        #[arg(short = 'n', long, default_value = "1000")]
        calls: usize,

        /// Payload size in bytes
        #[arg(short, long, default_value = "64")]
        payload_size: usize,
    },

    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "mqrpc.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match args.command {
        Commands::GenConfig { output } => cmd_gen_config(output),
        Commands::Validate { file } => cmd_validate(file),
        Commands::Echo {
            calls,
            payload_size,
            clients,
        } => {
            let config = load_config(args.config.as_ref())?;
            cmd_echo(config, calls, payload_size, clients.max(1)).await
        }
        Commands::Duplex {
            calls,
            payload_size,
        } => {
            let config = load_config(args.config.as_ref())?;
            cmd_duplex(config, calls, payload_size).await
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<TransportConfig, ConfigError> {
    match path {
        Some(path) => TransportConfig::from_file(path),
        None => Ok(TransportConfig::default()),
    }
}

async fn echo(call: IncomingCall) -> Result<Vec<u8>, FaultRecord> {
    Ok(call.payload)
}

fn bench_address() -> Result<Address, RpcError> {
    Address::resolve("localhost", 5672, "Echo", None)
}

async fn cmd_echo(
    config: TransportConfig,
    calls: usize,
    payload_size: usize,
    clients: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let broker: BrokerRef = Arc::new(MemoryBroker::new());
    let address = bench_address()?;
    let host = ServiceHost::start(broker.clone(), address.clone(), config.clone(), echo).await?;

    println!("mqrpc-bench v{}", env!("CARGO_PKG_VERSION"));
    println!("Echo: {} calls, {} clients, {} byte payload", calls, clients, payload_size);
    println!();

    let payload = vec![0x5a; payload_size];
    let started = Instant::now();
    let mut tasks = Vec::with_capacity(clients);
    for i in 0..clients {
        let share = calls / clients + usize::from(i < calls % clients);
        let channel = RequestChannel::new(broker.clone(), address.clone(), config.clone());
        channel.open(config.open_timeout()).await?;

        let payload = payload.clone();
        let send_timeout = config.send_timeout();
        let close_timeout = config.close_timeout();
        tasks.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(share);
            for _ in 0..share {
                let start = Instant::now();
                channel.send(payload.clone(), send_timeout).await?;
                latencies.push(start.elapsed());
            }
            channel.close(close_timeout).await?;
            Ok::<_, RpcError>(latencies)
        }));
    }

    let mut latencies = Vec::with_capacity(calls);
    for task in tasks {
        latencies.extend(task.await??);
    }
    let elapsed = started.elapsed();

    print_latencies("request/reply", &mut latencies, elapsed);
    print_host_stats(&host.stats());
    host.shutdown(config.close_timeout()).await?;
    Ok(())
}

async fn cmd_duplex(
    config: TransportConfig,
    calls: usize,
    payload_size: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let broker: BrokerRef = Arc::new(MemoryBroker::new());
    let address = bench_address()?;
    let host = ServiceHost::start(broker.clone(), address.clone(), config.clone(), echo).await?;

    println!("mqrpc-bench v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "Duplex: {} two-way + {} one-way calls, {} byte payload, {:?} processing",
        calls, calls, payload_size, config.session.concurrency
    );
    println!();

    let session = DuplexChannel::new(broker.clone(), address, config.clone());
    session.open(config.open_timeout()).await?;

    let payload = vec![0xa5; payload_size];
    let started = Instant::now();
    let mut latencies = Vec::with_capacity(calls);
    for _ in 0..calls {
        let start = Instant::now();
        session.call(payload.clone(), config.send_timeout()).await?;
        latencies.push(start.elapsed());
    }
    let two_way_elapsed = started.elapsed();

    let one_way_started = Instant::now();
    for _ in 0..calls {
        session.send_one_way(payload.clone())?;
    }
    let one_way_elapsed = one_way_started.elapsed();

    session.close(config.close_timeout()).await?;

    print_latencies("session two-way", &mut latencies, two_way_elapsed);
    println!(
        "session one-way:  {} published in {:.2?} ({:.0} calls/s)",
        calls,
        one_way_elapsed,
        rate(calls, one_way_elapsed)
    );
    println!();

    host.shutdown(config.close_timeout()).await?;
    print_host_stats(&host.stats());
    Ok(())
}

fn rate(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

fn print_latencies(label: &str, latencies: &mut [Duration], elapsed: Duration) {
    if latencies.is_empty() {
        println!("{}: no calls", label);
        return;
    }

    latencies.sort_unstable();
    let count = latencies.len();
    let total: Duration = latencies.iter().sum();
    let percentile = |p: f64| latencies[((count - 1) as f64 * p).round() as usize];

    println!("{}:", label);
    println!("  Calls:      {} in {:.2?} ({:.0} calls/s)", count, elapsed, rate(count, elapsed));
    println!("  Min:        {:.2?}", latencies[0]);
    println!("  Mean:       {:.2?}", total / count as u32);
    println!("  p50:        {:.2?}", percentile(0.50));
    println!("  p99:        {:.2?}", percentile(0.99));
    println!("  Max:        {:.2?}", latencies[count - 1]);
    println!();
}

fn print_host_stats(stats: &HostStatsSnapshot) {
    println!("Host:");
    println!("  Processed:  {}", stats.requests_processed);
    println!("  Faults:     {}", stats.faults_returned);
    println!("  One-way failures: {}", stats.one_way_failures);
    println!("  Sessions:   {}", stats.sessions_accepted);
    println!("  Reply errors: {}", stats.reply_errors);
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = TransportConfig::default()
        .with_idle_expiry(Some(Duration::from_secs(3600)))
        .with_concurrent_sessions(16);

    let toml_str = config.to_toml_string()?;

    // Add comments
    let content = format!(
        r#"# mqrpc transport configuration
# Generated by mqrpc-bench gen-config

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match TransportConfig::from_file(&path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Open timeout:   {:?}", config.open_timeout());
            println!("Send timeout:   {:?}", config.send_timeout());
            println!("Close timeout:  {:?}", config.close_timeout());
            println!("Accept timeout: {:?}", config.accept_timeout());
            println!(
                "Durable service queues: {}",
                config.queues.durable_service_queues
            );
            match config.idle_expiry() {
                Some(expiry) => println!("Private queue expiry: {:?}", expiry),
                None => println!("Private queue expiry: never"),
            }
            println!(
                "Session processing: {:?} ({} at once)",
                config.session.concurrency,
                config.session.permits()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}
