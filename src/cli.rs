use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tabled::{Table, Tabled};
use tracing::info;

use ngfw::config::Config;
use ngfw::engine::{create_source, CaptureMethod, Engine};
use ngfw::firewall::{backend_from_config, BlockOutcome, EnforcementGateway, UnblockOutcome};
use ngfw::models::{PacketView, StatusSnapshot};

#[derive(Parser)]
#[command(name = "ngfw")]
#[command(author, version, about = "Real-time network threat detection and automated blocking")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture and analyze traffic until interrupted
    Run {
        /// Interface to capture on (default device if omitted)
        #[arg(short, long, conflicts_with = "read")]
        interface: Option<String>,

        /// Replay a pcap file instead of capturing live
        #[arg(short, long)]
        read: Option<PathBuf>,

        /// Print the final snapshot as JSON
        #[arg(long)]
        json: bool,

        /// Seconds between status lines
        #[arg(long, default_value = "10")]
        interval: u64,
    },

    /// Block an IP address in both directions
    Block {
        /// IP address to block
        ip: IpAddr,
    },

    /// Remove the block rules for an IP address
    Unblock {
        /// IP address to unblock
        ip: IpAddr,
    },

    /// Generate default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Table row for packet listings
#[derive(Tabled)]
struct PacketRow {
    #[tabled(rename = "ID")]
    id: u64,
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Destination")]
    destination: String,
    #[tabled(rename = "Proto")]
    transport: String,
    #[tabled(rename = "Size")]
    size: u32,
    #[tabled(rename = "Detection")]
    method: String,
    #[tabled(rename = "Blocked")]
    blocked: String,
}

impl From<&PacketView> for PacketRow {
    fn from(view: &PacketView) -> Self {
        let endpoint = |ip: Option<IpAddr>, port: Option<u16>| match (ip, port) {
            (Some(ip), Some(port)) => format!("{}:{}", ip, port),
            (Some(ip), None) => ip.to_string(),
            _ => "-".to_string(),
        };

        Self {
            id: view.id,
            time: view.timestamp.format("%H:%M:%S").to_string(),
            source: endpoint(view.src_ip, view.src_port),
            destination: endpoint(view.dst_ip, view.dst_port),
            transport: view.transport.clone(),
            size: view.size,
            method: view.detection_method.clone(),
            blocked: if view.blocked { "yes".to_string() } else { String::new() },
        }
    }
}

/// Load the config named on the command line, or the default search path
pub fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

pub async fn run_command(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Run {
            interface,
            read,
            json,
            interval,
        } => cmd_run(config, interface, read, json, interval).await,
        Commands::Block { ip } => cmd_block(config, ip).await,
        Commands::Unblock { ip } => cmd_unblock(config, ip).await,
        Commands::GenConfig { output } => cmd_gen_config(output),
    }
}

async fn cmd_run(
    mut config: Config,
    interface: Option<String>,
    read: Option<PathBuf>,
    json: bool,
    interval: u64,
) -> Result<()> {
    if let Some(path) = read {
        config.capture.method = CaptureMethod::Pcap;
        config.capture.pcap_file = Some(path);
    } else if let Some(name) = interface {
        config.capture.method = CaptureMethod::Live;
        config.capture.interface = Some(name);
    }

    let backend = backend_from_config(&config.firewall);
    info!("Using {} firewall backend", backend.name());

    let engine = Engine::from_config(&config, backend);
    let source = create_source(&config.capture).context("Failed to open packet source")?;
    let mut handle = engine.start(source, config.capture.channel_capacity)?;

    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    ticker.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut finished = false;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("\nShutting down...");
                engine.stop();
                break;
            }
            _ = &mut handle => {
                finished = true;
                break;
            }
            _ = ticker.tick() => {
                log_status(&engine.snapshot());
            }
        }
    }

    if !finished {
        // A live read returns within the capture timeout once stop is set
        if tokio::time::timeout(Duration::from_secs(5), &mut handle).await.is_err() {
            handle.abort();
        }
    }

    let snapshot = engine.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_snapshot(&snapshot, &engine.blocked_ips());
    }

    if let Some(error) = snapshot.capture_error {
        anyhow::bail!("Capture failed: {}", error);
    }

    Ok(())
}

fn log_status(snapshot: &StatusSnapshot) {
    info!(
        "packets={} threats={} anomalies={} blocked={} model={}",
        snapshot.total_packets,
        snapshot.total_threats,
        snapshot.anomaly_threats,
        snapshot.blocked_count,
        if snapshot.model_trained { "trained" } else { "bootstrapping" }
    );
}

fn print_snapshot(snapshot: &StatusSnapshot, blocked: &[IpAddr]) {
    println!("{}", "Session summary".bold());
    println!("Packets analyzed:  {}", snapshot.total_packets);
    println!("Threats detected:  {}", snapshot.total_threats);
    println!("  by anomaly model: {}", snapshot.anomaly_threats);
    println!(
        "Anomaly model:     {}",
        if snapshot.model_trained {
            "trained".green()
        } else {
            "untrained".yellow()
        }
    );

    if snapshot.recent_threats.is_empty() {
        println!("\nNo threats in the retention window");
    } else {
        println!("\n{}", "Recent threats".bold());
        let rows: Vec<PacketRow> = snapshot.recent_threats.iter().map(PacketRow::from).collect();
        println!("{}", Table::new(rows));
    }

    if blocked.is_empty() {
        println!("\nNo IPs blocked");
    } else {
        println!("\n{} ({})", "Blocked IPs".red().bold(), blocked.len());
        for ip in blocked {
            println!("  {}", ip);
        }
    }
}

async fn cmd_block(config: Config, ip: IpAddr) -> Result<()> {
    let gateway = EnforcementGateway::new(backend_from_config(&config.firewall));

    match gateway.block(ip).await {
        BlockOutcome::Blocked => {
            println!("{} {} (via {})", "Blocked:".green().bold(), ip, gateway.backend_name());
            Ok(())
        }
        BlockOutcome::AlreadyBlocked => {
            println!("{} {} is already blocked", "Note:".yellow().bold(), ip);
            Ok(())
        }
        BlockOutcome::Failed(reason) => anyhow::bail!("Failed to block {}: {}", ip, reason),
    }
}

async fn cmd_unblock(config: Config, ip: IpAddr) -> Result<()> {
    let gateway = EnforcementGateway::new(backend_from_config(&config.firewall));

    // Rules from an earlier run are not in this process's registry
    gateway.adopt(ip);

    match gateway.unblock(ip).await {
        UnblockOutcome::Unblocked => {
            println!("{} {}", "Unblocked:".green().bold(), ip);
            Ok(())
        }
        UnblockOutcome::NotBlocked => {
            println!("{} {} was not blocked", "Note:".yellow().bold(), ip);
            Ok(())
        }
        UnblockOutcome::Failed(reason) => anyhow::bail!("Failed to unblock {}: {}", ip, reason),
    }
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();

    match output {
        Some(path) => {
            config.save(&path)?;
            println!("Configuration written to {}", path.display());
        }
        None => print!("{}", config.to_toml()?),
    }

    Ok(())
}
