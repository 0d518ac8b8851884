// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cell Tunnel Domain CLI
//!
//! Runs one domain: message bus, optional directory cell, tunnel listener
//! and one self-healing tunnel per peer. Admin commands are read from
//! stdin, one per line (`help` lists them).
//!
//! # Usage
//!
//! ```bash
//! # Head domain hosting the directory
//! celltunnel-domain --domain head --listen 0.0.0.0:11000 --directory serve
//!
//! # Satellite: static tunnel to the head, other peers via its directory
//! celltunnel-domain --domain pool1 --listen 0.0.0.0:11001 \
//!     --peer head=127.0.0.1:11000 --peer pool2 --directory lm@head
//!
//! # Using configuration file
//! celltunnel-domain --config pool1.toml
//! ```

use celltunnel::config::{DirectoryEntryConfig, ListenConfig};
use celltunnel::{ConfigError, Domain, DomainConfig, ForwardingPolicy, PeerConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Cell tunnel domain process
#[derive(Parser, Debug)]
#[command(name = "celltunnel-domain")]
#[command(about = "Cell tunnel domain - self-healing tunnels between message-passing domains")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Domain name
    #[arg(short, long, conflicts_with = "config")]
    domain: Option<String>,

    /// Accept peer domains on this address
    #[arg(short, long, conflicts_with = "config")]
    listen: Option<String>,

    /// Security mode required from connecting peers (none, tls)
    #[arg(long, default_value = "none", conflicts_with = "config")]
    listen_security: String,

    /// Peer domains (format: "domain" or "domain=host:port", can repeat)
    #[arg(short, long, value_delimiter = ',', conflicts_with = "config")]
    peer: Vec<String>,

    /// Directory: "serve" to host one, or the cell to query (e.g. lm@head)
    #[arg(long, conflicts_with = "config")]
    directory: Option<String>,

    /// Outbound policy while a tunnel is down (drop, queue)
    #[arg(long, default_value = "drop", conflicts_with = "config")]
    policy: String,

    /// Statistics logging interval (seconds, 0 to disable)
    #[arg(long, default_value = "0")]
    stats_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "domain.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = Args::parse();

    if let Some(cmd) = args.command.take() {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = build_config(&args)?;

    // Initialize logging
    let level = args.log_level.as_deref().unwrap_or(config.log_level.as_str());
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let domain = Domain::start(config).await?;

    println!("Cell Tunnel Domain v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!();
    println!("Domain: {}", domain.name());
    if let Some(addr) = domain.listen_addr() {
        println!("Listening on {}", addr);
    }
    for tunnel in domain.tunnels().list() {
        println!("Tunnel: {}", tunnel.name());
    }
    println!();
    println!("Type 'help' for admin commands, Ctrl+C to stop...");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;

    let stats_enabled = args.stats_interval > 0;
    let mut stats_tick =
        tokio::time::interval(Duration::from_secs(args.stats_interval.max(1)));
    stats_tick.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                break;
            }
            line = lines.next_line(), if console_open => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line == "quit" || line == "exit" {
                            break;
                        }
                        let output = domain.execute(line);
                        if !output.is_empty() {
                            println!("{}", output);
                        }
                    }
                    Ok(None) => console_open = false,
                    Err(e) => {
                        tracing::warn!("Admin console closed: {}", e);
                        console_open = false;
                    }
                }
            }
            _ = stats_tick.tick(), if stats_enabled => {
                tracing::info!("{}", domain.execute("info"));
            }
        }
    }

    println!("\nShutting down...");
    let totals = domain.tunnels().totals();
    domain.shutdown().await;

    println!("\nFinal Statistics:");
    println!(
        "  to-tunnel={} to-domain={} dropped={} connects={} retries={}",
        totals.messages_to_tunnel,
        totals.messages_to_domain,
        totals.messages_dropped,
        totals.connect_attempts,
        totals.retries
    );

    Ok(())
}

fn build_config(args: &Args) -> Result<DomainConfig, ConfigError> {
    // Load from file if specified
    if let Some(ref config_path) = args.config {
        return DomainConfig::from_file(config_path);
    }

    let name = args
        .domain
        .clone()
        .ok_or_else(|| ConfigError::Invalid("Missing --domain (or use --config)".into()))?;
    let mut config = DomainConfig::new(name);

    if let Some(ref address) = args.listen {
        config.listen = Some(ListenConfig {
            address: address.clone(),
            security: args.listen_security.clone(),
            advertise: None,
        });
    }

    match args.directory.as_deref() {
        Some("serve") => config.directory.serve = true,
        Some(cell) => config.directory.query = cell.to_string(),
        None => {}
    }

    let policy = match args.policy.as_str() {
        "drop" => ForwardingPolicy::Drop,
        "queue" => ForwardingPolicy::Queue,
        other => {
            return Err(ConfigError::Invalid(format!(
                "unknown policy '{}' (expected drop or queue)",
                other
            )))
        }
    };

    for value in &args.peer {
        let mut peer = parse_peer(value)?;
        peer.policy = policy;
        config.peers.push(peer);
    }

    config.validate()?;
    Ok(config)
}

/// `domain` or `domain=host:port`.
fn parse_peer(value: &str) -> Result<PeerConfig, ConfigError> {
    let (domain, address) = match value.split_once('=') {
        Some((domain, address)) if !address.is_empty() => (domain, Some(address)),
        Some(_) => {
            return Err(ConfigError::Invalid(format!(
                "invalid peer '{}' (expected domain=host:port)",
                value
            )))
        }
        None => (value, None),
    };
    let mut peer = PeerConfig::new(domain.trim());
    peer.address = address.map(|a| a.trim().to_string());
    Ok(peer)
}

fn example_config() -> DomainConfig {
    let mut config = DomainConfig::new("pool1");
    config.listen = Some(ListenConfig {
        address: "0.0.0.0:11001".into(),
        security: "none".into(),
        advertise: Some("127.0.0.1:11001".into()),
    });
    config.directory.query = "lm@head".into();

    let mut head = PeerConfig::new("head");
    head.address = Some("127.0.0.1:11000".into());
    head.default_route = true;
    let mut pool2 = PeerConfig::new("pool2");
    pool2.policy = ForwardingPolicy::Queue;
    config.peers = vec![head, pool2];
    config
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let toml_str = toml::to_string_pretty(&example_config())?;

    let mut head = DomainConfig::new("head");
    head.listen = Some(ListenConfig {
        address: "0.0.0.0:11000".into(),
        security: "none".into(),
        advertise: None,
    });
    head.directory.serve = true;
    head.directory.entries.push(DirectoryEntryConfig {
        domain: "archive".into(),
        address: "10.0.0.9:11000".into(),
        security: None,
    });
    let head_str = toml::to_string_pretty(&head)?;

    // Add comments
    let content = format!(
        r#"# Cell Tunnel Domain Configuration
# Generated by celltunnel-domain gen-config
#
# A satellite domain. The head domain that hosts the directory would use:
#
{}

{}
"#,
        head_str
            .lines()
            .map(|l| format!("# {}", l))
            .collect::<Vec<_>>()
            .join("\n"),
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match DomainConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Domain: {}", config.name);
            if let Some(listen) = &config.listen {
                println!("Listen: {} (security={})", listen.address, listen.security);
            }
            if config.directory.serve {
                println!("Directory: serving '{}'", config.directory.cell);
            } else {
                println!("Directory: {}", config.directory.query);
            }
            println!("Peers: {}", config.peers.len());
            for (i, peer) in config.peers.iter().enumerate() {
                println!(
                    "  [{}] {} via {} (security={}, policy={}){}",
                    i,
                    peer.domain,
                    peer.address
                        .as_deref()
                        .or(peer.directory.as_deref())
                        .unwrap_or(config.directory.query.as_str()),
                    peer.security,
                    peer.policy,
                    if peer.default_route { " default route" } else { "" }
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}
