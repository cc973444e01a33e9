// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! ringsense-node - run one ring node.
//!
//! Wires a UDP transport, the simulated sensor fleet and the in-memory
//! reference sink into a [`ringsense::Node`]. Real sensor drivers and a real
//! storage backend plug in through the library's `SensorSource` and
//! `StorageSink` traits; this binary is the field/demo harness.

use chrono::Local;
use clap::Parser;
use ringsense::{
    logging, transport::spawn_udp_receiver, MemorySink, Node, NodeConfig, NodeId, Peer,
    SimulatedSensors, UdpTransport,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Run one ringsense ring node
#[derive(Parser, Debug)]
#[command(name = "ringsense-node")]
#[command(version)]
#[command(about = "Run one token-ring sensor node")]
struct Args {
    /// Node identity (unique in the fleet). Required unless --config is given.
    #[arg(long)]
    id: Option<u32>,

    /// Local bind address, e.g. 192.168.1.10:5500
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// YAML configuration file (flags below are ignored when set)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed a fresh ring with epoch 0 after the startup grace period
    #[arg(long)]
    seed: bool,

    /// Bootstrap contact to join an existing ring, e.g. 192.168.1.11:5500
    #[arg(long)]
    bootstrap: Option<SocketAddr>,

    /// Known peer as "id@host:port"; repeat per peer
    #[arg(long = "peer", value_name = "ID@ADDR")]
    peers: Vec<String>,

    /// Log level: off, error, warn, info, debug, trace
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_peer(spec: &str) -> Result<Peer, String> {
    let (id, addr) = spec
        .split_once('@')
        .ok_or_else(|| format!("peer '{}' is not in id@host:port form", spec))?;
    let id: u32 = id
        .parse()
        .map_err(|_| format!("peer '{}' has a non-numeric id", spec))?;
    let addr: SocketAddr = addr
        .parse()
        .map_err(|_| format!("peer '{}' has a malformed address", spec))?;
    Ok(Peer::new(NodeId(id), addr))
}

fn build_config(args: &Args) -> Result<NodeConfig, String> {
    if let Some(path) = &args.config {
        return ringsense::config::load_config(path).map_err(|e| e.to_string());
    }

    let id = args.id.ok_or("--id is required without --config")?;
    let bind = args.bind.ok_or("--bind is required without --config")?;
    let mut cfg = NodeConfig::new(NodeId(id), bind);
    cfg.seed = args.seed;
    cfg.bootstrap = args.bootstrap;
    for spec in &args.peers {
        cfg.peers.push(parse_peer(spec)?);
    }
    cfg.validate().map_err(|e| e.to_string())?;
    Ok(cfg)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let Some(level) = logging::parse_level(&args.log_level) else {
        eprintln!("unknown log level '{}'", args.log_level);
        return ExitCode::FAILURE;
    };
    logging::init_logger(level);

    // Configuration errors fail fast, before any socket is opened.
    let config = match build_config(&args) {
        Ok(cfg) => cfg,
        Err(msg) => {
            eprintln!("configuration error: {}", msg);
            return ExitCode::FAILURE;
        }
    };

    let transport = match UdpTransport::bind(config.bind_addr) {
        Ok(t) => Arc::new(t),
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    println!(
        "{} ringsense-node v{} | node {} on {}{}{}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        ringsense::VERSION,
        config.node_id,
        config.bind_addr,
        if config.seed { " (seed)" } else { "" },
        config
            .bootstrap
            .map(|b| format!(" joining via {}", b))
            .unwrap_or_default(),
    );

    let node = match Node::builder(config)
        .transport(transport.clone())
        .sensors(Box::new(SimulatedSensors::new()))
        .storage(Arc::new(MemorySink::new()))
        .build()
    {
        Ok(node) => node,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let _receiver = spawn_udp_receiver(
        transport.socket(),
        node.event_sender(),
        node.shutdown_flag(),
    );

    let handle = node.handle();
    if let Err(err) = ctrlc::set_handler(move || {
        log::info!("[node] interrupt received, leaving the ring");
        handle.shutdown();
    }) {
        eprintln!("failed to install signal handler: {}", err);
        return ExitCode::FAILURE;
    }

    match node.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}
