// Copyright (c) 2024 Botho Foundation

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf};

use ghostline::{commands, config, identity::DeviceId, network::ConnectTarget, telemetry};

#[derive(Parser)]
#[command(name = "ghostline")]
#[command(about = "Device-bound, serverless peer-to-peer secure messaging", long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.ghostline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the device key and a default config
    Init {
        /// Name this device shows
        #[arg(long)]
        name: Option<String>,
    },

    /// Show this device's id, fingerprint and contact card
    Identity,

    /// Change the name this device shows
    SetName {
        name: String,
    },

    /// Trust a peer's contact card
    AddPeer {
        /// Encoded contact card
        card: String,

        /// Name to show for this peer
        #[arg(long)]
        label: Option<String>,

        /// Address to try before a rendezvous lookup
        #[arg(long)]
        address: Option<SocketAddr>,
    },

    /// Run the messenger: print received messages, send stdin lines
    Run {
        /// Connect to a manually entered address
        #[arg(long, value_name = "DEVICE_ID@ADDR", value_parser = commands::run::parse_connect_target, conflicts_with = "lookup")]
        connect: Option<ConnectTarget>,

        /// Connect to a peer resolved through the rendezvous service
        #[arg(long, value_name = "DEVICE_ID")]
        lookup: Option<DeviceId>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init_tracing(cli.verbose)?;

    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_config_path()?,
    };

    match cli.command {
        Commands::Init { name } => commands::init::run(&config_path, name.as_deref()),
        Commands::SetName { name } => commands::set_name::run(&config_path, &name),
        Commands::Identity => commands::identity::run(&config_path),
        Commands::AddPeer { card, label, address } => {
            commands::add_peer::run(&config_path, &card, label, address)
        }
        Commands::Run { connect, lookup } => {
            let target = connect.or(lookup.map(ConnectTarget::Lookup));
            commands::run::run(&config_path, target)
        }
    }
}
