//! Clap derive structures for the `tpbridge` runner.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// tpbridge -- bridge devices to the ThingsPanel platform
#[derive(Debug, Parser)]
#[command(
    name = "tpbridge",
    version,
    about = "Bridge devices to the ThingsPanel IoT platform",
    long_about = "Runs a ThingsPanel protocol plugin: keeps an MQTT session to the\n\
        platform broker, serves the platform's HTTP callbacks and sends\n\
        service heartbeats.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, short = 'c', env = "TPBRIDGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect and run until interrupted
    Run(RunArgs),

    /// Validate the configuration and print the resolved settings
    Check,

    /// Print the default configuration file path
    ConfigPath,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Serve platform callbacks on this address (overrides the config)
    #[arg(long, short = 'l')]
    pub listen: Option<SocketAddr>,
}
