mod cli;
mod error;

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

use tpbridge_config::{config_path, load_config_from, to_bridge_config};
use tpbridge_core::{Bridge, BridgeConfig};

use crate::cli::{Cli, Command, GlobalOpts, RunArgs};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.global.verbose);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::ConfigPath => {
            println!("{}", config_path().display());
            Ok(())
        }
        Command::Check => {
            let config = resolve_config(&cli.global)?;
            print_summary(&config);
            Ok(())
        }
        Command::Run(args) => {
            let config = resolve_config(&cli.global)?;
            run_bridge(config, &args).await
        }
    }
}

fn resolve_config(global: &GlobalOpts) -> Result<BridgeConfig, CliError> {
    let path: PathBuf = global.config.clone().unwrap_or_else(config_path);
    let file = load_config_from(&path).map_err(|e| CliError::config(&path, e))?;
    to_bridge_config(&file).map_err(|e| CliError::config(&path, e))
}

fn print_summary(config: &BridgeConfig) {
    let or_unset = |v: Option<&str>| v.map_or_else(|| "(unset)".to_owned(), str::to_owned);

    println!("broker:             {}", config.broker());
    println!("client id:          {}", config.client_id());
    println!("username:           {}", or_unset(config.username()));
    println!(
        "password:           {}",
        if config.has_password() { "(set)" } else { "(unset)" }
    );
    println!("api base url:       {}", or_unset(config.api_base_url()));
    println!("service identifier: {}", or_unset(config.service_identifier()));
    println!("default qos:        {:?}", config.default_qos());
    println!(
        "callback listen:    {}",
        config
            .callback_addr()
            .map_or_else(|| "(disabled)".to_owned(), |addr| addr.to_string())
    );
    println!("heartbeat interval: {}s", config.heartbeat_interval().as_secs());
}

async fn run_bridge(config: BridgeConfig, args: &RunArgs) -> Result<(), CliError> {
    let broker = config.broker().to_owned();
    let listen = args.listen.or(config.callback_addr());
    let span = info_span!("bridge", client_id = %config.client_id());
    let bridge = Bridge::new(config)?.with_span(span);

    bridge
        .connect()
        .await
        .map_err(|e| CliError::connect(&broker, e))?;
    info!(%broker, "connected");

    if let Some(addr) = listen {
        let bound = bridge.serve_callbacks(addr).await?;
        info!(%bound, "serving platform callbacks");
    }

    if bridge.config().service_identifier().is_some() {
        bridge
            .subscribe_commands(|cmd| {
                info!(
                    device_id = %cmd.device_id,
                    topic = %cmd.message.topic,
                    payload = %cmd.message.payload_str(),
                    "command received"
                );
            })
            .await?;
    } else {
        warn!("no service identifier configured, not subscribing to commands");
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }
    info!("shutting down");
    bridge.shutdown().await?;
    Ok(())
}
