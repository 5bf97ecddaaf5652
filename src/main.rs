use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use log::info;
use tokio::sync::mpsc;

use companion_core::app::{self, CONTROL_CHANNEL_CAPACITY};
use companion_core::{AppConfig, ConfigManager, DeviceRuntime};

fn cli() -> Command {
    Command::new("companion")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Companion device connectivity core: pairing, host failover, audio streaming and security alerting")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("PATH")
                .help("Configuration file (default: platform config dir)")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .subcommand_required(true)
        .subcommand(Command::new("run").about("Run the full device runtime; type start/stop/reset on stdin"))
        .subcommand(Command::new("pair").about("Pair once against the active host and exit"))
        .subcommand(Command::new("status").about("Print health checks and persisted failover state"))
        .subcommand(
            Command::new("clear-lockdown")
                .about("Leave lockdown (operator action, audited)")
                .arg(
                    Arg::new("operator")
                        .long("operator")
                        .value_name("NAME")
                        .help("Name of the operator clearing the lockdown")
                        .required(true),
                ),
        )
        .subcommand(Command::new("config").about("Print the effective configuration"))
}

fn load_config(matches: &ArgMatches) -> Result<ConfigManager> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => ConfigManager::load_from(path.clone()),
        None => ConfigManager::new(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let matches = cli().get_matches();
    let manager = load_config(&matches)?;
    let config: AppConfig = manager.get_config().clone();
    info!("Using configuration at {}", manager.config_path().display());

    match matches.subcommand() {
        Some(("run", _)) => {
            let runtime = DeviceRuntime::new(config)?;
            let shutdown = runtime.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, shutting down");
                    shutdown.send_replace(true);
                }
            });

            let (tx, rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
            tokio::spawn(app::read_console_controls(tx));
            runtime.run(rx).await?;
        }
        Some(("pair", _)) => {
            let runtime = DeviceRuntime::new(config)?;
            let tokens = runtime.pair_once().await.context("pairing failed")?;
            println!("Paired: {:?}", tokens);
        }
        Some(("status", _)) => {
            let runtime = DeviceRuntime::new(config)?;
            let report = runtime.health_report();
            println!("{}", serde_json::to_string_pretty(&report)?);
            println!("{}", serde_json::to_string_pretty(&runtime.failover_state()?)?);
        }
        Some(("clear-lockdown", sub)) => {
            let operator = sub
                .get_one::<String>("operator")
                .context("--operator is required")?;
            let runtime = DeviceRuntime::new(config)?;
            if runtime.lockdown().clear(operator)? {
                println!("Lockdown cleared by {}", operator);
            } else {
                println!("Device was not in lockdown");
            }
        }
        Some(("config", _)) => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
        _ => {
            cli().print_help()?;
        }
    }

    Ok(())
}
