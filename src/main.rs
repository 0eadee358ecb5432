use anyhow::{bail, Context, Result};
use bydbox_lib::protocol::{unit_name, SystemInfo, BMU_UNIT_ID};
use bydbox_lib::transport::ModbusTransport;
use bydbox_lib::BydBox;
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod config;
mod daemon;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

macro_rules! print_bmu {
    ($client:expr) => {{
        $client
            .poll_status(BMU_UNIT_ID)
            .await
            .with_context(|| "Cannot get BMU status")?;
        let snapshot = $client.snapshot();
        println!("BMU: {:?}", snapshot.bmu.status);
    }};
}

macro_rules! print_bms {
    ($client:expr, $unit:expr) => {{
        $client
            .poll_status($unit)
            .await
            .with_context(|| format!("Cannot get BMS {} status", $unit))?;
        if let Some(tower) = $client.snapshot().tower($unit) {
            println!("BMS {}: {:?}", $unit, tower.status);
        }
    }};
}

macro_rules! print_log {
    ($client:expr, $unit:expr, $depth:expr) => {{
        let found = $client
            .poll_log($unit, $depth)
            .await
            .with_context(|| format!("Cannot read {} log", unit_name($unit)))?;
        println!("{} log entries read: {}", unit_name($unit), found);
    }};
}

fn print_recent_log(client: &BydBox<ModbusTransport>) {
    for entry in client.snapshot().recent_log {
        println!(
            "{} {} {} {}: {}",
            entry.timestamp, entry.unit, entry.code, entry.description, entry.detail
        );
    }
}

async fn run_command(
    client: &BydBox<ModbusTransport>,
    info: &SystemInfo,
    command: CliCommands,
) -> Result<()> {
    match command {
        CliCommands::Info => println!("Info: {info:#?}"),
        CliCommands::Bmu => print_bmu!(client),
        CliCommands::Bms { unit } => print_bms!(client, unit),
        CliCommands::Log { unit, depth } => {
            print_log!(client, unit, depth);
            print_recent_log(client);
        }
        CliCommands::All => {
            println!("Info: {info:?}");
            print_bmu!(client);
            for unit in 1..=info.towers() {
                print_bms!(client, unit);
            }
            for unit in BMU_UNIT_ID..=info.towers() {
                print_log!(client, unit, 1);
            }
            print_recent_log(client);
        }
        CliCommands::Health => {
            match client.health().probe().await {
                Some(latency) => println!("Latency: {latency:?}"),
                None => println!("Probe failed"),
            }
            println!("Connection: {:?}", client.connection_metrics());
        }
        CliCommands::Daemon { .. } => bail!("Daemon mode is not a single command"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let transport = ModbusTransport::new(args.transport_config());

    match args.command {
        CliCommands::Daemon {
            config_file,
            output,
        } => {
            let config = config::DaemonConfig::load(&config_file)?;
            let client = BydBox::new(transport)
                .with_health_interval(config.health_interval)
                .with_recent_entries(config.recent_entries);
            daemon::run(client, config, output).await
        }
        command => {
            let client = BydBox::new(transport);
            let info = client.initialize().await.with_context(|| {
                format!("Cannot initialize battery box at {}:{}", args.host, args.port)
            })?;
            let result = run_command(&client, &info, command).await;
            client.close().await;
            result
        }
    }
}
