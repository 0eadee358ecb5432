use anyhow::{Context, Result};
use bydbox_lib::protocol::BMU_UNIT_ID;
use bydbox_lib::snapshot::DeviceSnapshot;
use bydbox_lib::transport::Transport;
use bydbox_lib::BydBox;
use log::{error, info, warn};
use serde_json::json;
use tokio::time::{interval, MissedTickBehavior};

use crate::commandline::OutputFormat;
use crate::config::DaemonConfig;

fn print_console(snapshot: &DeviceSnapshot) {
    println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
    if let Some(status) = &snapshot.bmu.status {
        println!("BMU: {status:?}");
    }
    if let Some(last_log) = &snapshot.bmu.last_log {
        println!("BMU last log: {last_log}");
    }
    for (unit_id, tower) in &snapshot.towers {
        if let Some(status) = &tower.status {
            println!("BMS {unit_id}: {status:?}");
        }
        if let (Some(max), Some(min)) = (tower.max_history_voltage, tower.min_history_voltage) {
            println!("BMS {unit_id} history: max={max} V min={min} V");
        }
        println!("BMS {unit_id} balancing: {:?}", tower.balancing);
        if let Some(last_log) = &tower.last_log {
            println!("BMS {unit_id} last log: {last_log}");
        }
    }
    println!("Log entries: {}", snapshot.log_entries);
    for entry in &snapshot.recent_log {
        println!(
            "  {} {} {} {}: {}",
            entry.timestamp, entry.unit, entry.code, entry.description, entry.detail
        );
    }
    println!("--------------------------");
}

fn output<T: Transport + 'static>(client: &BydBox<T>, format: OutputFormat) {
    let snapshot = client.snapshot();
    match format {
        OutputFormat::Console => {
            print_console(&snapshot);
            println!("Connection: {:?}", client.connection_metrics());
        }
        OutputFormat::Json => {
            let data = json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "snapshot": snapshot,
                "connection": client.connection_metrics(),
            });
            match serde_json::to_string(&data) {
                Ok(payload) => println!("{payload}"),
                Err(e) => error!("Failed to serialize data to JSON string: {e}"),
            }
        }
    }
}

/// Polls the device on the configured schedule until Ctrl-C.
pub async fn run<T: Transport + 'static>(
    client: BydBox<T>,
    config: DaemonConfig,
    format: OutputFormat,
) -> Result<()> {
    info!("Starting daemon mode: output={format:?}, config={config:?}");

    let info = client
        .initialize()
        .await
        .with_context(|| "Cannot initialize battery box")?;
    info!("Battery box initialized: {info:?}");

    let log_file = config.log_json_file();
    if log_file.exists() {
        match client.load_log(&log_file) {
            Ok(entries) => info!("Loaded {entries} log entries from {log_file:?}"),
            Err(e) => warn!("Cannot load log file {log_file:?}: {e}"),
        }
    } else {
        info!("No log file {log_file:?} yet");
    }

    let health = client.start_health_monitor();

    let mut bmu_timer = interval(config.bmu_interval);
    let mut bms_timer = interval(config.bms_interval);
    let mut log_timer = interval(config.log_interval);
    for timer in [&mut bmu_timer, &mut bms_timer, &mut log_timer] {
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Cannot listen for shutdown signal: {e}");
                }
                info!("Shutting down");
                break;
            }
            _ = bmu_timer.tick() => {
                if let Err(e) = client.poll_status(BMU_UNIT_ID).await {
                    error!("Error polling BMU status: {e}");
                }
            }
            _ = bms_timer.tick() => {
                if let Err(e) = client.poll_all_status().await {
                    error!("Error polling BMS status: {e}");
                }
            }
            _ = log_timer.tick() => {
                match client.poll_all_logs().await {
                    Ok(found) => info!("Log round read {found} entries"),
                    Err(e) => error!("Error polling log: {e}"),
                }
                if let Err(e) = client.save_log(&config.log_dir) {
                    error!("Cannot save log to {:?}: {e}", config.log_dir);
                }
            }
        }
        output(&client, format);
    }

    health.stop().await;
    if let Err(e) = client.save_log(&config.log_dir) {
        error!("Cannot save log to {:?}: {e}", config.log_dir);
    }
    client.close().await;
    Ok(())
}
