use crate::config::DaemonConfig;
use bydbox_lib::transport::{Framing, TransportConfig};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show device information: serial number, firmware, model, towers, modules and capacity
    Info,
    /// Show the BMU status: SOC, SOH, cell voltage range, current, power and errors
    Bmu,
    /// Show the status of one tower: cell voltages, temperatures, balancing, warnings and errors
    Bms {
        /// Tower number, starting at 1
        unit: u8,
    },
    /// Read and decode the newest event log entries of a unit
    Log {
        /// 0 for the BMU, the tower number otherwise
        unit: u8,
        /// Number of 20 entry pages to read
        #[clap(long, short, default_value_t = 1)]
        depth: usize,
    },
    /// Show all available information by reading the BMU, every tower and their newest log entries
    All,
    /// Measure the latency of a single register read
    Health,
    /// Run in daemon mode, periodically polling status and log and printing the snapshot
    Daemon {
        /// The daemon configuration file, defaults are used if it does not exist
        #[arg(long, default_value_t = DaemonConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format of every update
        #[arg(long, value_enum, default_value_t = OutputFormat::Console)]
        output: OutputFormat,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Console,
    Json,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum CliFraming {
    /// Modbus TCP
    Tcp,
    /// Modbus RTU frames inside the TCP stream
    Rtu,
}

impl From<CliFraming> for Framing {
    fn from(framing: CliFraming) -> Self {
        match framing {
            CliFraming::Tcp => Framing::Tcp,
            CliFraming::Rtu => Framing::Rtu,
        }
    }
}

const fn about_text() -> &'static str {
    "BYD Battery-Box command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Host name or IP address of the BMU
    #[arg(long, default_value = "192.168.16.254")]
    pub host: String,

    /// Modbus port of the BMU
    #[arg(short, long, default_value_t = TransportConfig::DEFAULT_PORT)]
    pub port: u16,

    /// Modbus slave id
    #[arg(short, long, default_value_t = TransportConfig::DEFAULT_SLAVE)]
    pub slave: u8,

    /// Modbus framing inside the TCP connection
    #[arg(long, value_enum, default_value_t = CliFraming::Rtu)]
    pub framing: CliFraming,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for a single Modbus request (e.g., "500ms", "5s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "5s")]
    pub timeout: Duration,

    /// Delay before a failed request is retried (e.g., "200ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "200ms")]
    pub delay: Duration,

    /// Number of retries for failed requests
    #[arg(long, default_value = "3")]
    pub retries: u8,
}

impl CliArgs {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            slave: self.slave,
            framing: self.framing.into(),
            io_timeout: self.timeout,
            retries: self.retries,
            retry_delay: self.delay,
            ..TransportConfig::new(format!("{}:{}", self.host, self.port))
        }
    }
}
