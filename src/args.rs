// Commandline argument parser using clap for WindTunnel

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::{calibration::DEFAULT_MATRIX_FILE, link::DEFAULT_BAUD};

/// Command line of the `windtunnel` binary.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct TunnelArgs {
    #[command(subcommand)]
    /// What to do: list ports, monitor live, or record headless
    pub command: CommandTask,

    /// Calibration matrix file, loaded at startup and written by calibration
    #[arg(short = 'c', long = "calibration", default_value = DEFAULT_MATRIX_FILE)]
    pub calibration: PathBuf,

    /// Polling period of the pipeline, in milliseconds
    #[arg(short = 't', long = "tick-ms", default_value_t = 1)]
    pub tick_ms: u64,

    /// How long to wait after opening the port for the device to reset, in milliseconds
    #[arg(long = "settle-ms", default_value_t = 2000)]
    pub settle_ms: u64,

    /// How long each calibration step samples for, in milliseconds
    #[arg(short = 'w', long = "window-ms", default_value_t = 1000)]
    pub window_ms: u64,
}

#[derive(Debug, Subcommand, Clone)]
#[allow(missing_docs)]
pub enum CommandTask {
    /// List the serial devices on this machine
    #[command(about)]
    Ports,

    /// Show live readings and drive recording and calibration interactively
    #[command(about)]
    Monitor(MonitorCommand),

    /// Record for a fixed time straight to a CSV file, without a UI
    #[command(about)]
    Record(RecordCommand),
}

// Where frames come from. With none of these set, the device selector is
// shown.
#[derive(Debug, Args, Clone)]
#[allow(missing_docs)]
pub struct SourceArgs {
    /// Serial device the rig is attached to, e.g. /dev/ttyACM0 or COM5
    #[arg(short = 'p', long = "port")]
    pub port: Option<String>,

    /// Baud rate of the serial device
    #[arg(short = 'b', long = "baud", default_value_t = DEFAULT_BAUD)]
    pub baud: u32,

    /// Use synthetic frames instead of a device
    #[arg(long, conflicts_with_all = ["port", "replay"])]
    pub dummy: bool,

    /// Replay frames from a capture of the serial stream
    #[arg(long, conflicts_with = "port")]
    pub replay: Option<PathBuf>,
}

// Options of `monitor`
#[derive(Debug, Args, Clone)]
#[allow(missing_docs)]
pub struct MonitorCommand {
    #[command(flatten)]
    pub source: SourceArgs,
}

// Options of `record`
#[derive(Debug, Args, Clone)]
#[allow(missing_docs)]
pub struct RecordCommand {
    #[command(flatten)]
    pub source: SourceArgs,

    /// CSV file the session is written to
    #[arg(short = 'o', long = "out")]
    pub outfile: PathBuf,

    /// How long to record for, in seconds
    #[arg(short = 's', long = "seconds")]
    pub seconds: f64,
}
