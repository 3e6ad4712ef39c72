//! Runtime settings of the pipeline, with the defaults the rig expects.

use std::{path::PathBuf, time::Duration};

use crate::{
    args::TunnelArgs,
    calibration::{DEFAULT_MATRIX_FILE, DEFAULT_STEP_WINDOW},
    link::DEFAULT_SETTLE,
    ticker::DEFAULT_TICK,
};

/// Everything the controller and its link need to know that is not part of
/// the data.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelConfig {
    /// Where the calibration matrix is loaded from and saved to
    pub calibration_path: PathBuf,
    /// Period of the polling loop
    pub tick: Duration,
    /// Wait after opening the serial port
    pub settle: Duration,
    /// Length of each calibration step's sampling window
    pub step_window: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            calibration_path: PathBuf::from(DEFAULT_MATRIX_FILE),
            tick: DEFAULT_TICK,
            settle: DEFAULT_SETTLE,
            step_window: DEFAULT_STEP_WINDOW,
        }
    }
}

impl From<&TunnelArgs> for TunnelConfig {
    fn from(args: &TunnelArgs) -> Self {
        Self {
            calibration_path: args.calibration.clone(),
            tick: Duration::from_millis(args.tick_ms),
            settle: Duration::from_millis(args.settle_ms),
            step_window: Duration::from_millis(args.window_ms),
        }
    }
}
