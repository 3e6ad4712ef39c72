//! The error taxonomy shared by every stage of the acquisition pipeline.

use std::{io, path::PathBuf};
use thiserror::Error;

use crate::decoder::DecodeError;

/// Everything that can go wrong between the serial port and the CSV file.
///
/// Errors local to a single line ([`TunnelError::Parse`]) are swallowed by
/// the [`Controller`](crate::controller::Controller) and only counted. The
/// rest are handed back to whoever issued the command.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The serial link could not be opened. Fatal at startup.
    #[error("could not open serial link {port}: {source}")]
    Connection {
        /// The device path that was requested
        port: String,
        /// What the OS told us
        source: io::Error,
    },

    /// A frame had the right shape but a non-numeric force.
    #[error("malformed frame: {0}")]
    Parse(#[from] DecodeError),

    /// The measured response matrix cannot be inverted.
    #[error("calibration matrix is singular, repeat the calibration with distinct loads")]
    SingularMatrix,

    /// An export was requested but nothing has been recorded.
    #[error("nothing to export, start recording data first")]
    EmptySession,

    /// Reading or writing a file failed.
    #[error("{}: {source}", path.display())]
    FileIo {
        /// The file we were touching
        path: PathBuf,
        /// The underlying cause
        source: io::Error,
    },

    /// The CSV writer failed while exporting a session.
    #[error("csv export failed: {0}")]
    Csv(#[from] csv::Error),

    /// Calibration was started over an existing one without confirmation.
    #[error("a calibration matrix already exists, confirm to overwrite it")]
    CalibrationExists,

    /// A calibration command arrived while no calibration is running.
    #[error("no calibration in progress")]
    NotCalibrating,

    /// A calibration command arrived while a step window is still open.
    #[error("calibration step {step} is still sampling")]
    StepInProgress {
        /// One-based step number
        step: usize,
    },

    /// A calibration step window closed without receiving any frames.
    #[error("no frames arrived during calibration step {step}, check the link and retry")]
    EmptyCalibrationWindow {
        /// One-based step number
        step: usize,
    },

    /// A calibration matrix file exists but does not hold a 4x4 matrix.
    #[error("{}: not a calibration matrix: {reason}", path.display())]
    MatrixFormat {
        /// The offending file
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// Another step was requested after all four were recorded.
    #[error("all calibration steps are recorded, finish to save")]
    CalibrationComplete,

    /// Finish was requested before all four steps were recorded.
    #[error("calibration needs 4 steps, only {recorded} recorded")]
    CalibrationIncomplete {
        /// How many steps are done
        recorded: usize,
    },
}

impl TunnelError {
    /// Shorthand for wrapping an [`io::Error`] with the path it concerns.
    pub fn file_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::FileIo {
            path: path.into(),
            source,
        }
    }
}
