use std::io;
use thiserror::Error;

/// Failures of the terminal front end itself.
#[derive(Debug, Error)]
pub enum GuiError {
    /// Drawing to or reading from the terminal failed
    #[error("terminal error: {0}")]
    IOError(#[from] io::Error),

    /// The device selector was opened with nothing to select
    #[error("no serial devices found")]
    NoDevices,
}
