//! The terminal front end. None of the pipeline logic lives here: the
//! monitor turns key presses into [`Command`](crate::controller::Command)s
//! and draws whatever the [`Controller`](crate::controller::Controller)
//! reports.

mod device_selector;
mod error;
mod monitor;
mod terminal;

pub use device_selector::device_selector;
pub use error::GuiError;
pub use monitor::run_monitor;
