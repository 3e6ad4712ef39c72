//! WindTunnel reads force measurements from the wind tunnel's load-cell rig.
//! An Arduino on the balance streams one line per sample over a serial port,
//! containing the air velocity, the air density, and the raw output of the
//! four load cells. This crate turns those lines into calibrated forces,
//! shows them live in the terminal, and records sessions to CSV.
//!
//! The pipeline, leaves first:
//!
//! - [`link`] owns the serial port and hands out one line at a time
//! - [`decoder`] turns a line into a [`decoder::Record`]
//! - [`calibration`] maps raw forces to newtons and re-estimates the mapping
//! - [`session`] accumulates time-stamped rows and writes them out
//! - [`controller`] ties the above together and consumes operator commands
//! - [`ticker`] paces the controller independently of any rendering
//!
//! [`gui`] is the terminal front end and [`args`] the command line.

#![warn(missing_docs)]
pub mod args;
pub mod calibration;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod error;
pub mod gui;
pub mod link;
pub mod session;
pub mod ticker;

pub use error::TunnelError;

/// Number of load cells on the balance.
pub const CHANNELS: usize = 4;

/// One value per load cell, in channel order F1..F4.
pub type Forces = [f64; CHANNELS];
