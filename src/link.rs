//! The connection to the rig.
//!
//! A [`Link`] hands out at most one line per [`poll`](Link::poll) and never
//! blocks waiting for one. [`LineLink`] implements it over anything
//! [`Read`]able: a [`SerialPort`] with a short read timeout in normal use, or
//! a capture file when replaying. [`DummyLink`] makes up plausible frames so
//! the tool can be exercised without hardware.

use log::{debug, info, warn};
use rand::prelude::*;
use serial2::SerialPort;
use std::{
    f64::consts::PI,
    io::{self, Read},
    path::PathBuf,
    str,
    time::{Duration, Instant},
};

use crate::error::TunnelError;

/// How long the Arduino takes to come back after the port opening resets it.
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(2);

/// The rig's default baud rate.
pub const DEFAULT_BAUD: u32 = 9600;

/// Serial read timeout. Short enough that a poll with nothing waiting
/// returns almost immediately.
const READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Bytes without a newline after which we give up on a line.
const MAX_LINE: usize = 4096;

/// Something that produces text lines from the rig.
pub trait Link {
    /// Return the next complete, non-empty, trimmed line if one is available.
    /// Never waits for data.
    fn poll(&mut self) -> Option<String>;

    /// Release the connection. Closing a closed link does nothing.
    fn close(&mut self);

    /// `false` once the link was closed or the device went away.
    fn is_open(&self) -> bool;
}

impl<L: Link + ?Sized> Link for Box<L> {
    fn poll(&mut self) -> Option<String> {
        (**self).poll()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

/// The link type used against real hardware.
pub type SerialLink = LineLink<SerialPort>;

/// Open `port` at `baud`, then wait `settle` for the device to reset.
pub fn open_serial(port: &str, baud: u32, settle: Duration) -> Result<SerialLink, TunnelError> {
    let connection_error = |source: io::Error| TunnelError::Connection {
        port: port.to_owned(),
        source,
    };

    let mut serial = SerialPort::open(port, baud).map_err(connection_error)?;
    serial
        .set_read_timeout(READ_TIMEOUT)
        .map_err(connection_error)?;
    info!("Opened {port} at {baud} baud, settling for {settle:?}");
    spin_sleep::sleep(settle);

    Ok(LineLink::new(serial))
}

/// The serial devices present on this machine.
pub fn available_ports() -> io::Result<Vec<PathBuf>> {
    SerialPort::available_ports()
}

/// Splits a byte stream into lines, one per poll.
#[derive(Debug)]
pub struct LineLink<R> {
    source: Option<R>,
    pending: Vec<u8>,
}

impl<R: Read> LineLink<R> {
    /// Wrap an already open byte source.
    pub fn new(source: R) -> Self {
        Self {
            source: Some(source),
            pending: Vec::new(),
        }
    }

    /// Pull whatever the source has right now into `pending`.
    fn fill(&mut self) {
        let Some(source) = self.source.as_mut() else {
            return;
        };

        let mut buffer = [0; 256];
        match source.read(&mut buffer) {
            Ok(n) => self.pending.extend_from_slice(&buffer[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                warn!("Link read failed, closing: {e}");
                self.close();
            }
        }

        if self.pending.len() > MAX_LINE && !self.pending.contains(&b'\n') {
            warn!("Discarding {} bytes without a line break", self.pending.len());
            self.pending.clear();
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|&c| c == b'\n')?;
        Some(self.pending.drain(..=end).collect())
    }
}

impl<R: Read> Link for LineLink<R> {
    fn poll(&mut self) -> Option<String> {
        if !self.pending.contains(&b'\n') {
            self.fill();
        }
        let raw = self.take_line()?;

        match str::from_utf8(&raw) {
            Ok(s) => {
                let line = s.trim();
                (!line.is_empty()).then(|| line.to_owned())
            }
            // Often happens right after the port opens, while there is still
            // garbage in the device's buffer
            Err(e) => {
                warn!("Failed to decode utf-8: {e}");
                None
            }
        }
    }

    fn close(&mut self) {
        if self.source.take().is_some() {
            info!("Link closed");
        }
    }

    fn is_open(&self) -> bool {
        self.source.is_some()
    }
}

/// A [`Link`] that fabricates frames at a fixed rate.
///
/// The forces follow slow sinusoids. Every so often a channel reports a
/// spurious `0` or a line comes through truncated, like the real rig does.
pub struct DummyLink {
    rng: ThreadRng,
    started: Instant,
    next_due: Instant,
    period: Duration,
    stuck_zero: f64,
    truncated: f64,
    open: bool,
}

impl DummyLink {
    /// A link producing one frame every `period`.
    pub fn new(period: Duration) -> Self {
        let now = Instant::now();
        Self {
            rng: thread_rng(),
            started: now,
            next_due: now,
            period,
            stuck_zero: 0.05,
            truncated: 0.01,
            open: true,
        }
    }

    /// Probability that any given force is reported as `0`.
    pub fn stuck_zero(self, stuck_zero: f64) -> Self {
        Self { stuck_zero, ..self }
    }

    /// Probability that a line is cut short.
    pub fn truncated(self, truncated: f64) -> Self {
        Self { truncated, ..self }
    }

    fn frame(&mut self, t: f64) -> String {
        let velocity = 12.0 + 2.0 * (t * 0.2).sin() + self.rng.gen_range(-0.05..0.05);
        let density = 1.225 + self.rng.gen_range(-0.002..0.002);

        let mut tokens = vec![format!("{velocity:.2}"), format!("{density:.3}")];
        for ch in 0..4 {
            let phase = ch as f64 * PI / 2.0;
            let force = 1.5 + (t * 0.5 + phase).sin() + self.rng.gen_range(-0.02..0.02);
            if self.rng.gen_bool(self.stuck_zero) {
                tokens.push("0".to_owned());
            } else {
                tokens.push(format!("{force:.3}"));
            }
        }

        if self.rng.gen_bool(self.truncated) {
            let keep = self.rng.gen_range(1..tokens.len());
            tokens.truncate(keep);
        }
        tokens.join(" ")
    }
}

impl Link for DummyLink {
    fn poll(&mut self) -> Option<String> {
        let now = Instant::now();
        if !self.open || now < self.next_due {
            return None;
        }
        self.next_due += self.period;
        // Don't try to catch up after a long stall
        if self.next_due < now {
            self.next_due = now + self.period;
        }

        let line = self.frame((now - self.started).as_secs_f64());
        debug!("Dummy frame {line:?}");
        Some(line)
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
