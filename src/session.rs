//! Recording sessions and exporting them as CSV.

use log::info;
use serde::Serialize;
use std::{fs::File, io::Write, path::Path, time::Instant};

use crate::{error::TunnelError, Forces};

/// Elapsed times are rounded to this many decimal places.
pub const TIME_DECIMALS: i32 = 2;

/// One exported line: `T,V,F1,F2,F3,F4`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRow {
    /// Seconds since recording started
    #[serde(rename = "T")]
    pub elapsed: f64,
    /// Velocity token exactly as the rig sent it
    #[serde(rename = "V")]
    pub velocity: String,
    /// Calibrated force of load cell 1
    #[serde(rename = "F1")]
    pub f1: f64,
    /// Calibrated force of load cell 2
    #[serde(rename = "F2")]
    pub f2: f64,
    /// Calibrated force of load cell 3
    #[serde(rename = "F3")]
    pub f3: f64,
    /// Calibrated force of load cell 4
    #[serde(rename = "F4")]
    pub f4: f64,
}

impl SessionRow {
    /// The calibrated forces in channel order.
    pub fn forces(&self) -> Forces {
        [self.f1, self.f2, self.f3, self.f4]
    }
}

/// Accumulates calibrated readings while recording is on.
///
/// ```text
/// Idle --start--> Recording --stop--> Idle (rows kept)
/// Recording --start--> Recording (rows discarded)
/// ```
#[derive(Debug, Clone, Default)]
pub struct SessionRecorder {
    rows: Vec<SessionRow>,
    started: Option<Instant>,
    recording: bool,
}

impl SessionRecorder {
    /// An idle recorder with no rows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new session now.
    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    /// Start a new session whose clock starts at `now`, discarding any
    /// previous rows.
    pub fn start_at(&mut self, now: Instant) {
        self.rows.clear();
        self.started = Some(now);
        self.recording = true;
        info!("Recording started");
    }

    /// Stop appending. Rows are kept for export.
    pub fn stop(&mut self) {
        if self.recording {
            info!("Recording stopped with {} rows", self.rows.len());
        }
        self.recording = false;
    }

    /// `true` between `start` and `stop`.
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// The rows of the current (or last) session.
    pub fn rows(&self) -> &[SessionRow] {
        &self.rows
    }

    /// Append a reading taken at `now`. Does nothing unless recording.
    /// Returns whether a row was added.
    pub fn record_at(&mut self, velocity: &str, calibrated: &Forces, now: Instant) -> bool {
        let (true, Some(started)) = (self.recording, self.started) else {
            return false;
        };

        let scale = 10f64.powi(TIME_DECIMALS);
        let elapsed = now.saturating_duration_since(started).as_secs_f64();
        let [f1, f2, f3, f4] = *calibrated;
        self.rows.push(SessionRow {
            elapsed: (elapsed * scale).round() / scale,
            velocity: velocity.to_owned(),
            f1,
            f2,
            f3,
            f4,
        });
        true
    }

    /// Write the session to `path` as CSV, replacing whatever was there.
    pub fn export(&self, path: impl AsRef<Path>) -> Result<(), TunnelError> {
        let path = path.as_ref();
        if self.rows.is_empty() {
            return Err(TunnelError::EmptySession);
        }
        let file = File::create(path).map_err(|e| TunnelError::file_io(path, e))?;
        self.write_to(file)?;
        info!("Data exported to {}", path.display());
        Ok(())
    }

    /// Write the session as CSV with a `T,V,F1,F2,F3,F4` header.
    pub fn write_to(&self, out: impl Write) -> Result<(), TunnelError> {
        if self.rows.is_empty() {
            return Err(TunnelError::EmptySession);
        }
        let mut writer = csv::Writer::from_writer(out);
        for row in &self.rows {
            writer.serialize(row)?;
        }
        writer.flush().map_err(csv::Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, time::Duration};

    #[test]
    fn export_before_start_is_empty() {
        let recorder = SessionRecorder::new();
        let tempfile = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            recorder.export(tempfile.path()),
            Err(TunnelError::EmptySession)
        ));
        assert_eq!(fs::read_to_string(tempfile.path()).unwrap(), "");
    }

    #[test]
    fn nothing_is_recorded_while_idle() {
        let mut recorder = SessionRecorder::new();
        assert!(!recorder.record_at("5.0", &[1.0; 4], Instant::now()));
        assert!(recorder.rows().is_empty());
    }

    #[test]
    fn three_rows_export_four_lines() {
        let t0 = Instant::now();
        let mut recorder = SessionRecorder::new();
        recorder.start_at(t0);
        recorder.record_at("5.0", &[1.0, 2.0, 3.0, 4.0], t0 + Duration::from_millis(100));
        recorder.record_at("5.1", &[1.5, 2.5, 3.5, 4.5], t0 + Duration::from_millis(1234));
        recorder.record_at("5.2", &[-1.0, 0.0, 0.25, 8.0], t0 + Duration::from_millis(2006));

        let tempfile = tempfile::NamedTempFile::new().unwrap();
        recorder.export(tempfile.path()).unwrap();
        let text = fs::read_to_string(tempfile.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines,
            vec![
                "T,V,F1,F2,F3,F4",
                "0.1,5.0,1.0,2.0,3.0,4.0",
                "1.23,5.1,1.5,2.5,3.5,4.5",
                "2.01,5.2,-1.0,0.0,0.25,8.0",
            ]
        );
    }

    #[test]
    fn stop_keeps_rows_and_restart_discards_them() {
        let t0 = Instant::now();
        let mut recorder = SessionRecorder::new();
        recorder.start_at(t0);
        recorder.record_at("1", &[1.0; 4], t0);
        recorder.stop();

        assert!(!recorder.is_recording());
        assert!(!recorder.record_at("2", &[2.0; 4], t0));
        assert_eq!(recorder.rows().len(), 1);

        // Export doesn't consume anything
        let mut out = Vec::new();
        recorder.write_to(&mut out).unwrap();
        assert_eq!(recorder.rows().len(), 1);

        recorder.start_at(t0 + Duration::from_secs(5));
        assert!(recorder.is_recording());
        assert!(recorder.rows().is_empty());
        recorder.record_at("3", &[3.0; 4], t0 + Duration::from_secs(6));
        assert_eq!(recorder.rows()[0].elapsed, 1.0);
        assert_eq!(recorder.rows()[0].forces(), [3.0; 4]);
    }

    #[test]
    fn export_overwrites() {
        let t0 = Instant::now();
        let tempfile = tempfile::NamedTempFile::new().unwrap();
        fs::write(tempfile.path(), "old contents\nthat is longer than the new\n\n\n\n\n").unwrap();

        let mut recorder = SessionRecorder::new();
        recorder.start_at(t0);
        recorder.record_at("7", &[0.5; 4], t0);
        recorder.export(tempfile.path()).unwrap();

        let text = fs::read_to_string(tempfile.path()).unwrap();
        assert_eq!(text, "T,V,F1,F2,F3,F4\n0.0,7,0.5,0.5,0.5,0.5\n");
    }

    #[test]
    fn unwritable_path_is_file_io() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::new();
        recorder.start();
        recorder.record_at("1", &[1.0; 4], Instant::now());

        let res = recorder.export(dir.path().join("missing").join("out.csv"));
        assert!(matches!(res, Err(TunnelError::FileIo { .. })));
    }
}
