//! The pipeline owner. All mutable state (the link, the zero-substitution
//! cache, the calibration matrix, the session and any calibration in progress)
//! lives in one [`Controller`], which is advanced by [`Controller::tick`] and
//! steered by [`Command`]s. Nothing here knows about the terminal.

use log::{debug, info, warn};
use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use crate::{
    calibration::{CalibrationMatrix, CalibrationProcedure, Calibrator, StepReport},
    config::TunnelConfig,
    decoder::{FrameDecoder, Record},
    error::TunnelError,
    link::Link,
    session::SessionRecorder,
    Forces,
};

/// A decoded record together with its calibrated forces.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// The decoded line, forces as received after zero substitution
    pub record: Record,
    /// The forces after the calibration matrix
    pub calibrated: Forces,
}

/// What the operator can ask of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Begin a new session, discarding the previous one
    StartRecording,
    /// Stop appending to the session
    StopRecording,
    /// Write the session to a CSV file
    Export(PathBuf),
    /// Start the four step calibration. `overwrite` must be set when a
    /// calibration already exists.
    BeginCalibration {
        /// Replace an existing calibration
        overwrite: bool,
    },
    /// Open the sampling window for the next calibration step
    RecordCalibrationStep,
    /// Invert the measured matrix, install it and save it
    FinishCalibration,
    /// Abandon the calibration in progress
    CancelCalibration,
}

/// What a successful [`Command`] did.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Outcome {
    RecordingStarted,
    RecordingStopped,
    Exported { path: PathBuf, rows: usize },
    CalibrationStarted,
    StepStarted { step: usize, window: Duration },
    /// The new matrix, already in use
    CalibrationInstalled(CalibrationMatrix),
    CalibrationCancelled,
}

/// What happened during one tick.
#[derive(Debug, Default)]
pub struct Tick {
    /// The reading decoded this tick, if a valid line arrived
    pub reading: Option<Reading>,
    /// Set when a calibration step window closed this tick
    pub step: Option<Result<StepReport, TunnelError>>,
}

/// Running counts of what came over the link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Non-empty lines received
    pub lines: u64,
    /// Lines that became readings
    pub records: u64,
    /// Lines dropped for having the wrong number of tokens
    pub dropped: u64,
    /// Lines dropped for a non-numeric force
    pub parse_errors: u64,
}

/// Owns the pipeline from link to session.
pub struct Controller<L: Link> {
    link: L,
    decoder: FrameDecoder,
    calibrator: Calibrator,
    session: SessionRecorder,
    calibration: Option<CalibrationProcedure>,
    step_window: Duration,
    stats: PipelineStats,
}

impl<L: Link> Controller<L> {
    /// A controller reading from `link`, with the calibration loaded from
    /// the configured path.
    pub fn new(link: L, config: &TunnelConfig) -> Self {
        Self::with_calibrator(
            link,
            Calibrator::load(&config.calibration_path),
            config.step_window,
        )
    }

    /// A controller with an explicit calibrator.
    pub fn with_calibrator(link: L, calibrator: Calibrator, step_window: Duration) -> Self {
        Self {
            link,
            decoder: FrameDecoder::new(),
            calibrator,
            session: SessionRecorder::new(),
            calibration: None,
            step_window,
            stats: PipelineStats::default(),
        }
    }

    /// Poll the link once and push whatever arrived through the pipeline.
    pub fn tick(&mut self, now: Instant) -> Tick {
        // Close an expired window first so a late frame is not counted in it
        let step = self
            .calibration
            .as_mut()
            .and_then(|procedure| procedure.poll_window(now));
        let reading = self.link.poll().and_then(|line| self.process(&line, now));

        if let Some(Err(e)) = &step {
            warn!("{e}");
        }
        Tick { reading, step }
    }

    fn process(&mut self, line: &str, now: Instant) -> Option<Reading> {
        self.stats.lines += 1;
        let record = match self.decoder.decode(line) {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.stats.dropped += 1;
                debug!("Dropped malformed line {line:?}");
                return None;
            }
            Err(e) => {
                self.stats.parse_errors += 1;
                debug!("Dropped line {line:?}: {e}");
                return None;
            }
        };
        self.stats.records += 1;

        let calibrated = self.calibrator.apply(&record.forces);
        if let Some(procedure) = self.calibration.as_mut() {
            procedure.sample(&record.forces);
        }
        self.session.record_at(&record.velocity, &calibrated, now);

        Some(Reading { record, calibrated })
    }

    /// Carry out an operator command.
    pub fn handle(&mut self, command: Command, now: Instant) -> Result<Outcome, TunnelError> {
        debug!("Handling {command:?}");
        match command {
            Command::StartRecording => {
                self.session.start_at(now);
                Ok(Outcome::RecordingStarted)
            }
            Command::StopRecording => {
                self.session.stop();
                Ok(Outcome::RecordingStopped)
            }
            Command::Export(path) => {
                self.session.export(&path)?;
                Ok(Outcome::Exported {
                    rows: self.session.rows().len(),
                    path,
                })
            }
            Command::BeginCalibration { overwrite } => {
                if self.calibrator.is_calibrated() && !overwrite {
                    return Err(TunnelError::CalibrationExists);
                }
                info!("Calibration started");
                self.calibration = Some(CalibrationProcedure::new(self.step_window));
                Ok(Outcome::CalibrationStarted)
            }
            Command::RecordCalibrationStep => {
                let procedure = self
                    .calibration
                    .as_mut()
                    .ok_or(TunnelError::NotCalibrating)?;
                procedure.begin_step(now)?;
                Ok(Outcome::StepStarted {
                    step: procedure.current_step(),
                    window: self.step_window,
                })
            }
            Command::FinishCalibration => self.finish_calibration(),
            Command::CancelCalibration => {
                self.calibration
                    .take()
                    .ok_or(TunnelError::NotCalibrating)?;
                info!("Calibration cancelled");
                Ok(Outcome::CalibrationCancelled)
            }
        }
    }

    fn finish_calibration(&mut self) -> Result<Outcome, TunnelError> {
        let procedure = self
            .calibration
            .as_ref()
            .ok_or(TunnelError::NotCalibrating)?;
        if procedure.is_sampling() {
            return Err(TunnelError::StepInProgress {
                step: procedure.current_step(),
            });
        }
        if !procedure.is_complete() {
            return Err(TunnelError::CalibrationIncomplete {
                recorded: procedure.recorded(),
            });
        }

        // A complete procedure is spent whether or not it inverts
        let result = procedure.finish();
        self.calibration = None;
        let matrix = result?;

        self.calibrator.install(matrix)?;
        Ok(Outcome::CalibrationInstalled(matrix))
    }

    /// The calibration currently applied.
    pub fn calibrator(&self) -> &Calibrator {
        &self.calibrator
    }

    /// The calibration in progress, if any.
    pub fn calibration(&self) -> Option<&CalibrationProcedure> {
        self.calibration.as_ref()
    }

    /// The current or last recording session.
    pub fn session(&self) -> &SessionRecorder {
        &self.session
    }

    /// Counts of received and dropped lines.
    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// `false` once the link has been closed or lost.
    pub fn link_open(&self) -> bool {
        self.link.is_open()
    }

    /// Release the link. Also happens on drop.
    pub fn close(&mut self) {
        self.link.close();
    }
}

impl<L: Link> Drop for Controller<L> {
    fn drop(&mut self) {
        self.link.close();
    }
}
