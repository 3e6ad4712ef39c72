//! The calibration matrix, its text file, and the four step procedure that
//! re-estimates it.
//!
//! Each row of the matrix holds the coefficients for one calibrated channel,
//! so `calibrated = M * raw`. The procedure loads each load cell in turn with
//! a unit force, averages the raw response of all four cells over a fixed
//! window, stacks the four averaged responses into a matrix, and inverts it.

use log::{debug, info, warn};
use nalgebra::{Matrix4, Vector4};
use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use crate::{error::TunnelError, Forces, CHANNELS};

/// Where the matrix lives unless the command line says otherwise.
pub const DEFAULT_MATRIX_FILE: &str = "calibration_matrix.txt";

/// How long each calibration step samples for.
pub const DEFAULT_STEP_WINDOW: Duration = Duration::from_secs(1);

/// Ratio of smallest to largest singular value below which the response
/// matrix is treated as singular. Independent of each channel's gain.
const SINGULAR_RCOND: f64 = 1e-12;

/// A 4x4 map from raw load-cell outputs to physical forces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationMatrix(Matrix4<f64>);

impl Default for CalibrationMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

impl CalibrationMatrix {
    /// The uncalibrated passthrough.
    pub fn identity() -> Self {
        Self(Matrix4::identity())
    }

    /// Build a matrix from its rows.
    pub fn from_rows(rows: &[Forces; CHANNELS]) -> Self {
        Self(Matrix4::from_fn(|i, j| rows[i][j]))
    }

    /// The rows of the matrix, top to bottom.
    pub fn rows(&self) -> [Forces; CHANNELS] {
        std::array::from_fn(|i| std::array::from_fn(|j| self.0[(i, j)]))
    }

    /// `self * raw`. Magnitudes are not checked.
    pub fn apply(&self, raw: &Forces) -> Forces {
        let calibrated = self.0 * Vector4::from(*raw);
        std::array::from_fn(|i| calibrated[i])
    }

    /// The inverse of a measured response matrix, or
    /// [`TunnelError::SingularMatrix`] if it has none.
    pub fn inverse_of(measured: &CalibrationMatrix) -> Result<Self, TunnelError> {
        let m = measured.0;
        if !m.iter().all(|v| v.is_finite()) {
            return Err(TunnelError::SingularMatrix);
        }
        let sv = m.svd(false, false).singular_values;
        let (smin, smax) = (sv.min(), sv.max());
        if smax == 0.0 || smin / smax < SINGULAR_RCOND {
            return Err(TunnelError::SingularMatrix);
        }

        m.try_inverse()
            .filter(|inv| inv.iter().all(|v| v.is_finite()))
            .map(Self)
            .ok_or(TunnelError::SingularMatrix)
    }

    /// Read a matrix file. Values may be separated by commas, whitespace, or
    /// both; blank lines and `#` comments are skipped.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TunnelError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| TunnelError::file_io(path, e))?;
        Self::parse(&text).map_err(|reason| TunnelError::MatrixFormat {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Write the matrix as four lines of comma separated floats.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TunnelError> {
        let path = path.as_ref();
        fs::write(path, self.to_text()).map_err(|e| TunnelError::file_io(path, e))
    }

    fn to_text(&self) -> String {
        self.rows()
            .iter()
            .map(|row| {
                let cols: Vec<String> = row.iter().map(|v| scientific(*v, 18)).collect();
                cols.join(",") + "\n"
            })
            .collect()
    }

    fn parse(text: &str) -> Result<Self, String> {
        let rows = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .enumerate()
            .map(|(i, line)| {
                let values = line
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|v| !v.is_empty())
                    .map(|v| {
                        v.parse::<f64>()
                            .map_err(|_| format!("row {}: {v:?} is not a number", i + 1))
                    })
                    .collect::<Result<Vec<f64>, String>>()?;
                Forces::try_from(values.as_slice()).map_err(|_| {
                    format!("row {} has {} values, expected {CHANNELS}", i + 1, values.len())
                })
            })
            .collect::<Result<Vec<Forces>, String>>()?;

        let rows: [Forces; CHANNELS] = rows
            .as_slice()
            .try_into()
            .map_err(|_| format!("{} rows, expected {CHANNELS}", rows.len()))?;
        Ok(Self::from_rows(&rows))
    }
}

impl Display for CalibrationMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, row) in self.rows().iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  [")?;
            for v in row {
                write!(f, " {:>10}", scientific(*v, 3))?;
            }
            write!(f, " ]")?;
        }
        Ok(())
    }
}

/// `v` in C-style scientific notation, with a signed exponent of at least
/// two digits (`1.50e+00`), as numpy writes it.
fn scientific(v: f64, precision: usize) -> String {
    let rust = format!("{v:.precision$e}");
    match rust.split_once('e') {
        Some((mantissa, exp)) => match exp.parse::<i32>() {
            Ok(exp) => format!("{mantissa}e{exp:+03}"),
            Err(_) => rust,
        },
        None => rust,
    }
}

/// The active matrix, where it is persisted, and whether it came from a real
/// calibration. Being uncalibrated only changes how readings are labelled.
#[derive(Debug, Clone)]
pub struct Calibrator {
    matrix: CalibrationMatrix,
    calibrated: bool,
    path: PathBuf,
}

impl Calibrator {
    /// Load the matrix at `path`, falling back to identity (uncalibrated) if
    /// the file is missing or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match CalibrationMatrix::load(&path) {
            Ok(matrix) => {
                info!("Loaded calibration matrix from {}", path.display());
                debug!("Calibration matrix:\n{matrix}");
                Self {
                    matrix,
                    calibrated: true,
                    path,
                }
            }
            Err(e) => {
                warn!("Running uncalibrated: {e}");
                Self::uncalibrated(path)
            }
        }
    }

    /// An identity calibrator that will persist to `path`.
    pub fn uncalibrated(path: impl Into<PathBuf>) -> Self {
        Self {
            matrix: CalibrationMatrix::identity(),
            calibrated: false,
            path: path.into(),
        }
    }

    /// The matrix currently applied to readings.
    pub fn matrix(&self) -> &CalibrationMatrix {
        &self.matrix
    }

    /// `true` once a matrix was loaded or a procedure completed.
    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    /// The file the matrix is loaded from and saved to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Calibrate one raw reading.
    pub fn apply(&self, raw: &Forces) -> Forces {
        self.matrix.apply(raw)
    }

    /// Make `matrix` the active one, then persist it. A failed write is
    /// reported but the new matrix stays active.
    pub fn install(&mut self, matrix: CalibrationMatrix) -> Result<(), TunnelError> {
        self.matrix = matrix;
        self.calibrated = true;
        info!("Installed new calibration matrix:\n{matrix}");
        matrix.save(&self.path)?;
        info!("Saved calibration matrix to {}", self.path.display());
        Ok(())
    }
}

/// Mean and spread of the raw forces seen during one calibration step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepStats {
    /// Per-channel mean; this becomes a row of the response matrix
    pub mean: Forces,
    /// Per-channel sample standard deviation, for the operator only
    pub std_dev: Forces,
    /// How many frames the window caught
    pub samples: usize,
}

impl StepStats {
    /// Statistics over `samples`, or `None` if there are none.
    pub fn from_samples(samples: &[Forces]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;

        let mean: Forces =
            std::array::from_fn(|ch| samples.iter().map(|s| s[ch]).sum::<f64>() / n);
        let std_dev: Forces = std::array::from_fn(|ch| {
            if samples.len() < 2 {
                return 0.0;
            }
            let ss: f64 = samples.iter().map(|s| (s[ch] - mean[ch]).powi(2)).sum();
            (ss / (n - 1.0)).sqrt()
        });

        Some(Self {
            mean,
            std_dev,
            samples: samples.len(),
        })
    }
}

/// Emitted when a step window closes successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// One-based step number, which is also the loaded channel
    pub step: usize,
    /// What was measured
    pub stats: StepStats,
}

#[derive(Debug, Clone)]
struct StepWindow {
    deadline: Instant,
    samples: Vec<Forces>,
}

/// The guided four step re-estimation of the calibration matrix.
///
/// The procedure never touches the active matrix. Its result is handed to
/// [`Calibrator::install`] by the caller once [`finish`](Self::finish)
/// succeeds.
#[derive(Debug, Clone)]
pub struct CalibrationProcedure {
    rows: Vec<Forces>,
    window: Option<StepWindow>,
    window_len: Duration,
}

impl CalibrationProcedure {
    /// A fresh procedure whose steps each sample for `window_len`.
    pub fn new(window_len: Duration) -> Self {
        Self {
            rows: Vec::with_capacity(CHANNELS),
            window: None,
            window_len,
        }
    }

    /// One-based number of the step that is sampling or will sample next.
    pub fn current_step(&self) -> usize {
        (self.rows.len() + 1).min(CHANNELS)
    }

    /// How many steps have been recorded.
    pub fn recorded(&self) -> usize {
        self.rows.len()
    }

    /// `true` while a step window is open.
    pub fn is_sampling(&self) -> bool {
        self.window.is_some()
    }

    /// `true` once all four rows are in.
    pub fn is_complete(&self) -> bool {
        self.rows.len() == CHANNELS
    }

    /// Open the window for the next step.
    pub fn begin_step(&mut self, now: Instant) -> Result<(), TunnelError> {
        if self.is_complete() {
            return Err(TunnelError::CalibrationComplete);
        }
        if self.window.is_some() {
            return Err(TunnelError::StepInProgress {
                step: self.current_step(),
            });
        }
        debug!(
            "Calibration step {} sampling for {:?}",
            self.current_step(),
            self.window_len
        );
        self.window = Some(StepWindow {
            deadline: now + self.window_len,
            samples: Vec::new(),
        });
        Ok(())
    }

    /// Add a raw reading to the open window, if there is one.
    pub fn sample(&mut self, raw: &Forces) {
        if let Some(window) = self.window.as_mut() {
            window.samples.push(*raw);
        }
    }

    /// Close the window if its deadline has passed.
    ///
    /// Returns `None` while no window is due. A window that caught nothing
    /// yields [`TunnelError::EmptyCalibrationWindow`] and the step can be
    /// retried.
    pub fn poll_window(&mut self, now: Instant) -> Option<Result<StepReport, TunnelError>> {
        if now < self.window.as_ref()?.deadline {
            return None;
        }
        let window = self.window.take()?;
        let step = self.current_step();

        let Some(stats) = StepStats::from_samples(&window.samples) else {
            return Some(Err(TunnelError::EmptyCalibrationWindow { step }));
        };

        for (ch, (mean, std)) in stats.mean.iter().zip(stats.std_dev.iter()).enumerate() {
            info!("Step {step} F{}: avg={mean:.4}, std={std:.4}", ch + 1);
        }
        self.rows.push(stats.mean);
        Some(Ok(StepReport { step, stats }))
    }

    /// Invert the measured response matrix.
    pub fn finish(&self) -> Result<CalibrationMatrix, TunnelError> {
        let rows: &[Forces; CHANNELS] = self.rows.as_slice().try_into().map_err(|_| {
            TunnelError::CalibrationIncomplete {
                recorded: self.rows.len(),
            }
        })?;
        let measured = CalibrationMatrix::from_rows(rows);
        debug!("Measured response matrix:\n{measured}");
        CalibrationMatrix::inverse_of(&measured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRUE_RESPONSE: [Forces; CHANNELS] = [
        [2.0, 0.1, 0.0, -0.2],
        [0.3, 1.5, 0.05, 0.0],
        [0.0, -0.1, 0.8, 0.2],
        [0.1, 0.0, 0.4, 1.2],
    ];

    fn assert_close(a: &CalibrationMatrix, b: &CalibrationMatrix) {
        for (ra, rb) in a.rows().iter().zip(b.rows().iter()) {
            for (x, y) in ra.iter().zip(rb.iter()) {
                assert!((x - y).abs() < 1e-9, "{a}\n!=\n{b}");
            }
        }
    }

    #[test]
    fn identity_passes_through() {
        let m = CalibrationMatrix::identity();
        for x in [[0.0; 4], [1.0, -2.0, 3.5, 1e6], [f64::MIN_POSITIVE, 0.0, -0.0, 7.25]] {
            assert_eq!(m.apply(&x), x);
        }
    }

    #[test]
    fn apply_is_matrix_vector_product() {
        let m = CalibrationMatrix::from_rows(&[
            [1.0, 2.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 3.0],
            [1.0, 1.0, 1.0, 1.0],
        ]);
        assert_eq!(m.apply(&[1.0, 1.0, 2.0, 4.0]), [3.0, 1.0, 12.0, 8.0]);
    }

    #[test]
    fn inverse_of_identical_rows_is_singular() {
        let mut rows = TRUE_RESPONSE;
        rows[2] = rows[1];
        let res = CalibrationMatrix::inverse_of(&CalibrationMatrix::from_rows(&rows));
        assert!(matches!(res, Err(TunnelError::SingularMatrix)));

        let zero = CalibrationMatrix::from_rows(&[[0.0; 4]; 4]);
        assert!(matches!(
            CalibrationMatrix::inverse_of(&zero),
            Err(TunnelError::SingularMatrix)
        ));
    }

    #[test]
    fn inverts_unevenly_scaled_channels() {
        let m = CalibrationMatrix::from_rows(&[
            [20000.0, 0.0, 0.0, 0.0],
            [0.0, 0.5, 0.0, 0.0],
            [0.0, 0.0, 0.5, 0.0],
            [0.0, 0.0, 0.0, 0.5],
        ]);
        let inv = CalibrationMatrix::inverse_of(&m).unwrap();
        assert_close(
            &inv,
            &CalibrationMatrix::from_rows(&[
                [5e-5, 0.0, 0.0, 0.0],
                [0.0, 2.0, 0.0, 0.0],
                [0.0, 0.0, 2.0, 0.0],
                [0.0, 0.0, 0.0, 2.0],
            ]),
        );

        // A tiny but healthy cell is fine as well
        let mut rows = TRUE_RESPONSE;
        rows[3] = rows[3].map(|v| v * 1e-6);
        assert!(CalibrationMatrix::inverse_of(&CalibrationMatrix::from_rows(&rows)).is_ok());
    }

    #[test]
    fn save_and_load() {
        let tempfile = tempfile::NamedTempFile::new().unwrap();
        let m = CalibrationMatrix::from_rows(&TRUE_RESPONSE);
        m.save(tempfile.path()).unwrap();

        let text = fs::read_to_string(tempfile.path()).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert!(text.lines().all(|l| l.split(',').count() == 4));
        assert!(text.starts_with("2.000000000000000000e+00,1.000000000000000056e-01,"));

        assert_eq!(CalibrationMatrix::load(tempfile.path()).unwrap(), m);
    }

    #[test]
    fn scientific_matches_c_exponents() {
        assert_eq!(scientific(1.5, 2), "1.50e+00");
        assert_eq!(scientific(-0.00025, 3), "-2.500e-04");
        assert_eq!(scientific(1e123, 1), "1.0e+123");
        assert_eq!(scientific(0.0, 3), "0.000e+00");
        assert_eq!(scientific(f64::NAN, 3), "NaN");
    }

    #[test]
    fn loads_numpy_style_and_whitespace_files() {
        let numpy = "1.000000000000000000e+00,0.000000000000000000e+00,0.0,0.0\n\
                     0.0,2.0,0.0,0.0\n\
                     0.0,0.0,3.0,0.0\n\
                     0.0,0.0,0.0,4.0\n";
        let spaced = "# gains\n1 0 0 0\n\n0 2 0 0\n0, 0, 3, 0\n0 0 0 4\n";
        let expected = CalibrationMatrix::from_rows(&[
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 2.0, 0.0, 0.0],
            [0.0, 0.0, 3.0, 0.0],
            [0.0, 0.0, 0.0, 4.0],
        ]);
        assert_eq!(CalibrationMatrix::parse(numpy).unwrap(), expected);
        assert_eq!(CalibrationMatrix::parse(spaced).unwrap(), expected);
    }

    #[test]
    fn rejects_misshapen_files() {
        assert!(CalibrationMatrix::parse("1 0 0 0\n0 1 0 0\n0 0 1 0\n").is_err());
        assert!(CalibrationMatrix::parse("1 0 0\n0 1 0 0\n0 0 1 0\n0 0 0 1\n").is_err());
        assert!(CalibrationMatrix::parse("1 0 0 x\n0 1 0 0\n0 0 1 0\n0 0 0 1\n").is_err());
    }

    #[test]
    fn calibrator_falls_back_to_identity() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Calibrator::load(dir.path().join("nope.txt"));
        assert!(!missing.is_calibrated());
        assert_eq!(missing.matrix(), &CalibrationMatrix::identity());

        let garbage = dir.path().join("garbage.txt");
        fs::write(&garbage, "not a matrix").unwrap();
        let garbage = Calibrator::load(garbage);
        assert!(!garbage.is_calibrated());
        assert_eq!(garbage.matrix(), &CalibrationMatrix::identity());
    }

    #[test]
    fn calibrator_install_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.txt");
        let mut calibrator = Calibrator::uncalibrated(&path);

        let m = CalibrationMatrix::from_rows(&TRUE_RESPONSE);
        calibrator.install(m).unwrap();
        assert!(calibrator.is_calibrated());

        let reloaded = Calibrator::load(&path);
        assert!(reloaded.is_calibrated());
        assert_eq!(reloaded.matrix(), &m);
    }

    #[test]
    fn step_stats() {
        let stats = StepStats::from_samples(&[[1.0, 2.0, 0.0, 4.0], [3.0, 2.0, 0.0, 8.0]]).unwrap();
        assert_eq!(stats.mean, [2.0, 2.0, 0.0, 6.0]);
        assert!((stats.std_dev[0] - 2f64.sqrt()).abs() < 1e-12);
        assert_eq!(stats.std_dev[1], 0.0);
        assert_eq!(stats.samples, 2);

        assert!(StepStats::from_samples(&[]).is_none());
    }

    #[test]
    fn procedure_recovers_inverse_of_response() {
        let window = Duration::from_millis(500);
        let mut proc = CalibrationProcedure::new(window);
        let t0 = Instant::now();

        for (k, row) in TRUE_RESPONSE.iter().enumerate() {
            let start = t0 + window * (k as u32 * 2);
            assert_eq!(proc.current_step(), k + 1);
            proc.begin_step(start).unwrap();
            assert!(proc.poll_window(start).is_none());

            // Symmetric jitter averages out to the true row
            for jitter in [-0.01, 0.01, -0.02, 0.02] {
                proc.sample(&row.map(|v| v + jitter));
            }

            let report = proc.poll_window(start + window).unwrap().unwrap();
            assert_eq!(report.step, k + 1);
            assert_eq!(report.stats.samples, 4);
        }

        assert!(proc.is_complete());
        assert!(matches!(
            proc.begin_step(t0),
            Err(TunnelError::CalibrationComplete)
        ));

        let result = proc.finish().unwrap();
        let truth = CalibrationMatrix::from_rows(&TRUE_RESPONSE);
        let expected = CalibrationMatrix(truth.0.try_inverse().unwrap());
        assert_close(&result, &expected);
    }

    #[test]
    fn procedure_rejects_out_of_order_commands() {
        let window = Duration::from_millis(10);
        let mut proc = CalibrationProcedure::new(window);
        let t0 = Instant::now();

        assert!(matches!(
            proc.finish(),
            Err(TunnelError::CalibrationIncomplete { recorded: 0 })
        ));

        proc.begin_step(t0).unwrap();
        assert!(matches!(
            proc.begin_step(t0),
            Err(TunnelError::StepInProgress { step: 1 })
        ));

        // Nothing arrived; step one must be retried
        assert!(matches!(
            proc.poll_window(t0 + window),
            Some(Err(TunnelError::EmptyCalibrationWindow { step: 1 }))
        ));
        assert_eq!(proc.recorded(), 0);
        assert!(!proc.is_sampling());
    }

    #[test]
    fn identical_steps_make_finish_fail() {
        let window = Duration::from_millis(10);
        let mut proc = CalibrationProcedure::new(window);
        let t0 = Instant::now();
        let rows = [
            TRUE_RESPONSE[0],
            TRUE_RESPONSE[1],
            TRUE_RESPONSE[1],
            TRUE_RESPONSE[3],
        ];
        for (k, row) in rows.iter().enumerate() {
            let start = t0 + window * (k as u32 * 2);
            proc.begin_step(start).unwrap();
            proc.sample(row);
            proc.poll_window(start + window).unwrap().unwrap();
        }
        assert!(matches!(proc.finish(), Err(TunnelError::SingularMatrix)));
    }
}
