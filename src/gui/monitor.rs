use std::{
    collections::VecDeque,
    path::PathBuf,
    time::{Duration, Instant},
};

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use log::{info, warn};
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
};

use crate::{
    controller::{Command, Controller, Outcome, Tick},
    error::TunnelError,
    gui::{error::GuiError, terminal::TuiTerminal},
    link::Link,
    ticker::Ticker,
    Forces, CHANNELS,
};

/// How often the screen is redrawn. The pipeline ticks many times per frame.
const FRAME: Duration = Duration::from_millis(50);

/// Readings kept for the value columns and the chart.
const HISTORY: usize = 300;

const DEFAULT_EXPORT: &str = "session.csv";

const CHANNEL_COLORS: [Color; CHANNELS] = [Color::Cyan, Color::Red, Color::Green, Color::Magenta];

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Live,
    ExportPrompt(String),
    ConfirmOverwrite,
    Calibrating,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Level {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
struct Sample {
    t: f64,
    forces: Forces,
    recorded: bool,
}

struct Monitor<L: Link> {
    controller: Controller<L>,
    mode: Mode,
    started: Instant,
    velocity: String,
    density: String,
    history: VecDeque<Sample>,
    status: Option<(Level, String)>,
}

impl<L: Link> Monitor<L> {
    fn new(controller: Controller<L>, now: Instant) -> Self {
        Self {
            controller,
            mode: Mode::Live,
            started: now,
            velocity: String::new(),
            density: String::new(),
            history: VecDeque::with_capacity(HISTORY),
            status: None,
        }
    }

    fn say(&mut self, level: Level, msg: impl Into<String>) {
        let msg = msg.into();
        match level {
            Level::Info => info!("{msg}"),
            Level::Warning | Level::Error => warn!("{msg}"),
        }
        self.status = Some((level, msg));
    }

    fn on_tick(&mut self, now: Instant) {
        let Tick { reading, step } = self.controller.tick(now);

        if let Some(reading) = reading {
            self.velocity = reading.record.velocity;
            self.density = reading.record.density;
            if self.history.len() == HISTORY {
                self.history.pop_front();
            }
            self.history.push_back(Sample {
                t: now.saturating_duration_since(self.started).as_secs_f64(),
                forces: reading.calibrated,
                recorded: self.controller.session().is_recording(),
            });
        }

        match step {
            Some(Ok(report)) => {
                let avgs: Vec<String> = report
                    .stats
                    .mean
                    .iter()
                    .zip(report.stats.std_dev.iter())
                    .enumerate()
                    .map(|(ch, (avg, std))| format!("F{}={avg:.4}±{std:.4}", ch + 1))
                    .collect();
                self.say(
                    Level::Info,
                    format!("Step {} recorded: {}", report.step, avgs.join("  ")),
                );
            }
            Some(Err(e)) => self.say(Level::Error, e.to_string()),
            None => {}
        }
    }

    /// Send a command to the controller, reporting failures in the status
    /// line.
    fn command(&mut self, command: Command, now: Instant) -> Option<Outcome> {
        match self.controller.handle(command, now) {
            Ok(outcome) => Some(outcome),
            Err(e @ TunnelError::EmptySession) => {
                self.say(Level::Warning, e.to_string());
                None
            }
            Err(e) => {
                self.say(Level::Error, e.to_string());
                None
            }
        }
    }

    fn on_key(&mut self, code: KeyCode, now: Instant) -> Flow {
        match std::mem::replace(&mut self.mode, Mode::Live) {
            Mode::Live => return self.on_live_key(code, now),
            Mode::ExportPrompt(mut name) => match code {
                KeyCode::Enter => {
                    let path = PathBuf::from(name.trim());
                    if let Some(Outcome::Exported { path, rows }) =
                        self.command(Command::Export(path), now)
                    {
                        self.say(
                            Level::Info,
                            format!("Exported {rows} rows to {}", path.display()),
                        );
                    }
                }
                KeyCode::Esc => self.say(Level::Info, "Export cancelled"),
                KeyCode::Backspace => {
                    name.pop();
                    self.mode = Mode::ExportPrompt(name);
                }
                KeyCode::Char(c) => {
                    name.push(c);
                    self.mode = Mode::ExportPrompt(name);
                }
                _ => self.mode = Mode::ExportPrompt(name),
            },
            Mode::ConfirmOverwrite => match code {
                KeyCode::Char('y') | KeyCode::Char('Y') => {
                    self.begin_calibration(true, now);
                }
                KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                    self.say(Level::Info, "Kept the existing calibration");
                }
                _ => self.mode = Mode::ConfirmOverwrite,
            },
            Mode::Calibrating => {
                self.mode = Mode::Calibrating;
                match code {
                    KeyCode::Enter => {
                        if let Some(Outcome::StepStarted { step, window }) =
                            self.command(Command::RecordCalibrationStep, now)
                        {
                            self.say(
                                Level::Info,
                                format!("Step {step}: sampling for {:.1} s", window.as_secs_f64()),
                            );
                        }
                    }
                    KeyCode::Char('f') => {
                        match self.controller.handle(Command::FinishCalibration, now) {
                            Ok(_) => {
                                self.mode = Mode::Live;
                                self.say(
                                    Level::Info,
                                    format!(
                                        "Calibration saved to {}",
                                        self.controller.calibrator().path().display()
                                    ),
                                );
                            }
                            Err(e @ TunnelError::FileIo { .. }) => {
                                self.mode = Mode::Live;
                                self.say(Level::Error, format!("Calibration active but not saved: {e}"));
                            }
                            Err(e @ TunnelError::SingularMatrix) => {
                                self.mode = Mode::Live;
                                self.say(Level::Error, e.to_string());
                            }
                            Err(e) => self.say(Level::Error, e.to_string()),
                        }
                    }
                    KeyCode::Esc => {
                        if self.command(Command::CancelCalibration, now).is_some() {
                            self.say(Level::Info, "Calibration cancelled");
                        }
                        self.mode = Mode::Live;
                    }
                    KeyCode::Char('q') => return Flow::Quit,
                    _ => {}
                }
            }
        }
        Flow::Continue
    }

    fn on_live_key(&mut self, code: KeyCode, now: Instant) -> Flow {
        match code {
            KeyCode::Char('q') => return Flow::Quit,
            KeyCode::Char('r') => {
                self.command(Command::StartRecording, now);
                self.say(Level::Info, "Recording");
            }
            KeyCode::Char('s') => {
                self.command(Command::StopRecording, now);
                let rows = self.controller.session().rows().len();
                self.say(Level::Info, format!("Stopped, {rows} rows held for export"));
            }
            KeyCode::Char('e') => {
                if self.controller.session().rows().is_empty() {
                    self.say(Level::Warning, TunnelError::EmptySession.to_string());
                } else {
                    self.mode = Mode::ExportPrompt(DEFAULT_EXPORT.to_owned());
                }
            }
            KeyCode::Char('c') => {
                if self.controller.calibrator().is_calibrated() {
                    self.mode = Mode::ConfirmOverwrite;
                } else {
                    self.begin_calibration(false, now);
                }
            }
            _ => {}
        }
        Flow::Continue
    }

    fn begin_calibration(&mut self, overwrite: bool, now: Instant) {
        if self
            .command(Command::BeginCalibration { overwrite }, now)
            .is_some()
        {
            self.mode = Mode::Calibrating;
            self.status = None;
        }
    }

    fn calibration_instructions(&self) -> Vec<Line<'static>> {
        let Some(procedure) = self.controller.calibration() else {
            return vec![];
        };
        let step = procedure.current_step();
        let mut lines = if procedure.is_sampling() {
            vec![Line::from(format!("Step {step}: recording, hold the load steady..."))]
        } else if procedure.is_complete() {
            vec![Line::from("Done! Press <f> to finish & save")]
        } else {
            vec![Line::from(format!(
                "Step {step}: Apply 1 N to Load Cell {step} and press <Enter>"
            ))]
        };
        lines.push(Line::from(format!(
            "{} of {CHANNELS} steps recorded. <Esc> cancels.",
            procedure.recorded()
        )));
        lines
    }
}

/// Run the live monitor until the operator quits. The pipeline ticks every
/// `tick`; the screen is redrawn at a slower, fixed rate.
pub fn run_monitor<L: Link>(controller: Controller<L>, tick: Duration) -> Result<(), GuiError> {
    let mut terminal = TuiTerminal::enter()?;
    let mut ticker = Ticker::new(tick);
    let mut monitor = Monitor::new(controller, Instant::now());

    'frames: loop {
        let frame_end = Instant::now() + FRAME;
        loop {
            let now = ticker.wait();
            monitor.on_tick(now);
            if now >= frame_end {
                break;
            }
        }

        terminal.draw(|f| ui(f, &monitor))?;

        while event::poll(Duration::ZERO)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press
                    && monitor.on_key(key.code, Instant::now()) == Flow::Quit
                {
                    break 'frames;
                }
            }
        }
    }

    monitor.controller.close();
    Ok(())
}

fn ui<L: Link>(f: &mut Frame, monitor: &Monitor<L>) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(3),
        ])
        .split(f.size());
    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(rows[1]);

    f.render_widget(header(monitor), rows[0]);
    render_columns(f, monitor, body[0]);
    render_chart(f, monitor, body[1]);
    f.render_widget(footer(monitor), rows[2]);

    match &monitor.mode {
        Mode::Live => {}
        Mode::ExportPrompt(name) => popup(
            f,
            " Save data as... ",
            vec![
                Line::from(vec!["> ".magenta().bold(), Span::raw(name.clone()), "_".into()]),
                Line::from("<Enter> save  <Esc> cancel"),
            ],
        ),
        Mode::ConfirmOverwrite => {
            let mut lines = vec![Line::from("A calibration matrix already exists:"), Line::from("")];
            lines.extend(
                monitor
                    .controller
                    .calibrator()
                    .matrix()
                    .to_string()
                    .lines()
                    .map(|l| Line::from(l.to_owned())),
            );
            lines.push(Line::from(""));
            lines.push(Line::from(vec![
                "Do you want to overwrite it? ".into(),
                "<y>/<n>".magenta().bold(),
            ]));
            popup(f, " Overwrite Calibration? ", lines);
        }
        Mode::Calibrating => popup(f, " Calibration ", monitor.calibration_instructions()),
    }
}

fn header<L: Link>(monitor: &Monitor<L>) -> Paragraph<'static> {
    let stats = monitor.controller.stats();
    let recording = if monitor.controller.session().is_recording() {
        " ● REC ".black().on_yellow().bold()
    } else {
        " idle ".dark_gray()
    };
    let link = if monitor.controller.link_open() {
        Span::raw("")
    } else {
        " LINK LOST ".white().on_red().bold()
    };

    let line = Line::from(vec![
        "Wind velocity: ".bold(),
        Span::raw(format!("{:<10}", monitor.velocity)),
        "Wind density: ".bold(),
        Span::raw(format!("{:<10}", monitor.density)),
        recording,
        Span::raw(format!(
            "  rows {}  frames {}  dropped {}  bad {}  ",
            monitor.controller.session().rows().len(),
            stats.records,
            stats.dropped,
            stats.parse_errors
        )),
        link,
    ]);

    Paragraph::new(line).block(
        Block::default()
            .title(Title::from(" Wind Tunnel ".magenta().bold()).alignment(Alignment::Center))
            .borders(Borders::ALL),
    )
}

fn render_columns<L: Link>(f: &mut Frame, monitor: &Monitor<L>, area: Rect) {
    let title = if monitor.controller.calibrator().is_calibrated() {
        " Force output (N) "
    } else {
        " Force output (uncalibrated) "
    };
    let block = Block::default().title(title).borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Ratio(1, CHANNELS as u32); CHANNELS])
        .split(inner);

    let visible = inner.height.saturating_sub(1) as usize;
    for (ch, column) in columns.iter().enumerate() {
        let items: Vec<ListItem> = monitor
            .history
            .iter()
            .rev()
            .take(visible)
            .map(|s| {
                let item = ListItem::new(format!("{:>9.2}", s.forces[ch]));
                if s.recorded {
                    item.style(Style::default().fg(Color::Black).bg(Color::Yellow))
                } else {
                    item
                }
            })
            .collect();
        let list = List::new(items).block(
            Block::default()
                .title(Span::styled(
                    format!("F{}", ch + 1),
                    Style::default()
                        .fg(CHANNEL_COLORS[ch])
                        .add_modifier(Modifier::BOLD),
                ))
                .borders(Borders::RIGHT),
        );
        f.render_widget(list, *column);
    }
}

fn render_chart<L: Link>(f: &mut Frame, monitor: &Monitor<L>, area: Rect) {
    let points: Vec<Vec<(f64, f64)>> = (0..CHANNELS)
        .map(|ch| monitor.history.iter().map(|s| (s.t, s.forces[ch])).collect())
        .collect();

    let (t0, t1) = match (monitor.history.front(), monitor.history.back()) {
        (Some(first), Some(last)) if last.t > first.t => (first.t, last.t),
        (Some(first), _) => (first.t, first.t + 1.0),
        _ => (0.0, 1.0),
    };
    let (lo, hi) = monitor
        .history
        .iter()
        .flat_map(|s| s.forces)
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    let (lo, hi) = if lo.is_finite() && hi > lo {
        let pad = (hi - lo) * 0.05;
        (lo - pad, hi + pad)
    } else if lo.is_finite() {
        (lo - 1.0, lo + 1.0)
    } else {
        (-1.0, 1.0)
    };

    let datasets = points
        .iter()
        .enumerate()
        .map(|(ch, pts)| {
            Dataset::default()
                .name(format!("F{}", ch + 1))
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(CHANNEL_COLORS[ch]))
                .data(pts)
        })
        .collect();

    let chart = Chart::new(datasets)
        .block(
            Block::default()
                .title(" Force Over Time ")
                .borders(Borders::ALL),
        )
        .x_axis(
            Axis::default()
                .title("Time (s)")
                .style(Style::default().fg(Color::White))
                .bounds([t0, t1])
                .labels(axis_labels(t0, t1, 1)),
        )
        .y_axis(
            Axis::default()
                .title("Force")
                .style(Style::default().fg(Color::White))
                .bounds([lo, hi])
                .labels(axis_labels(lo, hi, 2)),
        );

    f.render_widget(chart, area);
}

fn axis_labels(lo: f64, hi: f64, precision: usize) -> Vec<Span<'static>> {
    [lo, (lo + hi) / 2.0, hi]
        .iter()
        .map(|v| Span::raw(format!("{v:.precision$}")))
        .collect()
}

fn key_hints(mode: &Mode) -> Line<'static> {
    let keys: &[(&str, &str)] = match mode {
        Mode::Live => &[
            (" Record ", "<r>"),
            (" Stop ", "<s>"),
            (" Export ", "<e>"),
            (" Calibrate ", "<c>"),
            (" Quit ", "<q> "),
        ],
        Mode::ExportPrompt(_) => &[(" Save ", "<Enter>"), (" Cancel ", "<Esc> ")],
        Mode::ConfirmOverwrite => &[(" Overwrite ", "<y>"), (" Keep ", "<n> ")],
        Mode::Calibrating => &[
            (" Record step ", "<Enter>"),
            (" Finish ", "<f>"),
            (" Cancel ", "<Esc>"),
            (" Quit ", "<q> "),
        ],
    };
    Line::from(
        keys.iter()
            .flat_map(|(label, key)| [Span::raw(*label), key.magenta().bold()])
            .collect::<Vec<_>>(),
    )
}

fn footer<L: Link>(monitor: &Monitor<L>) -> Paragraph<'static> {
    let line = match &monitor.status {
        Some((level, msg)) => {
            let style = match level {
                Level::Info => Style::default(),
                Level::Warning => Style::default().fg(Color::Yellow),
                Level::Error => Style::default().fg(Color::Red).bold(),
            };
            Line::from(Span::styled(msg.clone(), style))
        }
        None => Line::from(""),
    };
    Paragraph::new(line).wrap(Wrap { trim: true }).block(
        Block::default()
            .title(
                Title::from(key_hints(&monitor.mode))
                    .alignment(Alignment::Center)
                    .position(Position::Bottom),
            )
            .borders(Borders::ALL),
    )
}

fn popup(f: &mut Frame, title: &'static str, lines: Vec<Line<'static>>) {
    let area = f.size();
    let width = 70.min(area.width);
    let height = (lines.len() as u16 + 2).min(area.height);
    let rect = Rect::new(
        area.x + (area.width - width) / 2,
        area.y + (area.height - height) / 2,
        width,
        height,
    );
    f.render_widget(Clear, rect);
    f.render_widget(
        Paragraph::new(lines).block(
            Block::default()
                .title(Title::from(title.magenta().bold()).alignment(Alignment::Center))
                .borders(Borders::ALL),
        ),
        rect,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        calibration::{CalibrationMatrix, Calibrator},
        link::LineLink,
    };
    use ratatui::backend::TestBackend;
    use std::fs;

    fn monitor(lines: &'static str, calibrator: Calibrator) -> Monitor<LineLink<&'static [u8]>> {
        let controller = Controller::with_calibrator(
            LineLink::new(lines.as_bytes()),
            calibrator,
            Duration::from_millis(100),
        );
        Monitor::new(controller, Instant::now())
    }

    fn screen<L: Link>(monitor: &Monitor<L>) -> String {
        let mut terminal = Terminal::new(TestBackend::new(120, 30)).unwrap();
        terminal.draw(|f| ui(f, monitor)).unwrap();
        let buffer = terminal.backend().buffer();
        buffer.content().iter().map(|c| c.symbol()).collect()
    }

    #[test]
    fn export_without_data_warns() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = monitor("", Calibrator::uncalibrated(dir.path().join("m.txt")));
        assert_eq!(m.on_key(KeyCode::Char('e'), Instant::now()), Flow::Continue);
        assert_eq!(m.mode, Mode::Live);
        assert!(matches!(m.status, Some((Level::Warning, _))));
    }

    #[test]
    fn record_then_export_through_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("run.csv");
        let mut m = monitor(
            "5 1 1 2 3 4\n5 1 2 3 4 5\n",
            Calibrator::uncalibrated(dir.path().join("m.txt")),
        );
        let t0 = Instant::now();

        m.on_key(KeyCode::Char('r'), t0);
        m.on_tick(t0 + Duration::from_millis(10));
        m.on_tick(t0 + Duration::from_millis(20));
        m.on_key(KeyCode::Char('s'), t0);
        assert_eq!(m.history.len(), 2);
        assert!(m.history.iter().all(|s| s.recorded));
        assert_eq!(m.velocity, "5");

        m.on_key(KeyCode::Char('e'), t0);
        assert_eq!(m.mode, Mode::ExportPrompt(DEFAULT_EXPORT.to_owned()));
        // Replace the default name with our path
        for _ in 0..DEFAULT_EXPORT.len() {
            m.on_key(KeyCode::Backspace, t0);
        }
        for c in out.to_string_lossy().chars() {
            m.on_key(KeyCode::Char(c), t0);
        }
        m.on_key(KeyCode::Enter, t0);

        assert_eq!(m.mode, Mode::Live);
        assert!(matches!(m.status, Some((Level::Info, _))));
        assert_eq!(fs::read_to_string(&out).unwrap().lines().count(), 3);
    }

    #[test]
    fn calibrate_asks_before_overwriting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.txt");
        CalibrationMatrix::identity().save(&path).unwrap();
        let mut m = monitor("", Calibrator::load(&path));
        let t0 = Instant::now();

        m.on_key(KeyCode::Char('c'), t0);
        assert_eq!(m.mode, Mode::ConfirmOverwrite);
        assert!(screen(&m).contains("Overwrite Calibration?"));

        m.on_key(KeyCode::Char('n'), t0);
        assert_eq!(m.mode, Mode::Live);
        assert!(m.controller.calibration().is_none());

        m.on_key(KeyCode::Char('c'), t0);
        m.on_key(KeyCode::Char('y'), t0);
        assert_eq!(m.mode, Mode::Calibrating);
        assert!(screen(&m).contains("Apply 1 N to Load Cell 1"));

        m.on_key(KeyCode::Esc, t0);
        assert_eq!(m.mode, Mode::Live);
        assert!(m.controller.calibration().is_none());
    }

    #[test]
    fn finishing_early_stays_in_calibration() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = monitor("", Calibrator::uncalibrated(dir.path().join("m.txt")));
        let t0 = Instant::now();

        m.on_key(KeyCode::Char('c'), t0);
        assert_eq!(m.mode, Mode::Calibrating);
        m.on_key(KeyCode::Char('f'), t0);
        assert_eq!(m.mode, Mode::Calibrating);
        assert!(matches!(m.status, Some((Level::Error, _))));
    }

    #[test]
    fn key_hints_stay_visible_next_to_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = monitor("", Calibrator::uncalibrated(dir.path().join("m.txt")));
        let t0 = Instant::now();

        m.on_key(KeyCode::Char('e'), t0);
        let text = screen(&m);
        assert!(text.contains("start recording data first"));
        assert!(text.contains("Quit <q>"));

        m.on_key(KeyCode::Char('c'), t0);
        let text = screen(&m);
        assert!(text.contains("Record step <Enter>"));
    }

    #[test]
    fn renders_uncalibrated_label_and_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = monitor(
            "12.5 1.225 1 2 3 4\n",
            Calibrator::uncalibrated(dir.path().join("m.txt")),
        );
        m.on_tick(Instant::now());

        let text = screen(&m);
        assert!(text.contains("Force output (uncalibrated)"));
        assert!(text.contains("12.5"));
        assert!(text.contains("4.00"));
    }
}
