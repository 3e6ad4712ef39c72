use std::{
    fs::File,
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use clap::Parser;
use log::{info, warn};
use windtunnel::{
    args::{CommandTask, RecordCommand, SourceArgs, TunnelArgs},
    config::TunnelConfig,
    controller::{Command, Controller, Outcome},
    gui::{device_selector, run_monitor},
    link::{available_ports, open_serial, DummyLink, LineLink, Link},
    ticker::Ticker,
};

/// Frame period of `--dummy`, roughly what the rig's firmware sends.
const DUMMY_PERIOD: Duration = Duration::from_millis(20);

// Example:
// cargo run -- monitor --port /dev/ttyACM0
// cargo run -- --window-ms 2000 monitor --dummy
// cargo run -- record --replay capture.txt --out run.csv --seconds 10

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = TunnelArgs::parse();
    let config = TunnelConfig::from(&args);

    match args.command {
        CommandTask::Ports => {
            let ports = available_ports().context("Failed to list serial devices")?;
            if ports.is_empty() {
                println!("No serial devices found");
            }
            for port in ports {
                println!("{}", port.to_string_lossy());
            }
        }
        CommandTask::Monitor(monitor) => {
            let Some(link) = open_link(&monitor.source, &config, true)? else {
                return Ok(());
            };
            run_monitor(Controller::new(link, &config), config.tick)?;
        }
        CommandTask::Record(record) => {
            let Some(link) = open_link(&record.source, &config, false)? else {
                return Ok(());
            };
            record_headless(Controller::new(link, &config), &record, &config)?;
        }
    }

    Ok(())
}

/// Open whichever source the arguments name. Without one, the operator picks
/// a device if `interactive`; `None` means they declined.
fn open_link(
    source: &SourceArgs,
    config: &TunnelConfig,
    interactive: bool,
) -> anyhow::Result<Option<Box<dyn Link>>> {
    if source.dummy {
        info!("Using synthetic frames");
        return Ok(Some(Box::new(DummyLink::new(DUMMY_PERIOD))));
    }
    if let Some(path) = &source.replay {
        let file = File::open(path)
            .with_context(|| format!("Failed to open capture {}", path.display()))?;
        info!("Replaying {}", path.display());
        return Ok(Some(Box::new(LineLink::new(file))));
    }

    let port = match &source.port {
        Some(port) => port.clone(),
        None if interactive => {
            let ports = available_ports().context("Failed to list serial devices")?;
            match device_selector(ports)? {
                Some(port) => port.to_string_lossy().into_owned(),
                None => return Ok(None),
            }
        }
        None => bail!("No source given, use --port, --dummy or --replay"),
    };

    Ok(Some(Box::new(open_serial(&port, source.baud, config.settle)?)))
}

fn record_headless<L: Link>(
    mut controller: Controller<L>,
    record: &RecordCommand,
    config: &TunnelConfig,
) -> anyhow::Result<()> {
    let length = Duration::try_from_secs_f64(record.seconds)
        .with_context(|| format!("Invalid recording length {}", record.seconds))?;

    let mut ticker = Ticker::new(config.tick);
    let start = Instant::now();
    let deadline = start + length;
    controller.handle(Command::StartRecording, start)?;
    info!("Recording for {length:?}");

    loop {
        let now = ticker.wait();
        if now >= deadline {
            break;
        }
        controller.tick(now);
        if !controller.link_open() {
            warn!("Link closed after {:?}, stopping early", now - start);
            break;
        }
    }

    controller.handle(Command::StopRecording, Instant::now())?;
    let outcome = controller.handle(Command::Export(record.outfile.clone()), Instant::now())?;
    if let Outcome::Exported { path, rows } = outcome {
        println!("Wrote {rows} rows to {}", path.display());
    }

    let stats = controller.stats();
    println!(
        "{} lines, {} readings, {} malformed, {} unparsable",
        stats.lines, stats.records, stats.dropped, stats.parse_errors
    );
    controller.close();

    Ok(())
}
