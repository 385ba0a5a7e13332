use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::tick;
use log::{info, warn, LevelFilter};
use scope_daq::{
    config::DEFAULT_CONFIG_FILE, tui::Scope, AcquisitionEngine, AcquisitionMode, Conf,
    SharedDriver, SimConfig, SimulatedDriver,
};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode, WriteLogger};
use std::{
    fs::File,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// Two-channel oscilloscope acquisition with live display and recording
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the configured acquisition mode
    #[arg(long, value_enum)]
    mode: Option<AcquisitionMode>,

    /// Override the requested sample interval
    #[arg(long)]
    interval_ns: Option<f64>,

    /// Record into this directory from the start
    #[arg(long)]
    record: Option<PathBuf>,

    /// Run without the terminal display
    #[arg(long)]
    headless: bool,

    /// Stop after this many seconds
    #[arg(long)]
    duration_s: Option<f64>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log file used while the terminal display is up
    #[arg(long, default_value = "scope_daq.log")]
    log_file: PathBuf,
}

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if args.headless {
        TermLogger::init(level, Config::default(), TerminalMode::Mixed, ColorChoice::Auto)?;
    } else {
        let file = File::create(&args.log_file)
            .with_context(|| format!("creating log file {}", args.log_file.display()))?;
        WriteLogger::init(level, Config::default(), file)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let conf = Conf::load(Some(args.config.as_path()))
        .with_context(|| format!("loading {}", args.config.display()))?;
    let mut config = conf.validate()?;
    if let Some(mode) = args.mode {
        config = config.with_mode(mode)?;
    }
    if let Some(ns) = args.interval_ns {
        config = config.with_sample_interval(ns)?;
    }
    let run_for = args.duration_s.map(Duration::from_secs_f64);

    info!("no vendor driver linked, using the simulated digitizer");
    let driver: SharedDriver = Arc::new(Mutex::new(SimulatedDriver::new(SimConfig::default())));
    let mut engine = AcquisitionEngine::open(driver, config).context("opening the device")?;

    if let Some(dir) = &args.record {
        engine.start_recording(Some(dir.as_path()))?;
    }
    engine.start()?;

    if args.headless {
        run_headless(&mut engine, run_for)?;
    } else {
        let mut scope = Scope::new(engine, run_for);
        let mut terminal = ratatui::init();
        let result = scope.run(&mut terminal);
        ratatui::restore();
        result?;
        engine_summary(scope.engine_mut());
        scope.engine_mut().close()?;
        return Ok(());
    }

    engine_summary(&mut engine);
    engine.close()?;
    Ok(())
}

fn run_headless(engine: &mut AcquisitionEngine, run_for: Option<Duration>) -> Result<()> {
    let ticker = tick(engine.config().refresh);
    let t_begin = Instant::now();
    let mut last_report = Instant::now();

    while engine.state().is_running() {
        let _ = ticker.recv();
        if let Some(fault) = engine.poll_faults() {
            warn!("{fault}");
        }
        engine.tick();
        if last_report.elapsed() >= Duration::from_secs(1) {
            let status = engine.status();
            info!(
                "{} samples, {:.3} MS/s, {} captures, {} saved",
                status.samples_received,
                status.effective_rate_hz / 1e6,
                status.captures_completed,
                status.acquisitions_saved
            );
            last_report = Instant::now();
        }
        if run_for.is_some_and(|limit| t_begin.elapsed() >= limit) {
            break;
        }
    }
    engine.stop()?;
    Ok(())
}

fn engine_summary(engine: &mut AcquisitionEngine) {
    match engine.stop_recording() {
        Ok(Some(summary)) => info!(
            "saved {} acquisitions to {}",
            summary.acquisitions_saved,
            summary.directory.display()
        ),
        Ok(None) => {}
        Err(e) => warn!("finishing the recording failed: {e}"),
    }
    let status = engine.status();
    info!(
        "received {} samples, dropped {}",
        status.samples_received, status.dropped_samples
    );
}
