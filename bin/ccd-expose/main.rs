use ccdctrl::config::{AppConfig, load_config_or_default};
use ccdctrl::{
    CcdError, ExposureKind, ExposureMode, ExposureRequest, FileTitle, FitsHeaderAnnotator,
    HeaderOverrides, Illumination, Journal, ProcessAcquisitionClient, ProcessRailDriver, Rail,
    RunEvent, RunState, SequenceRunner, SequenceStore, StandController, SweepAxis,
    VoltageController, expand,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use env_logger::Env;
use log::{LevelFilter, debug, error, info, warn};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// CCD test stand exposure sequencer
#[derive(Parser, Debug)]
#[command(name = "ccd-expose")]
#[command(about = "Take single images, stacks, time series and voltage scans", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// One image at the stored sequence number
    Single {
        #[command(flatten)]
        shot: ShotArgs,
    },
    /// N identical images with consecutive sequence numbers
    Stack {
        #[arg(long)]
        count: u32,
        /// First sequence number (defaults to the stored one)
        #[arg(long)]
        start: Option<u64>,
        #[command(flatten)]
        shot: ShotArgs,
    },
    /// Exposure times from --min to --max in --step increments
    Series {
        #[arg(long)]
        min: f64,
        #[arg(long)]
        max: f64,
        #[arg(long)]
        step: f64,
        #[command(flatten)]
        shot: ShotArgs,
    },
    /// Cartesian product of rail sweeps, outer axis first
    Scan {
        /// NAME:MIN:MAX:STEP, MAX exclusive; repeat for nested axes
        #[arg(long = "axis", value_name = "AXIS", required = true)]
        axes: Vec<SweepAxis>,
        #[command(flatten)]
        shot: ShotArgs,
    },
    /// Set bias rails, e.g. `VOD=25 "PAR LO=-8"`
    SetVoltage {
        #[arg(value_name = "NAME=VALUE", required = true, value_parser = parse_assignment)]
        values: Vec<(String, f64)>,
    },
    /// Print the effective configuration as TOML
    DumpConfig,
}

#[derive(clap::Args, Debug)]
struct ShotArgs {
    /// exp, dark, bias, flat or fe55
    #[arg(long, default_value = "exp")]
    kind: ExposureKind,

    /// Exposure time in seconds (ignored for bias)
    #[arg(long, default_value_t = 0.0)]
    time: f64,

    /// File name stem
    #[arg(long, required_unless_present = "test", conflicts_with = "test")]
    title: Option<String>,

    /// Write to the scratch test image instead
    #[arg(long)]
    test: bool,

    /// Output directory (defaults to data.directory)
    #[arg(long, value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Monochromator wavelength in nm
    #[arg(long, conflicts_with = "filter")]
    monowl: Option<f64>,

    /// Filter name
    #[arg(long)]
    filter: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let (config, fallback) = load_config_or_default(args.config.as_deref())?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    initialize_logging(&log_level)?;
    match fallback {
        Some(reason) => warn!("Using default configuration ({})", reason),
        None => info!("Configuration loaded successfully"),
    }
    log_startup_info(&config, args.config.as_deref());

    match args.command {
        Command::DumpConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::SetVoltage { values } => set_voltages(&config, values),
        command => run_sequence(&config, command),
    }
}

// Helper Functions

/// Log startup information
fn log_startup_info(config: &AppConfig, config_path: Option<&Path>) {
    info!("=== CCD Exposure Control ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults"),
    }
    info!("Data directory: {}", config.data.directory.display());
    if let Some(ref bin_dir) = config.acquisition.bin_dir {
        info!("Stand executables: {}", bin_dir.display());
    }
}

fn parse_assignment(text: &str) -> Result<(String, f64), String> {
    let (name, value) = text
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", text))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("'{}' is not a number", value.trim()))?;
    Ok((name.trim().to_string(), value))
}

/// Rail cache seeded from the config defaults, then from the values the
/// last invocation left the stand at
fn voltage_controller(
    config: &AppConfig,
    store: &SequenceStore,
) -> Result<VoltageController, CcdError> {
    Ok(VoltageController::new(
        Box::new(ProcessRailDriver::new(config.acquisition.bin_dir.clone())),
        config.rail_defaults()?,
    )
    .with_cached(store.load_voltages()?))
}

fn save_rail_values(store: &SequenceStore, values: &BTreeMap<Rail, f64>) {
    if let Err(e) = store.save_voltages(values) {
        error!("Rail values not saved: {}", e);
    }
}

fn set_voltages(
    config: &AppConfig,
    values: Vec<(String, f64)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = SequenceStore::new(&config.sequence.state_file);
    let mut controller = voltage_controller(config, &store)?;
    let overrides: BTreeMap<String, f64> = values.into_iter().collect();
    let result = controller.set_voltages(&overrides);
    // Rails that were set before a failure are still recorded
    save_rail_values(&store, &controller.snapshot());
    result?;
    for (rail, volts) in controller.snapshot() {
        info!("{:>6} = {:.2} V", rail, volts);
    }
    Ok(())
}

/// Turn a sequence subcommand into an exposure request
fn build_request(
    config: &AppConfig,
    command: Command,
    next_seq_num: u64,
) -> Result<ExposureRequest, CcdError> {
    let (mode, shot, start) = match command {
        Command::Single { shot } => (ExposureMode::Single, shot, None),
        Command::Stack { count, start, shot } => {
            (ExposureMode::Stack { image_count: count }, shot, start)
        }
        Command::Series {
            min,
            max,
            step,
            shot,
        } => (
            ExposureMode::Series {
                min_time: min,
                max_time: max,
                time_step: step,
            },
            shot,
            None,
        ),
        Command::Scan { axes, shot } => (ExposureMode::VoltageScan { axes }, shot, None),
        Command::SetVoltage { .. } | Command::DumpConfig => {
            return Err(CcdError::InvalidRequest(
                "not an exposure command".to_string(),
            ));
        }
    };

    let title = if shot.test {
        FileTitle::Test
    } else {
        FileTitle::Title(shot.title.clone().unwrap_or_default())
    };
    let directory = shot
        .dir
        .clone()
        .unwrap_or_else(|| config.data.directory.clone());

    let illumination = match (shot.monowl, &shot.filter) {
        (Some(wavelength_nm), _) => Some(Illumination::Monochromator { wavelength_nm }),
        (None, Some(name)) => Some(Illumination::Filter { name: name.clone() }),
        (None, None) => None,
    };
    let metadata = config.header.overlay(&HeaderOverrides {
        illumination,
        ..Default::default()
    });

    Ok(ExposureRequest::new(shot.kind, mode, title, directory)
        .with_exposure_time(shot.time)
        .with_start_seq_num(start.unwrap_or(next_seq_num))
        .with_metadata(metadata))
}

/// Map Ctrl+C onto cooperative cancellation
fn setup_cancel_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let cancel_flag = Arc::new(AtomicBool::new(false));
    let cancel_flag_clone = cancel_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping after the current image...");
        cancel_flag_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(cancel_flag)
}

fn create_journal_path(directory: &Path) -> Result<PathBuf, CcdError> {
    fs::create_dir_all(directory).map_err(|source| CcdError::Io {
        source,
        context: format!("creating {}", directory.display()),
    })?;
    let filename = format!("ccd_expose_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"));
    Ok(directory.join(filename))
}

fn run_sequence(config: &AppConfig, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    let store = SequenceStore::new(&config.sequence.state_file);
    let next_seq_num = store.load()?;
    let request = build_request(config, command, next_seq_num)?;
    let plan = expand(&request, next_seq_num)?;
    info!(
        "Planned {} {} image(s) in {}",
        plan.total_count(),
        plan.kind(),
        request.directory().display()
    );

    let stand = StandController::new(
        config.stand.setup_program.clone(),
        config.stand.off_program.clone(),
        config.acquisition.bin_dir.clone(),
    );
    if config.stand.reset_on_start {
        stand.reset()?;
    }

    let mut controller = voltage_controller(config, &store)?;
    if config.voltages.apply_on_start {
        let result = controller.apply_defaults();
        save_rail_values(&store, &controller.snapshot());
        result?;
    }

    let cancel_flag = setup_cancel_handler()?;
    let (event_tx, event_rx) = crossbeam_channel::unbounded();

    let mut runner = SequenceRunner::new(
        Box::new(ProcessAcquisitionClient::new(
            config.acquisition.exp_program.clone(),
            config.acquisition.dark_program.clone(),
            config.acquisition.bin_dir.clone(),
        )),
        Box::new(FitsHeaderAnnotator),
    )
    .with_voltage_controller(controller)
    .with_event_sender(event_tx)
    .with_cancel_flag(cancel_flag)
    .with_next_seq_num(next_seq_num)
    .with_auto_increment(config.sequence.auto_increment);

    if config.journal.enabled {
        let path = create_journal_path(&config.journal.directory)?;
        info!("Journal: {}", path.display());
        runner = runner.with_journal(Journal::new(path, config.journal.buffer_size));
    }

    let runner = Arc::new(runner);
    let worker = runner.spawn(plan)?;

    loop {
        match event_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                let finished = matches!(event, RunEvent::RunFinished { .. });
                handle_event(&event, &store);
                if finished {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if worker.is_finished() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let report = worker
        .join()
        .map_err(|_| "sequence worker panicked")?;
    if let Some(values) = runner.voltage_snapshot() {
        save_rail_values(&store, &values);
    }

    if config.stand.power_off_on_exit {
        if let Err(e) = stand.power_off() {
            error!("Controller not powered off: {}", e);
        }
    }

    match report.state {
        RunState::Failed => {
            let message = report
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "unknown error".to_string());
            Err(format!("Sequence failed: {}", message).into())
        }
        _ => {
            info!(
                "{} of {} image(s) taken, next sequence number {}",
                report.completed, report.total, report.next_seq_num
            );
            Ok(())
        }
    }
}

fn handle_event(event: &RunEvent, store: &SequenceStore) {
    match event {
        RunEvent::RunStarted { total } => info!("Sequence started: {} image(s)", total),
        RunEvent::ShotStarted {
            index,
            total,
            seq_num,
            path,
        } => debug!(
            "Image {}/{} (seq {}) -> {}",
            index + 1,
            total,
            seq_num,
            path.display()
        ),
        RunEvent::ShotCompleted { completed, total } => {
            info!("Progress: {}/{}", completed, total)
        }
        RunEvent::SequenceNumberAdvanced(next) => {
            if let Err(e) = store.save(*next) {
                error!("Sequence number {} not saved: {}", next, e);
            }
        }
        RunEvent::HeaderWriteFailed { index, message } => {
            warn!("Image {}: header not written: {}", index + 1, message)
        }
        RunEvent::RunFinished {
            state,
            completed,
            error,
        } => match error {
            Some(e) => error!("Run {:?} after {} image(s): {}", state, completed, e.message),
            None => info!("Run {:?} after {} image(s)", state, completed),
        },
    }
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("PAR LO=-8").unwrap(),
            ("PAR LO".to_string(), -8.0)
        );
        assert!(parse_assignment("VOD").is_err());
        assert!(parse_assignment("VOD=high").is_err());
    }

    #[test]
    fn test_stack_defaults_to_stored_seq_num() {
        let args = Args::try_parse_from([
            "ccd-expose", "stack", "--count", "3", "--kind", "dark", "--time", "30", "--title",
            "sta3800",
        ])
        .unwrap();
        let request = build_request(&AppConfig::default(), args.command, 41).unwrap();
        assert_eq!(request.start_seq_num(), 41);
        assert_eq!(request.kind(), ExposureKind::Dark);
        assert_eq!(request.mode(), &ExposureMode::Stack { image_count: 3 });
    }

    #[test]
    fn test_filter_flag_sets_illumination() {
        let args = Args::try_parse_from([
            "ccd-expose", "single", "--test", "--kind", "flat", "--time", "2", "--filter", "550LP",
        ])
        .unwrap();
        let request = build_request(&AppConfig::default(), args.command, 0).unwrap();
        assert!(request.is_test());
        assert_eq!(
            request.metadata().illumination,
            Some(Illumination::Filter {
                name: "550LP".to_string()
            })
        );
    }

    #[test]
    fn test_scan_axes_parse() {
        let args = Args::try_parse_from([
            "ccd-expose", "scan", "--axis", "VOD:24:26:0.5", "--axis", "RG_HI:8:10:1",
            "--title", "scan",
        ])
        .unwrap();
        match args.command {
            Command::Scan { axes, .. } => {
                assert_eq!(axes.len(), 2);
                assert_eq!(axes[1], SweepAxis::new("RG_HI", 8.0, 10.0, 1.0));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_title_or_test_required() {
        assert!(Args::try_parse_from(["ccd-expose", "single"]).is_err());
        assert!(Args::try_parse_from(["ccd-expose", "single", "--title", "a", "--test"]).is_err());
        assert!(Args::try_parse_from([
            "ccd-expose", "single", "--test", "--monowl", "500", "--filter", "g"
        ])
        .is_err());
    }
}
