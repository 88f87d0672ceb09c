//! CLI entry point for cryo_daq.
//!
//! Provides a command-line interface for:
//! - Running the acquisition loop against the configured instruments
//! - Running a temperature/field sequence from a TOML file
//! - Validating a sequence file offline
//!
//! Live lock-ins attach over serial ports from the configuration file. The
//! controller's vendor client is an external collaborator, so controller
//! runs from this binary require `--simulate`, which swaps every device for
//! its register-level simulation; library consumers wire a real client
//! through [`cryo_daq::ppms::PpmsClient`].
//!
//! # Usage
//!
//! Acquire until Ctrl-C, with simulated hardware:
//! ```bash
//! cryo_daq acquire --config config/default.toml --simulate
//! ```
//!
//! Run a sequence:
//! ```bash
//! cryo_daq sequence ramps.toml --simulate
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cryo_daq::acquisition::{AcquisitionLoop, CsvSink, RunPlan};
use cryo_daq::config::{LockinSettings, Settings};
use cryo_daq::link::{SerialLink, SimulatedLockinLink};
use cryo_daq::lockin::{Dsp52xx, Dsp72xx, Lockin, LockinModel, Sr830};
use cryo_daq::ppms::{MockPpms, Ppms};
use cryo_daq::sequencer::{Sequence, SequenceOutcome, Sequencer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Signal fed to simulated lock-ins, in volts.
const SIMULATED_SIGNAL_V: f64 = 5.0e-3;

#[derive(Parser)]
#[command(name = "cryo_daq")]
#[command(about = "Headless acquisition and sequencing for lock-ins and a PPMS controller", long_about = None)]
struct Cli {
    /// Path to the configuration file (defaults to config/default.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the acquisition loop until Ctrl-C
    Acquire {
        /// Replace all hardware with register-level simulations
        #[arg(long)]
        simulate: bool,
    },

    /// Run a sequence file against the controller
    Sequence {
        /// Path to a TOML sequence file
        file: PathBuf,

        /// Replace the controller with an in-memory simulation
        #[arg(long)]
        simulate: bool,
    },

    /// Parse a sequence file and list its steps without touching hardware
    SequenceCheck {
        /// Path to a TOML sequence file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Acquire { simulate } => {
            let settings = load_settings(cli.config.as_deref(), true)?;
            init_logging(&settings.log_level);
            acquire(&settings, simulate).await
        }
        Commands::Sequence { file, simulate } => {
            // Sequence runs only need timing settings; fall back to the
            // defaults when no configuration file is around.
            let settings = load_settings(cli.config.as_deref(), false)?;
            init_logging(&settings.log_level);
            run_sequence(&settings, &file, simulate).await
        }
        Commands::SequenceCheck { file } => {
            init_logging("info");
            check_sequence(&file)
        }
    }
}

fn init_logging(filter: &str) {
    env_logger::Builder::new().parse_filters(filter).init();
}

fn load_settings(path: Option<&std::path::Path>, required: bool) -> Result<Settings> {
    match path {
        Some(path) => {
            let path = path.to_string_lossy();
            Settings::from_path(&path).with_context(|| format!("loading settings from {path}"))
        }
        None => match Settings::new(None) {
            Ok(settings) => Ok(settings),
            Err(err) if !required => {
                eprintln!("No usable config/default settings ({err}); using defaults");
                Ok(Settings::default())
            }
            Err(err) => Err(err).context("loading settings from config/default"),
        },
    }
}

async fn acquire(settings: &Settings, simulate: bool) -> Result<()> {
    let mut lockins: Vec<Arc<dyn Lockin>> = Vec::with_capacity(settings.lockins.len());
    for (index, lockin) in settings.lockins.iter().enumerate() {
        lockins.push(build_lockin(lockin, index, simulate).await?);
    }

    let ppms = match &settings.ppms {
        Some(ppms_settings) if simulate => {
            let client = MockPpms::new();
            client.enable_auto_status();
            Some(Arc::new(Ppms::new(Box::new(client), ppms_settings)))
        }
        Some(_) => {
            log::warn!(
                "Controller configured but no vendor client is available in this binary; \
                 controller columns are skipped (use --simulate or the library API)"
            );
            None
        }
        None => None,
    };

    let acquisition = AcquisitionLoop::new(RunPlan {
        lockins,
        ppms,
        tick_delay: settings.acquisition.tick_delay,
    });

    let stop = acquisition.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-C received; stopping after the current tick");
            stop.request_stop();
        }
    });

    let metadata = serde_json::json!({
        "started": chrono::Local::now().to_rfc3339(),
        "simulated": simulate,
        "lockins": settings
            .lockins
            .iter()
            .map(|l| format!("{} @ {}", l.model, l.port))
            .collect::<Vec<_>>(),
        "controller": settings.ppms.is_some(),
    });

    let mut sink = CsvSink::new(&settings.storage.default_path).with_metadata(metadata);
    let rows = acquisition.run(&mut sink).await?;
    println!("Acquisition finished: {rows} row(s) written");
    Ok(())
}

async fn build_lockin(
    settings: &LockinSettings,
    index: usize,
    simulate: bool,
) -> Result<Arc<dyn Lockin>> {
    let name = format!("Lock-In {} ({})", index + 1, settings.model);

    if simulate {
        let link = SimulatedLockinLink::new(settings.model, SIMULATED_SIGNAL_V)
            .with_noise(SIMULATED_SIGNAL_V * 0.02);
        return Ok(match settings.model {
            LockinModel::Sr830 => Arc::new(Sr830::new(name, link)),
            LockinModel::Dsp72xx => Arc::new(Dsp72xx::new(name, link)),
            LockinModel::Dsp52xx => Arc::new(Dsp52xx::new(name, link)),
        });
    }

    let device: Arc<dyn Lockin> = match settings.model {
        LockinModel::Sr830 => {
            let mut link = SerialLink::new(settings.port.clone(), settings.baud_rate);
            link.connect().await?;
            Arc::new(Sr830::new(name, link))
        }
        LockinModel::Dsp72xx => {
            let mut link = SerialLink::new(settings.port.clone(), settings.baud_rate);
            link.connect().await?;
            Arc::new(Dsp72xx::new(name, link))
        }
        LockinModel::Dsp52xx => {
            // Slow responder: long timeout plus pacing between commands.
            let mut link = SerialLink::new(settings.port.clone(), settings.baud_rate)
                .with_timeout(Duration::from_millis(12_000))
                .with_query_delay(Duration::from_millis(100))
                .with_command_gap(Duration::from_millis(100));
            link.connect().await?;
            Arc::new(Dsp52xx::new(name, link))
        }
    };
    Ok(device)
}

async fn run_sequence(settings: &Settings, file: &PathBuf, simulate: bool) -> Result<()> {
    let sequence = read_sequence(file)?;
    if sequence.is_empty() {
        bail!("sequence file {} contains no steps", file.display());
    }

    let ppms_settings = settings.ppms.clone().unwrap_or_default();
    if !simulate {
        bail!(
            "a controller client is only available with --simulate; \
             wire a vendor client through the library API for live runs"
        );
    }
    let client = MockPpms::new();
    client.enable_auto_status();
    let ppms = Arc::new(Ppms::new(Box::new(client), &ppms_settings));

    let sequencer = Sequencer::new(ppms)
        .with_check_interval(settings.sequencer.check_interval)
        .with_step_timeout(settings.sequencer.step_timeout);

    println!("Running {} step(s) from {}", sequence.len(), file.display());
    let handle = sequencer.start(sequence);

    let stopper = handle.stopper();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-C received; aborting sequence");
            if let Err(err) = stopper.request_stop().await {
                log::warn!("Stop request failed: {err}");
            }
        }
    });

    match handle.join().await? {
        SequenceOutcome::Finished => println!("Sequence finished."),
        SequenceOutcome::Stopped => println!("Sequence aborted."),
    }
    Ok(())
}

fn check_sequence(file: &PathBuf) -> Result<()> {
    let sequence = read_sequence(file)?;
    println!("{}: {} step(s)", file.display(), sequence.len());
    for (index, step) in sequence.steps().iter().enumerate() {
        match step.target_status() {
            Some(target) => println!("  {}. {} (until '{target}')", index + 1, step.label()),
            None => println!("  {}. {}", index + 1, step.label()),
        }
    }
    Ok(())
}

fn read_sequence(file: &PathBuf) -> Result<Sequence> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading sequence file {}", file.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing sequence file {}", file.display()))
}
